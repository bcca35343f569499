//! Fixed-layout file headers: the WAV-compatible prefix and the AGM header.

use std::io::{self, Read, Write};

use super::error::{AgmError, AgmResult};

/// Magic bytes identifying the AGM header.
pub const AGM_MAGIC: &[u8; 6] = b"AGNMOV";

/// Current format version.
pub const AGM_VERSION: u8 = 1;

/// Marker written over bytes 12..15 of the WAV prefix.
pub const AGM_MARKER: &[u8; 3] = b"agm";

const MARKER_OFFSET: usize = 12;
const SAMPLE_RATE_OFFSET: usize = 24;

/// WAV header prefix carried by every AGM file.
///
/// Bytes 12..15 hold `"agm"` so ordinary WAV players refuse the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavCompatHeader {
    bytes: [u8; WavCompatHeader::SIZE],
}

/// Copy the first 76 bytes of a source WAV file and stamp the AGM marker.
pub fn build_wav_header(source: &[u8]) -> AgmResult<WavCompatHeader> {
    let prefix = source.get(..WavCompatHeader::SIZE).ok_or_else(|| {
        AgmError::format(format!(
            "WAV source has {} bytes, need at least {}",
            source.len(),
            WavCompatHeader::SIZE
        ))
    })?;
    let mut bytes = [0u8; WavCompatHeader::SIZE];
    bytes.copy_from_slice(prefix);
    bytes[MARKER_OFFSET..MARKER_OFFSET + AGM_MARKER.len()].copy_from_slice(AGM_MARKER);
    Ok(WavCompatHeader { bytes })
}

impl WavCompatHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 76;

    /// Build an 8-bit mono PCM header from scratch.
    ///
    /// ```text
    /// [0-3]   "RIFF"        [4-7]   riff size (unknown, 0)
    /// [8-11]  "WAVE"        [12-15] "agm " (was "fmt ")
    /// [16-19] 16            [20-21] 1 (PCM)     [22-23] 1 channel
    /// [24-27] sample_rate   [28-31] byte_rate   [32-33] block_align
    /// [34-35] 8 bits
    /// [36-39] "JUNK"        [40-43] 24          [44-67] zero padding
    /// [68-71] "data"        [72-75] data size (unknown, 0)
    /// ```
    pub fn synthesize(sample_rate: u32) -> Self {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(b"RIFF");
        b[8..12].copy_from_slice(b"WAVE");
        b[12..16].copy_from_slice(b"fmt ");
        b[16..20].copy_from_slice(&16u32.to_le_bytes());
        b[20..22].copy_from_slice(&1u16.to_le_bytes());
        b[22..24].copy_from_slice(&1u16.to_le_bytes());
        b[24..28].copy_from_slice(&sample_rate.to_le_bytes());
        b[28..32].copy_from_slice(&sample_rate.to_le_bytes());
        b[32..34].copy_from_slice(&1u16.to_le_bytes());
        b[34..36].copy_from_slice(&8u16.to_le_bytes());
        b[36..40].copy_from_slice(b"JUNK");
        b[40..44].copy_from_slice(&24u32.to_le_bytes());
        b[68..72].copy_from_slice(b"data");
        b[MARKER_OFFSET..MARKER_OFFSET + AGM_MARKER.len()].copy_from_slice(AGM_MARKER);
        Self { bytes: b }
    }

    /// Wrap raw header bytes, requiring the AGM marker.
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> AgmResult<Self> {
        let header = Self { bytes };
        if !header.is_agm() {
            return Err(AgmError::format("missing 'agm' marker at byte 12"));
        }
        Ok(header)
    }

    pub fn is_agm(&self) -> bool {
        &self.bytes[MARKER_OFFSET..MARKER_OFFSET + AGM_MARKER.len()] == AGM_MARKER
    }

    /// Audio sample rate (little-endian u32 at offset 24).
    pub fn sample_rate(&self) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.bytes[SAMPLE_RATE_OFFSET..SAMPLE_RATE_OFFSET + 4]);
        u32::from_le_bytes(buf)
    }

    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.bytes
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.bytes)
    }

    pub fn read_from<R: Read>(r: &mut R) -> AgmResult<Self> {
        let mut bytes = [0u8; Self::SIZE];
        r.read_exact(&mut bytes).map_err(|e| short_header(e, "WAV"))?;
        Self::from_bytes(bytes)
    }
}

/// AGM metadata header following the WAV prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgmHeader {
    pub version: u8,
    /// Frame width in pixels.
    pub width: u16,
    /// Frame height in pixels.
    pub height: u16,
    /// Frames per second (also frames per segment).
    pub frame_rate: u8,
    /// Total number of video frames.
    pub total_frames: u32,
    /// Duration in whole seconds (= number of segments).
    pub total_secs: u32,
}

impl AgmHeader {
    /// Size of header in bytes.
    /// Magic(6) + Version(1) + Width(2) + Height(2) + FrameRate(1) +
    /// TotalFrames(4) + TotalSecs(4) + Reserved(48) = 68
    pub const SIZE: usize = 68;

    const RESERVED: usize = 48;

    /// Bytes per decoded frame (one palette index per pixel).
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// `ceil(max(total_frames / frame_rate, audio_len / sample_rate))`.
    pub fn compute_total_secs(
        total_frames: u64,
        frame_rate: u32,
        audio_len: u64,
        sample_rate: u32,
    ) -> u64 {
        let video_secs = if frame_rate == 0 {
            0
        } else {
            total_frames.div_ceil(frame_rate as u64)
        };
        let audio_secs = if sample_rate == 0 {
            0
        } else {
            audio_len.div_ceil(sample_rate as u64)
        };
        video_secs.max(audio_secs)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..6].copy_from_slice(AGM_MAGIC);
        b[6] = self.version;
        b[7..9].copy_from_slice(&self.width.to_le_bytes());
        b[9..11].copy_from_slice(&self.height.to_le_bytes());
        b[11] = self.frame_rate;
        b[12..16].copy_from_slice(&self.total_frames.to_le_bytes());
        b[16..20].copy_from_slice(&self.total_secs.to_le_bytes());
        // b[20..68] reserved, zero
        b
    }

    /// Write header to output.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.to_bytes())
    }

    /// Read header from input.
    pub fn read_from<R: Read>(r: &mut R) -> AgmResult<Self> {
        let mut b = [0u8; Self::SIZE];
        r.read_exact(&mut b).map_err(|e| short_header(e, "AGM"))?;
        decode_agm_header(&b)
    }
}

/// A fixed header cut short is a format error, not a truncated stream.
fn short_header(err: io::Error, which: &str) -> AgmError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        AgmError::format(format!("file too short for {which} header"))
    } else {
        AgmError::Io(err)
    }
}

/// Pack a current-version AGM header.
pub fn build_agm_header(
    width: u16,
    height: u16,
    frame_rate: u8,
    total_frames: u32,
    total_secs: u32,
) -> [u8; AgmHeader::SIZE] {
    AgmHeader {
        version: AGM_VERSION,
        width,
        height,
        frame_rate,
        total_frames,
        total_secs,
    }
    .to_bytes()
}

/// Unpack the 68-byte AGM header.
pub fn decode_agm_header(bytes: &[u8]) -> AgmResult<AgmHeader> {
    if bytes.len() < AgmHeader::SIZE {
        return Err(AgmError::format(format!(
            "AGM header needs {} bytes, got {}",
            AgmHeader::SIZE,
            bytes.len()
        )));
    }
    if &bytes[0..6] != AGM_MAGIC {
        return Err(AgmError::format(format!(
            "invalid AGM magic {:?}",
            String::from_utf8_lossy(&bytes[0..6])
        )));
    }

    let u16_at = |o: usize| u16::from_le_bytes([bytes[o], bytes[o + 1]]);
    let u32_at = |o: usize| {
        u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]])
    };

    let header = AgmHeader {
        version: bytes[6],
        width: u16_at(7),
        height: u16_at(9),
        frame_rate: bytes[11],
        total_frames: u32_at(12),
        total_secs: u32_at(16),
    };
    if header.version != AGM_VERSION {
        log::warn!(
            "AGM version {} (reader understands {})",
            header.version,
            AGM_VERSION
        );
    }
    if bytes[20..20 + AgmHeader::RESERVED].iter().any(|&b| b != 0) {
        log::debug!("AGM header has non-zero reserved bytes");
    }
    Ok(header)
}
