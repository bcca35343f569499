//! Streamed encoder inputs and the measuring pre-pass.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use crate::format::{
    AGM_VERSION, AgmError, AgmHeader, AgmResult, WavCompatHeader, build_wav_header,
};
use crate::schema::ConfigError;

/// Raw palette-indexed frames (one byte per pixel), read sequentially.
pub struct VideoSource {
    reader: Box<dyn Read + Send>,
    len: u64,
    consumed: u64,
}

impl VideoSource {
    /// Open a file of concatenated raw frames.
    pub fn open<P: AsRef<Path>>(path: P) -> AgmResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            AgmError::Io(io::Error::new(
                e.kind(),
                format!("video source '{}': {}", path.display(), e),
            ))
        })?;
        let len = file.metadata()?.len();
        Ok(Self {
            reader: Box::new(BufReader::new(file)),
            len,
            consumed: 0,
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self {
            reader: Box::new(Cursor::new(bytes)),
            len,
            consumed: 0,
        }
    }

    /// Concatenate individual frame buffers.
    pub fn from_frames<F: AsRef<[u8]>>(frames: &[F]) -> Self {
        Self::from_bytes(frames.iter().flat_map(|f| f.as_ref().iter().copied()).collect())
    }

    /// Total source length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of frames, counting a short trailing frame.
    pub fn frame_count(&self, frame_size: usize) -> u64 {
        if frame_size == 0 {
            return 0;
        }
        self.len.div_ceil(frame_size as u64)
    }

    /// Read up to `max` frames. The last short frame is zero-padded.
    pub fn read_frames(&mut self, max: usize, frame_size: usize) -> AgmResult<Vec<Vec<u8>>> {
        let mut frames = Vec::with_capacity(max);
        while frames.len() < max && self.consumed < self.len {
            let mut frame = Vec::with_capacity(frame_size);
            let read = self
                .reader
                .by_ref()
                .take(frame_size as u64)
                .read_to_end(&mut frame)?;
            if read == 0 {
                return Err(AgmError::truncated(format!(
                    "video source ended at byte {} of {}",
                    self.consumed, self.len
                )));
            }
            self.consumed += read as u64;
            if read < frame_size {
                log::warn!(
                    "last video frame is {} of {} bytes, zero-padding",
                    read,
                    frame_size
                );
                frame.resize(frame_size, 0);
            }
            frames.push(frame);
        }
        Ok(frames)
    }
}

/// 8-bit mono PCM audio taken from a WAV file.
pub struct AudioSource {
    header: WavCompatHeader,
    reader: Box<dyn Read + Send>,
    len: u64,
    consumed: u64,
}

impl AudioSource {
    /// Open a WAV file.
    pub fn open<P: AsRef<Path>>(path: P) -> AgmResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            AgmError::Io(io::Error::new(
                e.kind(),
                format!("audio source '{}': {}", path.display(), e),
            ))
        })?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parse WAV bytes held in memory.
    pub fn from_wav_bytes(bytes: Vec<u8>) -> AgmResult<Self> {
        Self::from_reader(Cursor::new(bytes))
    }

    /// Raw samples with a synthesized header.
    pub fn from_pcm(sample_rate: u32, samples: Vec<u8>) -> Self {
        let len = samples.len() as u64;
        Self {
            header: WavCompatHeader::synthesize(sample_rate),
            reader: Box::new(Cursor::new(samples)),
            len,
            consumed: 0,
        }
    }

    /// Read the 76-byte header prefix, then position at the `data` chunk.
    pub fn from_reader<R: Read + Seek + Send + 'static>(mut r: R) -> AgmResult<Self> {
        let total_len = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(0))?;

        let mut prefix = [0u8; WavCompatHeader::SIZE];
        r.read_exact(&mut prefix).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                AgmError::format(format!(
                    "WAV source has {} bytes, need at least {}",
                    total_len,
                    WavCompatHeader::SIZE
                ))
            } else {
                AgmError::Io(e)
            }
        })?;
        let header = build_wav_header(&prefix)?;

        let (data_offset, len) = locate_data_chunk(&mut r, total_len)?;
        r.seek(SeekFrom::Start(data_offset))?;
        log::debug!(
            "audio: {} Hz, {} sample bytes at offset {}",
            header.sample_rate(),
            len,
            data_offset
        );

        Ok(Self {
            header,
            reader: Box::new(r.take(len)),
            len,
            consumed: 0,
        })
    }

    /// Header to embed in the output file.
    pub fn header(&self) -> &WavCompatHeader {
        &self.header
    }

    pub fn sample_rate(&self) -> u32 {
        self.header.sample_rate()
    }

    /// Number of sample bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read exactly `n` bytes, zero-padding once the source is exhausted.
    pub fn read_slice(&mut self, n: usize) -> AgmResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(n);
        let read = self.reader.by_ref().take(n as u64).read_to_end(&mut buf)?;
        self.consumed += read as u64;
        if read < n && self.consumed < self.len {
            return Err(AgmError::truncated(format!(
                "audio source ended at byte {} of {}",
                self.consumed, self.len
            )));
        }
        buf.resize(n, 0);
        Ok(buf)
    }
}

/// Walk RIFF chunks to find `data`. Falls back to everything after the
/// 76-byte prefix when no data chunk is present.
fn locate_data_chunk<R: Read + Seek>(r: &mut R, total_len: u64) -> AgmResult<(u64, u64)> {
    r.seek(SeekFrom::Start(0))?;
    let mut riff = [0u8; 12];
    r.read_exact(&mut riff)?;
    if &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE" {
        return Err(AgmError::format("audio source is not a RIFF/WAVE file"));
    }

    let mut pos = 12u64;
    while pos + 8 <= total_len {
        r.seek(SeekFrom::Start(pos))?;
        let mut chunk = [0u8; 8];
        r.read_exact(&mut chunk)?;
        let size = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]) as u64;
        let body = pos + 8;

        match &chunk[0..4] {
            b"data" => {
                let available = total_len - body;
                // Streamed WAVs may leave the size at 0 or oversize it.
                let len = if size == 0 || size > available {
                    available
                } else {
                    size
                };
                return Ok((body, len));
            }
            b"fmt " if size >= 16 => {
                let mut fmt = [0u8; 16];
                r.read_exact(&mut fmt)?;
                let channels = u16::from_le_bytes([fmt[2], fmt[3]]);
                let bits = u16::from_le_bytes([fmt[14], fmt[15]]);
                if channels != 1 || bits != 8 {
                    log::warn!(
                        "audio is {channels} channel(s) at {bits} bits, stored as raw bytes"
                    );
                }
            }
            _ => {}
        }
        // Chunks are word aligned.
        pos = body + size + (size & 1);
    }

    log::warn!("no data chunk in WAV source, using bytes after the header");
    Ok((
        WavCompatHeader::SIZE as u64,
        total_len.saturating_sub(WavCompatHeader::SIZE as u64),
    ))
}

/// Everything the fixed headers need, measured before any output is written.
#[derive(Debug, Clone)]
pub struct MoviePlan {
    pub wav_header: WavCompatHeader,
    pub header: AgmHeader,
    pub sample_rate: u32,
    pub audio_len: u64,
    pub video_len: u64,
}

impl MoviePlan {
    pub fn frame_size(&self) -> usize {
        self.header.frame_size()
    }

    /// One segment per second of media.
    pub fn segment_count(&self) -> u64 {
        self.header.total_secs as u64
    }

    /// Frames carried by segment `index`.
    pub fn frames_in_segment(&self, index: u64) -> usize {
        let fps = self.header.frame_rate as u64;
        let start = index * fps;
        let end = (start + fps).min(self.header.total_frames as u64);
        end.saturating_sub(start) as usize
    }
}

/// Measuring pre-pass: compute frame count and duration for the headers.
///
/// Rejects bad geometry and empty sources before any byte is written.
pub fn plan_movie(
    video: &VideoSource,
    audio: &AudioSource,
    width: u16,
    height: u16,
    frame_rate: u8,
) -> AgmResult<MoviePlan> {
    if width == 0 || height == 0 {
        return Err(ConfigError::InvalidDimensions.into());
    }
    if frame_rate == 0 {
        return Err(ConfigError::InvalidFrameRate.into());
    }
    let sample_rate = audio.sample_rate();
    if sample_rate == 0 {
        return Err(ConfigError::InvalidSampleRate.into());
    }
    if video.is_empty() && audio.is_empty() {
        return Err(AgmError::format("both video and audio sources are empty"));
    }

    let frame_size = width as usize * height as usize;
    let total_frames = video.frame_count(frame_size);
    let total_secs =
        AgmHeader::compute_total_secs(total_frames, frame_rate as u32, audio.len(), sample_rate);

    let total_frames = u32::try_from(total_frames).map_err(|_| {
        AgmError::format(format!("{total_frames} frames exceed the u32 header field"))
    })?;
    let total_secs = u32::try_from(total_secs).map_err(|_| {
        AgmError::format(format!("{total_secs} seconds exceed the u32 header field"))
    })?;

    let header = AgmHeader {
        version: AGM_VERSION,
        width,
        height,
        frame_rate,
        total_frames,
        total_secs,
    };
    log::info!(
        "plan: {}x{} @ {} fps, {} frames, {} Hz audio ({} bytes), {} s",
        width,
        height,
        frame_rate,
        total_frames,
        sample_rate,
        audio.len(),
        total_secs
    );

    Ok(MoviePlan {
        wav_header: audio.header().clone(),
        header,
        sample_rate,
        audio_len: audio.len(),
        video_len: video.len(),
    })
}
