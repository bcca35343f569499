//! Presentation collaborators: palette conversion and output sinks.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::{Rgba, RgbaImage};

use crate::format::{AgmError, AgmHeader, AgmResult};

/// 256-entry RGB palette for indexed frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<[u8; 3]>,
}

impl Palette {
    /// Size of a `.pal` file: 256 RGB triples.
    pub const FILE_SIZE: usize = 256 * 3;

    /// Index `i` maps to gray level `i`.
    pub fn grayscale() -> Self {
        Self {
            colors: (0..=255u8).map(|i| [i, i, i]).collect(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> AgmResult<Self> {
        if bytes.len() != Self::FILE_SIZE {
            return Err(AgmError::format(format!(
                "palette is {} bytes, expected {}",
                bytes.len(),
                Self::FILE_SIZE
            )));
        }
        Ok(Self {
            colors: bytes.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect(),
        })
    }

    /// Load a raw 768-byte palette file.
    pub fn load<P: AsRef<Path>>(path: P) -> AgmResult<Self> {
        Self::from_bytes(&fs::read(path)?)
    }

    pub fn rgb(&self, index: u8) -> [u8; 3] {
        self.colors[index as usize]
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self::grayscale()
    }
}

/// Expand a one-byte-per-pixel frame into an opaque RGBA bitmap.
pub fn indexed_to_rgba(
    frame: &[u8],
    width: u32,
    height: u32,
    palette: &Palette,
) -> AgmResult<RgbaImage> {
    let expected = width as usize * height as usize;
    if frame.len() != expected {
        return Err(AgmError::format(format!(
            "frame is {} bytes, expected {}x{} = {}",
            frame.len(),
            width,
            height,
            expected
        )));
    }
    Ok(RgbaImage::from_fn(width, height, |x, y| {
        let [r, g, b] = palette.rgb(frame[(y * width + x) as usize]);
        Rgba([r, g, b, 255])
    }))
}

/// Receives decoded frames in presentation order.
pub trait FrameSink {
    fn present(&mut self, index: u64, frame: &[u8], header: &AgmHeader) -> AgmResult<()>;
}

/// Receives one segment of audio. Must not block on playback.
pub trait AudioSink {
    fn play(&mut self, samples: &[u8], sample_rate: u32);
}

/// Writes each presented frame as `frame_NNNNNN.png`.
pub struct PngDumpSink {
    dir: PathBuf,
    palette: Palette,
    written: u64,
}

impl PngDumpSink {
    /// Create the output directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P, palette: Palette) -> AgmResult<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            palette,
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("frame_{index:06}.png"))
    }
}

impl FrameSink for PngDumpSink {
    fn present(&mut self, index: u64, frame: &[u8], header: &AgmHeader) -> AgmResult<()> {
        let bitmap = indexed_to_rgba(
            frame,
            header.width as u32,
            header.height as u32,
            &self.palette,
        )?;
        let path = self.frame_path(index);
        bitmap.save(&path).map_err(|e| AgmError::Io(io::Error::other(e)))?;
        log::debug!("wrote {}", path.display());
        self.written += 1;
        Ok(())
    }
}

/// Frame sink that discards frames.
#[derive(Debug, Default)]
pub struct NullFrameSink;

impl FrameSink for NullFrameSink {
    fn present(&mut self, _index: u64, _frame: &[u8], _header: &AgmHeader) -> AgmResult<()> {
        Ok(())
    }
}

/// Audio sink that only logs.
#[derive(Debug, Default)]
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn play(&mut self, samples: &[u8], sample_rate: u32) {
        log::debug!("audio: {} samples @ {} Hz", samples.len(), sample_rate);
    }
}
