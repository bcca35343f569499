//! Configuration types for encoding and playback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::format::CodecId;

fn default_chunk_size() -> usize {
    4096
}

fn default_prefetch_timeout_ms() -> u64 {
    5000
}

fn default_realtime() -> bool {
    true
}

/// External program invocation for one codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program and arguments that compress stdin to stdout.
    pub compress: Vec<String>,
    /// Program and arguments that decompress stdin to stdout.
    pub decompress: Vec<String>,
}

/// How a codec id is provided: one command, or a chain of commands
/// applied in order (e.g. SRLE2 = RLE2 then SZIP).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodecSpec {
    Command(CommandSpec),
    Chain(Vec<CommandSpec>),
}

/// Per-segment encoding policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Codec for video units. Audio is always raw.
    #[serde(default)]
    pub codec: CodecId,
    /// Maximum bytes per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Compress all frames of a segment as one video unit instead of one
    /// unit per frame.
    #[serde(default)]
    pub batch_frames: bool,
    /// GCOL mode stored in video unit masks (0-7).
    #[serde(default)]
    pub gcol: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: CodecId::Raw,
            chunk_size: default_chunk_size(),
            batch_frames: false,
            gcol: 0,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > u32::MAX as usize {
            return Err(ConfigError::InvalidChunkSize);
        }
        if self.gcol > 7 {
            return Err(ConfigError::InvalidGcol(self.gcol));
        }
        Ok(())
    }
}

/// A complete encode job, as read from JSON by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeConfig {
    /// Raw indexed frames, `width * height` bytes each, concatenated.
    pub video: PathBuf,
    /// 8-bit mono PCM WAV file.
    pub audio: PathBuf,
    /// Output `.agm` path.
    pub output: PathBuf,
    /// Frame width in pixels.
    pub width: u16,
    /// Frame height in pixels.
    pub height: u16,
    /// Frames per second.
    pub frame_rate: u8,
    #[serde(default)]
    pub encoder: EncoderConfig,
    /// External codec programs by codec id.
    #[serde(default)]
    pub codecs: HashMap<CodecId, CodecSpec>,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            video: PathBuf::from("frames.raw"),
            audio: PathBuf::from("audio.wav"),
            output: PathBuf::from("movie.agm"),
            width: 160,
            height: 120,
            frame_rate: 12,
            encoder: EncoderConfig::default(),
            codecs: HashMap::new(),
        }
    }
}

impl EncodeConfig {
    /// Bytes per frame.
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions);
        }
        if self.frame_rate == 0 {
            return Err(ConfigError::InvalidFrameRate);
        }
        self.encoder.validate()?;
        if self.encoder.codec != CodecId::Raw && !self.codecs.contains_key(&self.encoder.codec) {
            return Err(ConfigError::MissingCodec(self.encoder.codec));
        }
        Ok(())
    }
}

/// Player settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// How long to wait for a prefetched segment before giving up.
    #[serde(default = "default_prefetch_timeout_ms")]
    pub prefetch_timeout_ms: u64,
    /// Pace frames at the file's frame rate. Off = present as fast as possible.
    #[serde(default = "default_realtime")]
    pub realtime: bool,
    /// External codec programs by codec id.
    #[serde(default)]
    pub codecs: HashMap<CodecId, CodecSpec>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            prefetch_timeout_ms: default_prefetch_timeout_ms(),
            realtime: default_realtime(),
            codecs: HashMap::new(),
        }
    }
}

impl PlaybackConfig {
    #[inline]
    pub fn prefetch_timeout(&self) -> Duration {
        Duration::from_millis(self.prefetch_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch_timeout_ms == 0 {
            return Err(ConfigError::InvalidPrefetchTimeout);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Frame dimensions (width, height) must be non-zero")]
    InvalidDimensions,
    #[error("Frame rate must be non-zero")]
    InvalidFrameRate,
    #[error("Sample rate must be non-zero")]
    InvalidSampleRate,
    #[error("Chunk size must be between 1 and {}", u32::MAX)]
    InvalidChunkSize,
    #[error("GCOL mode {0} does not fit in 3 bits")]
    InvalidGcol(u8),
    #[error("The raw codec is built in and cannot be replaced")]
    RawCodecReserved,
    #[error("Codec {codec} has an empty command")]
    EmptyCodecCommand { codec: String },
    #[error("Codec {0} is selected but not configured")]
    MissingCodec(CodecId),
    #[error("Prefetch timeout must be positive")]
    InvalidPrefetchTimeout,
}
