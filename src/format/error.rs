//! Error taxonomy shared by the muxer, demuxer and player.

use std::io;

use super::codec::CodecId;
use crate::schema::ConfigError;

/// Result alias used throughout the crate.
pub type AgmResult<T> = Result<T, AgmError>;

/// Errors raised while encoding, decoding or playing an AGM file.
#[derive(Debug, thiserror::Error)]
pub enum AgmError {
    /// Bad magic, missing marker, short header or impossible record size.
    #[error("Format error: {0}")]
    Format(String),

    /// The stream ended inside a record. Decoders treat this as end-of-stream.
    #[error("Truncated stream: {context}")]
    TruncatedStream { context: String },

    /// A unit referenced a codec that is not registered.
    #[error("No codec registered for {0}")]
    UnknownCodec(CodecId),

    /// A codec transform failed.
    #[error("Codec {codec} failed: {message}")]
    CodecFailure { codec: String, message: String },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Wraps an error with the segment (and unit) it occurred in.
    #[error("Segment {segment}{} at byte offset {offset}: {source}", unit_suffix(.unit))]
    InSegment {
        segment: u64,
        unit: Option<usize>,
        offset: u64,
        #[source]
        source: Box<AgmError>,
    },
}

impl AgmError {
    pub fn format(msg: impl Into<String>) -> Self {
        AgmError::Format(msg.into())
    }

    pub fn truncated(context: impl Into<String>) -> Self {
        AgmError::TruncatedStream {
            context: context.into(),
        }
    }

    pub fn codec_failure(codec: impl Into<String>, message: impl Into<String>) -> Self {
        AgmError::CodecFailure {
            codec: codec.into(),
            message: message.into(),
        }
    }

    /// Attach segment index and byte offset.
    pub fn in_segment(self, segment: u64, offset: u64) -> Self {
        self.located(segment, None, offset)
    }

    /// Attach segment index, unit index and byte offset.
    pub fn located(self, segment: u64, unit: Option<usize>, offset: u64) -> Self {
        match self {
            // Keep the innermost location.
            e @ AgmError::InSegment { .. } => e,
            e => AgmError::InSegment {
                segment,
                unit,
                offset,
                source: Box::new(e),
            },
        }
    }

    /// Error with any segment context stripped.
    pub fn root(&self) -> &AgmError {
        match self {
            AgmError::InSegment { source, .. } => source.root(),
            e => e,
        }
    }

    /// True if this error means "the stream ends here" rather than corruption.
    pub fn is_truncation(&self) -> bool {
        matches!(self.root(), AgmError::TruncatedStream { .. })
    }

    /// True if decoding cannot continue past this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.root(), AgmError::CodecFailure { .. })
    }
}

fn unit_suffix(unit: &Option<usize>) -> String {
    unit.map(|u| format!(", unit {u}")).unwrap_or_default()
}

/// Map an `UnexpectedEof` from `read_exact` to a truncation error.
pub(crate) fn eof_as_truncated(err: io::Error, context: impl FnOnce() -> String) -> AgmError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        AgmError::truncated(context())
    } else {
        AgmError::Io(err)
    }
}
