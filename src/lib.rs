//! AGM - Streaming audio/video container for constrained hardware.
//!
//! An AGM file multiplexes palette-indexed video frames with raw 8-bit
//! audio, one segment per second of media, so a player can decode and
//! present it sequentially with a single segment of lookahead.
//!
//! # Architecture
//!
//! - `format`: Binary layout (headers, units, chunks), codec dispatch, errors
//! - `schema`: JSON configuration for encoding and playback
//! - `mux`: Measuring pre-pass and segment encoder
//! - `demux`: Lazy segment decoder
//! - `playback`: Fixed-cadence player with a prefetch worker
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agm::{
//!     demux::AgmReader,
//!     format::CodecRegistry,
//!     mux::{AudioSource, VideoSource, encode_movie, plan_movie},
//!     schema::EncoderConfig,
//! };
//!
//! # fn main() -> agm::AgmResult<()> {
//! let registry = Arc::new(CodecRegistry::new());
//!
//! // Encode two 4x2 frames with 10 bytes of audio
//! let video = VideoSource::from_bytes(vec![1; 16]);
//! let audio = AudioSource::from_pcm(4, (1..=10).collect());
//! let plan = plan_movie(&video, &audio, 4, 2, 2)?;
//! let config = EncoderConfig::default();
//! let (bytes, stats) =
//!     encode_movie(video, audio, &plan, &config, Arc::clone(&registry), Vec::new())?;
//! println!("{}", stats);
//!
//! // Decode it again
//! let reader = AgmReader::new(std::io::Cursor::new(bytes))?;
//! for segment in reader.into_segments(registry)? {
//!     let segment = segment?;
//!     println!("segment {}: {} frames", segment.index, segment.frames.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod demux;
pub mod format;
pub mod mux;
pub mod playback;
pub mod schema;

// Re-export commonly used types
pub use demux::{AgmReader, Segment, SegmentDecoder};
pub use format::{AgmError, AgmHeader, AgmResult, CodecId, CodecRegistry};
pub use mux::{EncodeStats, encode_file};
pub use playback::{PlaybackStats, Player};
pub use schema::{EncodeConfig, EncoderConfig, PlaybackConfig};
