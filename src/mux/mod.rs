//! Muxer: measures the inputs, writes the fixed headers, then streams one
//! segment per second of media.
//!
//! Encoding is two-phase because the headers carry the total duration:
//!
//! ```ignore
//! let video = VideoSource::open("frames.raw")?;
//! let audio = AudioSource::open("audio.wav")?;
//! let plan = plan_movie(&video, &audio, 160, 120, 12)?;
//! let (file, stats) = encode_movie(video, audio, &plan, &config, registry, file)?;
//! ```

mod encoder;
mod source;

pub use encoder::{AgmWriter, EncodeStats, SegmentEncoder, encode_file, encode_movie};
pub use source::{AudioSource, MoviePlan, VideoSource, plan_movie};
