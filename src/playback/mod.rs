//! Playback module - presents decoded segments at the movie's frame rate.
//!
//! The scheduler owns two threads: the presentation loop and one prefetch
//! worker that decodes the next segment while the current one is shown.

mod present;
mod scheduler;

pub use present::{
    AudioSink, FrameSink, NullAudioSink, NullFrameSink, Palette, PngDumpSink, indexed_to_rgba,
};
pub use scheduler::{FramePacer, PlaybackStats, Player, PlayerState, StopReason};
