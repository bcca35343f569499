//! Demux module - reads an AGM file back into per-second segments.
//!
//! The decoder is a plain iterator: each call reads one record, splits it
//! into units and routes decompressed payloads to the audio buffer or the
//! frame list.

mod decoder;

pub use decoder::{AgmReader, Segment, SegmentDecoder};
