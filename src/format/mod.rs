//! Binary layout of AGM movie files.
//!
//! AGM multiplexes palette-indexed video frames with raw 8-bit audio for
//! sequential playback on constrained hardware.
//!
//! # File Format
//!
//! ```text
//! [0..76)    WAV-compatible header, bytes 12..15 = "agm",
//!            sample rate = u32 at offset 24
//! [76..144)  AGM header:
//!   Magic: "AGNMOV" (6 bytes)
//!   Version: u8
//!   Width: u16
//!   Height: u16
//!   Frame rate: u8
//!   Total frames: u32
//!   Total seconds: u32
//!   Reserved: 48 bytes
//! [144..EOF) Segments, one per second of media:
//!   Previous segment size: u32
//!   This segment size: u32 (includes these 8 bytes)
//!   Units: audio unit first, then video units
//!
//! Unit:
//!   Mask: u8 (bit 7: video, bits 3-4: codec id, bits 0-2: GCOL mode)
//!   Chunks: (len: u32, bytes[len])*, terminated by len == 0
//! ```
//!
//! All integers are little-endian.

mod codec;
mod error;
mod header;
mod unit;

pub use codec::{
    CODEC_MASK, ChainCodec, Codec, CodecId, CodecRegistry, CommandCodec, FnCodec, RawCodec,
};
pub use error::{AgmError, AgmResult};
pub use header::{
    AGM_MAGIC, AGM_MARKER, AGM_VERSION, AgmHeader, WavCompatHeader, build_agm_header,
    build_wav_header, decode_agm_header,
};
pub use unit::{
    GCOL_MASK, Unit, UnitKind, build_mask, decode_unit, encode_unit, encoded_len, parse_mask,
    write_unit,
};

/// Size of the `(prev_size, this_size)` record header before each segment.
pub const SEGMENT_HEADER_SIZE: usize = 8;

/// Byte offset of the first segment.
pub const FIRST_SEGMENT_OFFSET: u64 = (WavCompatHeader::SIZE + AgmHeader::SIZE) as u64;
