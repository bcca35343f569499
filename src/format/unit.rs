//! Units and chunk framing.
//!
//! A unit is one mask byte followed by `(len: u32, bytes[len])` chunks and
//! a zero-length terminator. Chunking only bounds transfer size; it never
//! changes the payload.

use std::io::{Read, Write};

use super::codec::CodecId;
use super::error::{AgmError, AgmResult, eof_as_truncated};
use crate::schema::ConfigError;

/// Mask bit set for video units.
const VIDEO_BIT: u8 = 0b1000_0000;

/// Mask bits carrying the GCOL mode.
pub const GCOL_MASK: u8 = 0b0000_0111;

/// Stream a unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Audio,
    Video,
}

/// A decoded unit: type/codec tag plus the reassembled payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub kind: UnitKind,
    pub codec: CodecId,
    /// GCOL mode (bits 0-2 of the mask).
    pub gcol: u8,
    pub payload: Vec<u8>,
}

impl Unit {
    pub fn new(kind: UnitKind, codec: CodecId, gcol: u8, payload: Vec<u8>) -> Self {
        Self {
            kind,
            codec,
            gcol,
            payload,
        }
    }

    pub fn mask(&self) -> AgmResult<u8> {
        build_mask(self.kind, self.codec, self.gcol)
    }

    /// Write this unit, returning the number of bytes emitted.
    pub fn write_to<W: Write>(&self, w: &mut W, chunk_size: usize) -> AgmResult<u64> {
        write_unit(w, self.mask()?, &self.payload, chunk_size)
    }
}

/// Build the mask byte for a unit.
pub fn build_mask(kind: UnitKind, codec: CodecId, gcol: u8) -> AgmResult<u8> {
    if gcol & !GCOL_MASK != 0 {
        return Err(ConfigError::InvalidGcol(gcol).into());
    }
    let kind_bit = match kind {
        UnitKind::Audio => 0,
        UnitKind::Video => VIDEO_BIT,
    };
    Ok(kind_bit | codec.mask_bits() | gcol)
}

/// Split a mask byte into its fields.
pub fn parse_mask(mask: u8) -> AgmResult<(UnitKind, CodecId, u8)> {
    let kind = if mask & VIDEO_BIT != 0 {
        UnitKind::Video
    } else {
        UnitKind::Audio
    };
    let codec = CodecId::from_mask(mask)
        .ok_or_else(|| AgmError::format(format!("unit mask {mask:#010b} has no codec")))?;
    if mask & 0b0110_0000 != 0 {
        log::debug!("unit mask {mask:#010b} has unused bits set");
    }
    Ok((kind, codec, mask & GCOL_MASK))
}

/// Number of bytes `write_unit` emits for a payload.
pub fn encoded_len(payload_len: usize, chunk_size: usize) -> usize {
    let chunk_size = effective_chunk_size(chunk_size);
    let chunks = payload_len.div_ceil(chunk_size);
    1 + chunks * 4 + payload_len + 4
}

fn effective_chunk_size(chunk_size: usize) -> usize {
    chunk_size.clamp(1, u32::MAX as usize)
}

/// Write mask, chunks and terminator for `payload`.
pub fn write_unit<W: Write>(
    w: &mut W,
    mask: u8,
    payload: &[u8],
    chunk_size: usize,
) -> AgmResult<u64> {
    if chunk_size == 0 {
        return Err(ConfigError::InvalidChunkSize.into());
    }
    let chunk_size = effective_chunk_size(chunk_size);

    w.write_all(&[mask])?;
    let mut written = 1u64;
    for chunk in payload.chunks(chunk_size) {
        w.write_all(&(chunk.len() as u32).to_le_bytes())?;
        w.write_all(chunk)?;
        written += 4 + chunk.len() as u64;
    }
    w.write_all(&0u32.to_le_bytes())?;
    Ok(written + 4)
}

/// Encode a unit into a fresh buffer.
pub fn encode_unit(
    kind: UnitKind,
    codec: CodecId,
    gcol: u8,
    payload: &[u8],
    chunk_size: usize,
) -> AgmResult<Vec<u8>> {
    let mask = build_mask(kind, codec, gcol)?;
    let mut out = Vec::with_capacity(encoded_len(payload.len(), chunk_size));
    write_unit(&mut out, mask, payload, chunk_size)?;
    Ok(out)
}

/// Read one unit, reassembling its chunks.
///
/// Fails with `TruncatedStream` when the input ends before the mask, a
/// length field or the promised chunk bytes.
pub fn decode_unit<R: Read>(r: &mut R) -> AgmResult<Unit> {
    let mut mask = [0u8; 1];
    r.read_exact(&mut mask)
        .map_err(|e| eof_as_truncated(e, || "unit mask".to_string()))?;
    let (kind, codec, gcol) = parse_mask(mask[0])?;

    let mut payload = Vec::new();
    let mut chunk_index = 0usize;
    loop {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf).map_err(|e| {
            eof_as_truncated(e, || format!("length of chunk {chunk_index}"))
        })?;
        let len = u32::from_le_bytes(len_buf) as u64;
        if len == 0 {
            break;
        }

        // take() bounds the allocation by what is actually present.
        let read = r.by_ref().take(len).read_to_end(&mut payload)? as u64;
        if read < len {
            return Err(AgmError::truncated(format!(
                "chunk {chunk_index} promised {len} bytes, got {read}"
            )));
        }
        chunk_index += 1;
    }

    Ok(Unit {
        kind,
        codec,
        gcol,
        payload,
    })
}
