//! Segment decoder (demuxer).

use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use crate::format::{
    AgmError, AgmHeader, AgmResult, CodecRegistry, FIRST_SEGMENT_OFFSET, SEGMENT_HEADER_SIZE,
    UnitKind, WavCompatHeader, decode_unit,
};

/// One decoded second of media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Zero-based position in the file.
    pub index: u64,
    /// Byte offset of the record header.
    pub offset: u64,
    /// Exactly `sample_rate` bytes of 8-bit audio.
    pub audio: Vec<u8>,
    /// Decoded frames, `frame_size` bytes each.
    pub frames: Vec<Vec<u8>>,
}

/// Opened AGM file with validated headers.
///
/// Usage:
/// ```ignore
/// let reader = AgmReader::open("movie.agm")?;
/// println!("{} frames", reader.header().total_frames);
/// for segment in reader.into_segments(registry)? {
///     let segment = segment?;
///     // Use segment...
/// }
/// ```
pub struct AgmReader<R: Read> {
    reader: R,
    wav_header: WavCompatHeader,
    header: AgmHeader,
}

impl AgmReader<BufReader<File>> {
    /// Open an AGM file for decoding.
    pub fn open<P: AsRef<Path>>(path: P) -> AgmResult<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> AgmReader<R> {
    /// Read both headers. Fails with `Format` on a bad marker or magic.
    pub fn new(mut reader: R) -> AgmResult<Self> {
        let wav_header = WavCompatHeader::read_from(&mut reader)?;
        let header = AgmHeader::read_from(&mut reader)?;
        log::info!(
            "AGM v{}: {}x{} @ {} fps, {} frames, {} s, {} Hz audio",
            header.version,
            header.width,
            header.height,
            header.frame_rate,
            header.total_frames,
            header.total_secs,
            wav_header.sample_rate()
        );
        Ok(Self {
            reader,
            wav_header,
            header,
        })
    }

    /// Get AGM header.
    pub fn header(&self) -> &AgmHeader {
        &self.header
    }

    pub fn wav_header(&self) -> &WavCompatHeader {
        &self.wav_header
    }

    pub fn sample_rate(&self) -> u32 {
        self.wav_header.sample_rate()
    }

    /// Consume the reader into a forward-only segment sequence.
    pub fn into_segments(self, registry: Arc<CodecRegistry>) -> AgmResult<SegmentDecoder<R>> {
        if self.header.frame_size() == 0 {
            return Err(AgmError::format("header declares a zero-sized frame"));
        }
        if self.sample_rate() == 0 {
            return Err(AgmError::format("header declares a zero sample rate"));
        }
        let sample_rate = self.sample_rate();
        Ok(SegmentDecoder {
            reader: self.reader,
            registry,
            header: self.header,
            sample_rate,
            index: 0,
            offset: FIRST_SEGMENT_OFFSET,
            prev_size: 0,
            finished: false,
        })
    }
}

/// Lazy, forward-only sequence of segments.
///
/// A stream that ends early (including mid-record) simply ends the
/// sequence. An unknown codec is fatal; a codec failure fails only the
/// current segment.
pub struct SegmentDecoder<R: Read> {
    reader: R,
    registry: Arc<CodecRegistry>,
    header: AgmHeader,
    sample_rate: u32,
    index: u64,
    offset: u64,
    prev_size: u32,
    finished: bool,
}

impl<R: Read> SegmentDecoder<R> {
    pub fn header(&self) -> &AgmHeader {
        &self.header
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Segments consumed so far.
    pub fn position(&self) -> u64 {
        self.index
    }

    fn next_segment(&mut self) -> AgmResult<Option<Segment>> {
        let index = self.index;
        let offset = self.offset;

        let mut head = [0u8; SEGMENT_HEADER_SIZE];
        let got = read_full(&mut self.reader, &mut head)?;
        if got == 0 {
            log::info!("end of stream after {} segment(s)", index);
            return Ok(None);
        }
        if got < SEGMENT_HEADER_SIZE {
            return Err(AgmError::truncated(format!(
                "record header: {got} of {SEGMENT_HEADER_SIZE} bytes"
            )));
        }

        let prev_size = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let this_size = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        if (this_size as usize) < SEGMENT_HEADER_SIZE {
            return Err(AgmError::format(format!(
                "record size {this_size} is smaller than its own header"
            )));
        }
        if prev_size != self.prev_size {
            log::warn!(
                "segment {}: previous size {} recorded, {} observed",
                index,
                prev_size,
                self.prev_size
            );
        }

        let payload_len = (this_size as usize - SEGMENT_HEADER_SIZE) as u64;
        let mut payload = Vec::new();
        let read = self
            .reader
            .by_ref()
            .take(payload_len)
            .read_to_end(&mut payload)? as u64;
        if read < payload_len {
            return Err(AgmError::truncated(format!(
                "payload: {read} of {payload_len} bytes"
            )));
        }

        // The reader now sits on the next boundary, even if decoding fails.
        self.index += 1;
        self.offset += this_size as u64;
        self.prev_size = this_size;

        self.decode_payload(index, offset, &payload).map(Some)
    }

    fn decode_payload(&self, index: u64, offset: u64, payload: &[u8]) -> AgmResult<Segment> {
        let frame_size = self.header.frame_size();
        let payload_offset = offset + SEGMENT_HEADER_SIZE as u64;
        let mut cursor = Cursor::new(payload);
        let mut audio = Vec::with_capacity(self.sample_rate as usize);
        let mut frames = Vec::with_capacity(self.header.frame_rate as usize);

        let mut unit_index = 0usize;
        while (cursor.position() as usize) < payload.len() {
            let unit_offset = payload_offset + cursor.position();
            let locate = |e: AgmError| e.located(index, Some(unit_index), unit_offset);

            let unit = decode_unit(&mut cursor).map_err(locate)?;
            let data = self
                .registry
                .decompress(unit.codec, &unit.payload)
                .map_err(locate)?;

            match unit.kind {
                UnitKind::Audio => audio.extend_from_slice(&data),
                UnitKind::Video => {
                    let mut pieces = data.chunks_exact(frame_size);
                    frames.extend(pieces.by_ref().map(<[u8]>::to_vec));
                    let rest = pieces.remainder();
                    if !rest.is_empty() {
                        log::warn!(
                            "segment {}, unit {}: last frame is {} of {} bytes, zero-padding",
                            index,
                            unit_index,
                            rest.len(),
                            frame_size
                        );
                        let mut frame = rest.to_vec();
                        frame.resize(frame_size, 0);
                        frames.push(frame);
                    }
                }
            }
            unit_index += 1;
        }

        if audio.len() != self.sample_rate as usize {
            log::warn!(
                "segment {}: {} audio bytes, expected {}",
                index,
                audio.len(),
                self.sample_rate
            );
            audio.resize(self.sample_rate as usize, 0);
        }

        Ok(Segment {
            index,
            offset,
            audio,
            frames,
        })
    }
}

impl<R: Read> Iterator for SegmentDecoder<R> {
    type Item = AgmResult<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let index = self.index;
        let offset = self.offset;
        match self.next_segment() {
            Ok(Some(segment)) => Some(Ok(segment)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) if e.is_truncation() => {
                log::warn!("segment {} at byte {} is truncated, stopping: {}", index, offset, e);
                self.finished = true;
                None
            }
            Err(e) => {
                if e.is_fatal() {
                    self.finished = true;
                }
                Some(Err(e.in_segment(index, offset)))
            }
        }
    }
}

/// Like `read_exact`, but reports how many bytes were available.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{CodecId, FnCodec};
    use crate::mux::{AudioSource, VideoSource, encode_movie, plan_movie};
    use crate::schema::EncoderConfig;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn encode(
        video: Vec<u8>,
        audio: Vec<u8>,
        geometry: (u16, u16, u8, u32),
        config: &EncoderConfig,
        registry: &Arc<CodecRegistry>,
    ) -> Vec<u8> {
        let (width, height, fps, rate) = geometry;
        let video = VideoSource::from_bytes(video);
        let audio = AudioSource::from_pcm(rate, audio);
        let plan = plan_movie(&video, &audio, width, height, fps).unwrap();
        encode_movie(video, audio, &plan, config, Arc::clone(registry), Vec::new())
            .unwrap()
            .0
    }

    fn decode_all(bytes: &[u8], registry: &Arc<CodecRegistry>) -> Vec<AgmResult<Segment>> {
        AgmReader::new(Cursor::new(bytes))
            .unwrap()
            .into_segments(Arc::clone(registry))
            .unwrap()
            .collect()
    }

    fn scenario_bytes(config: &EncoderConfig, registry: &Arc<CodecRegistry>) -> Vec<u8> {
        let mut video = Vec::new();
        for v in 1..=3u8 {
            video.extend_from_slice(&[v; 8]);
        }
        encode(video, (1..=10).collect(), (4, 2, 2, 4), config, registry)
    }

    fn xor_registry(id: CodecId) -> Arc<CodecRegistry> {
        let xor =
            |d: &[u8]| -> Result<Vec<u8>, String> { Ok(d.iter().map(|b| b ^ 0x5a).collect()) };
        let mut registry = CodecRegistry::new();
        registry.register(id, FnCodec::new("xor", xor, xor)).unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_scenario_raw_roundtrip() {
        let registry = Arc::new(CodecRegistry::new());
        let bytes = scenario_bytes(&EncoderConfig::default(), &registry);

        let reader = AgmReader::new(Cursor::new(&bytes)).unwrap();
        assert_eq!(reader.header().total_frames, 3);
        assert_eq!(reader.header().total_secs, 3);
        assert_eq!(reader.sample_rate(), 4);

        let segments: Vec<Segment> = reader
            .into_segments(registry)
            .unwrap()
            .collect::<AgmResult<_>>()
            .unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(
            segments.iter().map(|s| s.frames.len()).collect::<Vec<_>>(),
            vec![2, 1, 0]
        );
        let frames: Vec<_> = segments.iter().flat_map(|s| s.frames.clone()).collect();
        assert_eq!(frames, vec![vec![1u8; 8], vec![2u8; 8], vec![3u8; 8]]);

        let audio: Vec<u8> = segments.iter().flat_map(|s| s.audio.clone()).collect();
        assert_eq!(audio.len(), 12);
        assert_eq!(&audio[..10], &(1..=10).collect::<Vec<u8>>()[..]);
        assert_eq!(&audio[10..], &[0, 0]);

        assert_eq!(segments[0].offset, FIRST_SEGMENT_OFFSET);
        assert!(segments[1].offset > segments[0].offset);
    }

    #[test]
    fn test_open_file() {
        let registry = Arc::new(CodecRegistry::new());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.agm");
        std::fs::write(&path, scenario_bytes(&EncoderConfig::default(), &registry)).unwrap();

        let reader = AgmReader::open(&path).unwrap();
        assert_eq!(reader.header().width, 4);
        let mut segments = reader.into_segments(registry).unwrap();
        assert_eq!(segments.by_ref().filter(|s| s.is_ok()).count(), 3);
        assert_eq!(segments.position(), 3);

        assert!(matches!(
            AgmReader::open(dir.path().join("missing.agm")),
            Err(AgmError::Io(_))
        ));
    }

    #[test]
    fn test_batched_codec_roundtrip() {
        let registry = xor_registry(CodecId::Szip);
        let config = EncoderConfig {
            codec: CodecId::Szip,
            batch_frames: true,
            chunk_size: 5,
            ..Default::default()
        };
        let bytes = scenario_bytes(&config, &registry);
        let segments: Vec<Segment> = decode_all(&bytes, &registry)
            .into_iter()
            .collect::<AgmResult<_>>()
            .unwrap();
        assert_eq!(segments[0].frames, vec![vec![1u8; 8], vec![2u8; 8]]);
        assert_eq!(segments[1].frames, vec![vec![3u8; 8]]);
    }

    #[test]
    fn test_bad_magic_reads_no_segments() {
        let registry = Arc::new(CodecRegistry::new());
        let mut bytes = scenario_bytes(&EncoderConfig::default(), &registry);
        bytes[76..82].copy_from_slice(b"BADMOV");
        assert!(matches!(
            AgmReader::new(Cursor::new(&bytes)),
            Err(AgmError::Format(_))
        ));
    }

    #[test]
    fn test_plain_wav_is_rejected() {
        let registry = Arc::new(CodecRegistry::new());
        let mut bytes = scenario_bytes(&EncoderConfig::default(), &registry);
        bytes[12..16].copy_from_slice(b"fmt ");
        assert!(matches!(
            AgmReader::new(Cursor::new(&bytes)),
            Err(AgmError::Format(_))
        ));
    }

    #[test]
    fn test_truncated_second_segment_ends_stream() {
        let registry = Arc::new(CodecRegistry::new());
        let bytes = scenario_bytes(&EncoderConfig::default(), &registry);

        let first_size = u32::from_le_bytes(
            bytes[FIRST_SEGMENT_OFFSET as usize + 4..FIRST_SEGMENT_OFFSET as usize + 8]
                .try_into()
                .unwrap(),
        ) as usize;
        // Second record header, mask byte, then two bytes into the chunk length.
        let cut = FIRST_SEGMENT_OFFSET as usize + first_size + SEGMENT_HEADER_SIZE + 1 + 2;

        let results = decode_all(&bytes[..cut], &registry);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn test_every_truncation_point_is_graceful() {
        let registry = Arc::new(CodecRegistry::new());
        let bytes = scenario_bytes(&EncoderConfig::default(), &registry);
        let mut last = 0;
        for cut in FIRST_SEGMENT_OFFSET as usize..=bytes.len() {
            let results = decode_all(&bytes[..cut], &registry);
            assert!(results.iter().all(|r| r.is_ok()), "cut at {cut}");
            assert!(results.len() >= last);
            last = results.len();
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn test_unknown_codec_is_fatal() {
        let registry = xor_registry(CodecId::Tvc);
        let config = EncoderConfig {
            codec: CodecId::Tvc,
            ..Default::default()
        };
        let bytes = scenario_bytes(&config, &registry);

        let results = decode_all(&bytes, &Arc::new(CodecRegistry::new()));
        assert_eq!(results.len(), 1);
        let err = results.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(err.root(), AgmError::UnknownCodec(CodecId::Tvc)));
        match err {
            AgmError::InSegment { segment, unit, .. } => {
                assert_eq!(segment, 0);
                assert_eq!(unit, Some(1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_codec_failure_skips_only_that_segment() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut decode_registry = CodecRegistry::new();
        decode_registry
            .register(
                CodecId::Szip,
                FnCodec::new(
                    "flaky",
                    |d: &[u8]| Ok(d.to_vec()),
                    move |d: &[u8]| {
                        // Fail on the first video unit only.
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err("corrupt".to_string())
                        } else {
                            Ok(d.to_vec())
                        }
                    },
                ),
            )
            .unwrap();
        let encode_registry = xor_registry(CodecId::Szip);
        let config = EncoderConfig {
            codec: CodecId::Szip,
            batch_frames: true,
            ..Default::default()
        };
        let bytes = scenario_bytes(&config, &encode_registry);

        let results = decode_all(&bytes, &Arc::new(decode_registry));
        assert_eq!(results.len(), 3);
        assert!(matches!(
            results[0].as_ref().unwrap_err().root(),
            AgmError::CodecFailure { .. }
        ));
        let second = results[1].as_ref().unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.frames.len(), 1);
        assert!(results[2].is_ok());
    }

    fn single_segment_file(record: &[u8]) -> Vec<u8> {
        let mut bytes = crate::format::WavCompatHeader::synthesize(4)
            .as_bytes()
            .to_vec();
        let header = AgmHeader {
            version: 1,
            width: 4,
            height: 2,
            frame_rate: 1,
            total_frames: 1,
            total_secs: 1,
        };
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(record);
        bytes
    }

    #[test]
    fn test_short_trailing_video_bytes_padded() {
        let registry = Arc::new(CodecRegistry::new());
        let mut encoder = crate::mux::SegmentEncoder::new(
            EncoderConfig::default(),
            Arc::clone(&registry),
            12,
            4,
        )
        .unwrap();
        // Frames encoded at 12 bytes, decoded against an 8-byte frame size.
        let record = encoder.encode_segment(&[[7u8; 12]], &[1, 2, 3, 4]).unwrap();

        let results = decode_all(&single_segment_file(&record), &registry);
        let segment = results[0].as_ref().unwrap();
        assert_eq!(
            segment.frames,
            vec![vec![7u8; 8], vec![7, 7, 7, 7, 0, 0, 0, 0]]
        );
        assert_eq!(segment.audio, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_short_single_frame_unit_is_kept() {
        let registry = Arc::new(CodecRegistry::new());
        let mut encoder = crate::mux::SegmentEncoder::new(
            EncoderConfig::default(),
            Arc::clone(&registry),
            5,
            4,
        )
        .unwrap();
        // A unit that decodes to fewer bytes than one 8-byte frame.
        let record = encoder.encode_segment(&[[3u8; 5]], &[0; 4]).unwrap();

        let results = decode_all(&single_segment_file(&record), &registry);
        let segment = results[0].as_ref().unwrap();
        assert_eq!(segment.frames, vec![vec![3, 3, 3, 3, 3, 0, 0, 0]]);
    }

    #[test]
    fn test_undersized_record_is_format_error() {
        let mut bytes = crate::format::WavCompatHeader::synthesize(4).as_bytes().to_vec();
        let header = AgmHeader {
            version: 1,
            width: 1,
            height: 1,
            frame_rate: 1,
            total_frames: 0,
            total_secs: 1,
        };
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());

        let results = decode_all(&bytes, &Arc::new(CodecRegistry::new()));
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0].as_ref().unwrap_err().root(),
            AgmError::Format(_)
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_decode_inverts_encode(
            width in 1u16..6,
            height in 1u16..6,
            fps in 1u8..5,
            rate in 1u32..12,
            video in prop::collection::vec(any::<u8>(), 0..200),
            audio in prop::collection::vec(any::<u8>(), 0..80),
            chunk_size in 1usize..9,
            batch_frames in any::<bool>(),
        ) {
            prop_assume!(!video.is_empty() || !audio.is_empty());
            let registry = xor_registry(CodecId::Srle2);
            let config = EncoderConfig {
                codec: CodecId::Srle2,
                chunk_size,
                batch_frames,
                gcol: 3,
            };
            let bytes = encode(
                video.clone(),
                audio.clone(),
                (width, height, fps, rate),
                &config,
                &registry,
            );
            let segments: Vec<Segment> = decode_all(&bytes, &registry)
                .into_iter()
                .collect::<AgmResult<_>>()
                .unwrap();

            let frame_size = width as usize * height as usize;
            let total_frames = video.len().div_ceil(frame_size);
            let total_secs = AgmHeader::compute_total_secs(
                total_frames as u64, fps as u32, audio.len() as u64, rate) as usize;
            prop_assert_eq!(segments.len(), total_secs);

            let mut expected_video = video.clone();
            expected_video.resize(total_frames * frame_size, 0);
            let decoded_video: Vec<u8> = segments.iter().flat_map(|s| s.frames.concat()).collect();
            prop_assert_eq!(decoded_video, expected_video);

            let mut expected_audio = audio.clone();
            expected_audio.resize(total_secs * rate as usize, 0);
            let decoded_audio: Vec<u8> = segments.iter().flat_map(|s| s.audio.clone()).collect();
            prop_assert_eq!(decoded_audio, expected_audio);
        }
    }
}
