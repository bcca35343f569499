//! Segment encoder (muxer) and streaming file writer.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use super::source::{AudioSource, MoviePlan, VideoSource, plan_movie};
use crate::format::{
    AgmError, AgmHeader, AgmResult, CodecId, CodecRegistry, SEGMENT_HEADER_SIZE, UnitKind,
    WavCompatHeader, build_mask, write_unit,
};
use crate::schema::{ConfigError, EncodeConfig, EncoderConfig};

/// Turns one second of frames and audio into a segment record.
///
/// Each record is assembled in memory, so a codec failure never leaves a
/// partial segment in the output.
pub struct SegmentEncoder {
    config: EncoderConfig,
    registry: Arc<CodecRegistry>,
    frame_size: usize,
    sample_rate: u32,
    prev_size: u32,
    segments: u64,
}

impl SegmentEncoder {
    pub fn new(
        config: EncoderConfig,
        registry: Arc<CodecRegistry>,
        frame_size: usize,
        sample_rate: u32,
    ) -> AgmResult<Self> {
        config.validate()?;
        if frame_size == 0 {
            return Err(ConfigError::InvalidDimensions.into());
        }
        if sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate.into());
        }
        // Fail before any output if the codec is missing.
        registry.get(config.codec)?;

        Ok(Self {
            config,
            registry,
            frame_size,
            sample_rate,
            prev_size: 0,
            segments: 0,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Number of segments encoded so far.
    pub fn segments(&self) -> u64 {
        self.segments
    }

    /// Encode one record: `(prev_size, this_size)`, the audio unit, then
    /// the video unit(s). `this_size` includes the 8-byte record header.
    pub fn encode_segment<F: AsRef<[u8]>>(
        &mut self,
        frames: &[F],
        audio: &[u8],
    ) -> AgmResult<Vec<u8>> {
        let chunk_size = self.config.chunk_size;
        let mut record = vec![0u8; SEGMENT_HEADER_SIZE];

        let audio = self.fit_audio(audio);
        let audio_mask = build_mask(UnitKind::Audio, CodecId::Raw, 0)?;
        write_unit(&mut record, audio_mask, &audio, chunk_size)?;

        let video_mask = build_mask(UnitKind::Video, self.config.codec, self.config.gcol)?;
        if self.config.batch_frames {
            if !frames.is_empty() {
                let mut blob = Vec::with_capacity(frames.len() * self.frame_size);
                for frame in frames {
                    blob.extend_from_slice(&self.fit_frame(frame.as_ref()));
                }
                let packed = self.registry.compress(self.config.codec, &blob)?;
                write_unit(&mut record, video_mask, &packed, chunk_size)?;
            }
        } else {
            for frame in frames {
                let packed = self
                    .registry
                    .compress(self.config.codec, &self.fit_frame(frame.as_ref()))?;
                write_unit(&mut record, video_mask, &packed, chunk_size)?;
            }
        }

        let this_size = u32::try_from(record.len()).map_err(|_| {
            AgmError::format(format!(
                "segment {} is {} bytes, over the u32 size field",
                self.segments,
                record.len()
            ))
        })?;
        record[0..4].copy_from_slice(&self.prev_size.to_le_bytes());
        record[4..8].copy_from_slice(&this_size.to_le_bytes());

        log::debug!(
            "segment {}: {} frame(s), {} bytes",
            self.segments,
            frames.len(),
            this_size
        );
        self.prev_size = this_size;
        self.segments += 1;
        Ok(record)
    }

    fn fit_audio<'a>(&self, audio: &'a [u8]) -> std::borrow::Cow<'a, [u8]> {
        let want = self.sample_rate as usize;
        if audio.len() == want {
            return audio.into();
        }
        if audio.len() > want {
            log::warn!(
                "segment {}: {} audio bytes, truncating to {}",
                self.segments,
                audio.len(),
                want
            );
            return audio[..want].into();
        }
        let mut padded = audio.to_vec();
        padded.resize(want, 0);
        padded.into()
    }

    fn fit_frame<'a>(&self, frame: &'a [u8]) -> std::borrow::Cow<'a, [u8]> {
        if frame.len() == self.frame_size {
            return frame.into();
        }
        log::warn!(
            "segment {}: frame of {} bytes, expected {}",
            self.segments,
            frame.len(),
            self.frame_size
        );
        let mut fitted = frame[..frame.len().min(self.frame_size)].to_vec();
        fitted.resize(self.frame_size, 0);
        fitted.into()
    }
}

/// Writes the fixed headers, then streams segments. Never seeks.
pub struct AgmWriter<W: Write> {
    writer: W,
    encoder: SegmentEncoder,
    header: AgmHeader,
    stats: EncodeStats,
}

impl<W: Write> AgmWriter<W> {
    /// Validate the encoder setup, then write both headers.
    pub fn new(
        mut writer: W,
        wav_header: &WavCompatHeader,
        header: AgmHeader,
        config: EncoderConfig,
        registry: Arc<CodecRegistry>,
    ) -> AgmResult<Self> {
        if header.frame_rate == 0 {
            return Err(ConfigError::InvalidFrameRate.into());
        }
        let codec = config.codec;
        let encoder = SegmentEncoder::new(
            config,
            registry,
            header.frame_size(),
            wav_header.sample_rate(),
        )?;

        wav_header.write_to(&mut writer)?;
        header.write_to(&mut writer)?;

        Ok(Self {
            writer,
            encoder,
            header,
            stats: EncodeStats {
                total_bytes: (WavCompatHeader::SIZE + AgmHeader::SIZE) as u64,
                codec,
                ..Default::default()
            },
        })
    }

    /// Encode and write one segment. Returns its record size.
    pub fn write_segment<F: AsRef<[u8]>>(&mut self, frames: &[F], audio: &[u8]) -> AgmResult<u64> {
        let index = self.encoder.segments();
        let offset = self.stats.total_bytes;
        let record = self
            .encoder
            .encode_segment(frames, audio)
            .map_err(|e| e.in_segment(index, offset))?;
        self.writer.write_all(&record)?;

        let size = record.len() as u64;
        self.stats.segment_count += 1;
        self.stats.frame_count += frames.len() as u64;
        self.stats.total_bytes += size;
        self.stats.largest_segment = self.stats.largest_segment.max(size);
        Ok(size)
    }

    /// Flush and return the inner writer with statistics.
    pub fn finish(mut self) -> AgmResult<(W, EncodeStats)> {
        self.writer.flush()?;
        if self.stats.segment_count != self.header.total_secs as u64 {
            log::warn!(
                "wrote {} segments, header declares {}",
                self.stats.segment_count,
                self.header.total_secs
            );
        }
        if self.stats.frame_count != self.header.total_frames as u64 {
            log::warn!(
                "wrote {} frames, header declares {}",
                self.stats.frame_count,
                self.header.total_frames
            );
        }
        Ok((self.writer, self.stats))
    }
}

/// Statistics from an encode.
#[derive(Debug, Clone, Default)]
pub struct EncodeStats {
    /// Segments written.
    pub segment_count: u64,
    /// Video frames written.
    pub frame_count: u64,
    /// Total file size in bytes.
    pub total_bytes: u64,
    /// Largest segment record in bytes.
    pub largest_segment: u64,
    /// Video codec used.
    pub codec: CodecId,
}

impl std::fmt::Display for EncodeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} segments, {} frames, {} bytes total, largest segment {} bytes ({} video)",
            self.segment_count,
            self.frame_count,
            self.total_bytes,
            self.largest_segment,
            self.codec
        )
    }
}

/// Second phase of an encode: write headers from `plan`, then stream every
/// segment from the sources.
pub fn encode_movie<W: Write>(
    mut video: VideoSource,
    mut audio: AudioSource,
    plan: &MoviePlan,
    config: &EncoderConfig,
    registry: Arc<CodecRegistry>,
    writer: W,
) -> AgmResult<(W, EncodeStats)> {
    let frame_size = plan.frame_size();
    let mut out = AgmWriter::new(
        writer,
        &plan.wav_header,
        plan.header,
        config.clone(),
        registry,
    )?;

    for index in 0..plan.segment_count() {
        let frames = video.read_frames(plan.frames_in_segment(index), frame_size)?;
        let samples = audio.read_slice(plan.sample_rate as usize)?;
        out.write_segment(&frames, &samples)?;
    }

    out.finish()
}

/// Run a complete encode job from configuration.
///
/// Output goes to `<output>.part` and is renamed on success; on failure the
/// partial file is removed.
pub fn encode_file(config: &EncodeConfig) -> AgmResult<EncodeStats> {
    config.validate()?;
    let registry = Arc::new(CodecRegistry::from_specs(&config.codecs)?);

    let video = VideoSource::open(&config.video)?;
    let audio = AudioSource::open(&config.audio)?;
    let plan = plan_movie(&video, &audio, config.width, config.height, config.frame_rate)?;

    let mut part = config.output.clone().into_os_string();
    part.push(".part");
    let part = PathBuf::from(part);

    let result = File::create(&part)
        .map_err(AgmError::from)
        .and_then(|file| {
            encode_movie(
                video,
                audio,
                &plan,
                &config.encoder,
                registry,
                BufWriter::new(file),
            )
        })
        .and_then(|(writer, stats)| {
            writer.into_inner().map_err(|e| AgmError::Io(e.into_error()))?;
            Ok(stats)
        });

    match result {
        Ok(stats) => {
            fs::rename(&part, &config.output)?;
            log::info!("wrote {}: {}", config.output.display(), stats);
            Ok(stats)
        }
        Err(e) => {
            if let Err(rm) = fs::remove_file(&part) {
                log::warn!("could not remove '{}': {}", part.display(), rm);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FIRST_SEGMENT_OFFSET, FnCodec, decode_unit};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn raw_encoder(frame_size: usize, sample_rate: u32, batch: bool) -> SegmentEncoder {
        let config = EncoderConfig {
            chunk_size: 3,
            batch_frames: batch,
            ..Default::default()
        };
        SegmentEncoder::new(config, Arc::new(CodecRegistry::new()), frame_size, sample_rate)
            .unwrap()
    }

    fn units_of(record: &[u8]) -> Vec<crate::format::Unit> {
        let mut cursor = Cursor::new(&record[SEGMENT_HEADER_SIZE..]);
        let mut units = Vec::new();
        while (cursor.position() as usize) < record.len() - SEGMENT_HEADER_SIZE {
            units.push(decode_unit(&mut cursor).unwrap());
        }
        units
    }

    #[test]
    fn test_record_sizes_chain() {
        let mut encoder = raw_encoder(4, 5, false);
        let first = encoder.encode_segment(&[[1u8; 4], [2u8; 4]], &[7; 5]).unwrap();
        let second = encoder.encode_segment(&[[3u8; 4]], &[8; 2]).unwrap();

        assert_eq!(u32::from_le_bytes(first[0..4].try_into().unwrap()), 0);
        assert_eq!(
            u32::from_le_bytes(first[4..8].try_into().unwrap()) as usize,
            first.len()
        );
        assert_eq!(
            u32::from_le_bytes(second[0..4].try_into().unwrap()) as usize,
            first.len()
        );
        assert_eq!(
            u32::from_le_bytes(second[4..8].try_into().unwrap()) as usize,
            second.len()
        );
        assert_eq!(encoder.segments(), 2);
    }

    #[test]
    fn test_audio_first_then_one_unit_per_frame() {
        let mut encoder = raw_encoder(4, 5, false);
        let record = encoder.encode_segment(&[[1u8; 4], [2u8; 4]], &[7; 3]).unwrap();
        let units = units_of(&record);

        assert_eq!(units.len(), 3);
        assert_eq!(units[0].kind, UnitKind::Audio);
        assert_eq!(units[0].payload, vec![7, 7, 7, 0, 0]);
        assert_eq!(units[1].kind, UnitKind::Video);
        assert_eq!(units[1].payload, vec![1; 4]);
        assert_eq!(units[2].payload, vec![2; 4]);
    }

    #[test]
    fn test_batched_frames_share_one_unit() {
        let mut encoder = raw_encoder(4, 5, true);
        let record = encoder.encode_segment(&[[1u8; 4], [2u8; 4]], &[7; 5]).unwrap();
        let units = units_of(&record);

        assert_eq!(units.len(), 2);
        assert_eq!(units[1].payload, vec![1, 1, 1, 1, 2, 2, 2, 2]);

        // No frames, no video unit.
        let record = encoder.encode_segment::<[u8; 4]>(&[], &[7; 5]).unwrap();
        assert_eq!(units_of(&record).len(), 1);
    }

    #[test]
    fn test_codec_failure_yields_no_record() {
        let mut registry = CodecRegistry::new();
        registry
            .register(
                CodecId::Tvc,
                FnCodec::new(
                    "tvc",
                    |_: &[u8]| Err("encoder crashed".to_string()),
                    |d: &[u8]| Ok(d.to_vec()),
                ),
            )
            .unwrap();
        let config = EncoderConfig {
            codec: CodecId::Tvc,
            ..Default::default()
        };
        let header = AgmHeader {
            version: 1,
            width: 2,
            height: 2,
            frame_rate: 1,
            total_frames: 1,
            total_secs: 1,
        };
        let mut writer = AgmWriter::new(
            Vec::new(),
            &WavCompatHeader::synthesize(4),
            header,
            config,
            Arc::new(registry),
        )
        .unwrap();

        let err = writer.write_segment(&[[0u8; 4]], &[0; 4]).unwrap_err();
        assert!(matches!(err.root(), AgmError::CodecFailure { .. }));
        let (bytes, stats) = writer.finish().unwrap();
        assert_eq!(bytes.len() as u64, FIRST_SEGMENT_OFFSET);
        assert_eq!(stats.segment_count, 0);
    }

    #[test]
    fn test_unregistered_codec_fails_before_output() {
        let config = EncoderConfig {
            codec: CodecId::Szip,
            ..Default::default()
        };
        let header = AgmHeader {
            version: 1,
            width: 2,
            height: 2,
            frame_rate: 1,
            total_frames: 0,
            total_secs: 0,
        };
        let mut out = Vec::new();
        {
            let result = AgmWriter::new(
                &mut out,
                &WavCompatHeader::synthesize(4),
                header,
                config,
                Arc::new(CodecRegistry::new()),
            );
            assert!(matches!(result, Err(AgmError::UnknownCodec(CodecId::Szip))));
        }
        assert!(out.is_empty());
    }

    #[test]
    fn test_encode_movie_layout() {
        let video = VideoSource::from_frames(&[[1u8; 8], [2u8; 8], [3u8; 8]]);
        let audio = AudioSource::from_pcm(4, (1..=10).collect());
        let plan = plan_movie(&video, &audio, 4, 2, 2).unwrap();

        let (bytes, stats) = encode_movie(
            video,
            audio,
            &plan,
            &EncoderConfig::default(),
            Arc::new(CodecRegistry::new()),
            Vec::new(),
        )
        .unwrap();

        assert_eq!(stats.segment_count, 3);
        assert_eq!(stats.frame_count, 3);
        assert_eq!(stats.total_bytes, bytes.len() as u64);
        assert_eq!(&bytes[12..15], b"agm");
        assert_eq!(&bytes[76..82], b"AGNMOV");
    }

    #[test]
    fn test_encode_file_writes_output_and_cleans_up() {
        let dir = tempdir().unwrap();
        let video = dir.path().join("in.raw");
        let audio = dir.path().join("in.wav");
        let output = dir.path().join("out.agm");
        fs::write(&video, [5u8; 8 * 5]).unwrap();
        let mut wav = WavCompatHeader::synthesize(4).as_bytes().to_vec();
        wav[12..16].copy_from_slice(b"fmt ");
        wav.extend_from_slice(&[0x80; 6]);
        fs::write(&audio, &wav).unwrap();

        let config = EncodeConfig {
            video: video.clone(),
            audio: audio.clone(),
            output: output.clone(),
            width: 4,
            height: 2,
            frame_rate: 2,
            ..Default::default()
        };
        let stats = encode_file(&config).unwrap();
        assert_eq!(stats.segment_count, 3);
        assert_eq!(fs::metadata(&output).unwrap().len(), stats.total_bytes);
        assert!(!dir.path().join("out.agm.part").exists());

        // Missing source: nothing is written at all.
        let missing = EncodeConfig {
            video: dir.path().join("missing.raw"),
            output: dir.path().join("never.agm"),
            ..config
        };
        assert!(encode_file(&missing).is_err());
        assert!(!dir.path().join("never.agm").exists());
        assert!(!dir.path().join("never.agm.part").exists());
    }
}
