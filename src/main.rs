//! AGM CLI - Encode, inspect and play AGM movies.

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use agm::{
    AgmResult,
    demux::{AgmReader, Segment},
    format::{CodecId, CodecRegistry},
    mux::encode_file,
    playback::{NullAudioSink, NullFrameSink, Palette, PngDumpSink, Player},
    schema::{CodecSpec, CommandSpec, EncodeConfig, EncoderConfig, PlaybackConfig},
};

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("--example") => print_example_config(),
        Some("encode") if args.len() == 3 => run_encode(Path::new(&args[2])),
        Some("info") if args.len() >= 3 => {
            let options = parse_options(&args[3..]);
            run_info(Path::new(&args[2]), &options);
        }
        Some("play") if args.len() >= 3 => {
            let options = parse_options(&args[3..]);
            run_play(Path::new(&args[2]), &options);
        }
        _ => {
            print_usage(&args[0]);
            std::process::exit(1);
        }
    }
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} <command> [args]", program);
    eprintln!();
    eprintln!("Encode, inspect and play AGM movies.");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  encode <config.json>          Encode a movie from an encode configuration");
    eprintln!("  info <file.agm> [options]     Print headers and a per-segment summary");
    eprintln!("  play <file.agm> [options]     Play headlessly at the movie's frame rate");
    eprintln!("  --example                     Print example configurations");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <play.json>  Playback configuration (codecs, prefetch timeout)");
    eprintln!("  --dump <DIR>          Write each presented frame as a PNG (play only)");
    eprintln!("  --palette <FILE>      768-byte RGB palette for --dump (default: grayscale)");
}

#[derive(Default)]
struct Options {
    config: Option<PathBuf>,
    dump: Option<PathBuf>,
    palette: Option<PathBuf>,
}

fn parse_options(args: &[String]) -> Options {
    let mut options = Options::default();
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let slot = match flag.as_str() {
            "--config" => &mut options.config,
            "--dump" => &mut options.dump,
            "--palette" => &mut options.palette,
            other => fail(format!("Unknown option: {}", other)),
        };
        let value = iter
            .next()
            .unwrap_or_else(|| fail(format!("Missing value for {}", flag)));
        *slot = Some(PathBuf::from(value));
    }
    options
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> T {
    let text = fs::read_to_string(path)
        .unwrap_or_else(|e| fail(format!("reading {} file {}: {}", what, path.display(), e)));
    serde_json::from_str(&text)
        .unwrap_or_else(|e| fail(format!("parsing {} file {}: {}", what, path.display(), e)))
}

fn load_playback_config(options: &Options) -> PlaybackConfig {
    let config = match &options.config {
        Some(path) => load_json::<PlaybackConfig>(path, "playback config"),
        None => PlaybackConfig::default(),
    };
    config.validate().unwrap_or_else(|e| fail(e));
    config
}

fn run_encode(config_path: &Path) {
    let config: EncodeConfig = load_json(config_path, "config");

    println!("AGM Encode");
    println!("==========");
    println!("Video: {}", config.video.display());
    println!("Audio: {}", config.audio.display());
    println!(
        "Geometry: {}x{} @ {} fps",
        config.width, config.height, config.frame_rate
    );
    println!(
        "Codec: {} (chunk size {}, {})",
        config.encoder.codec,
        config.encoder.chunk_size,
        if config.encoder.batch_frames {
            "batched frames"
        } else {
            "one unit per frame"
        }
    );
    println!();

    let start = Instant::now();
    let stats = encode_file(&config).unwrap_or_else(|e| fail(e));
    let elapsed = start.elapsed();

    println!("Wrote {}", config.output.display());
    println!("  {}", stats);
    println!("Time: {:.2}s", elapsed.as_secs_f32());
}

fn run_info(path: &Path, options: &Options) {
    let config = load_playback_config(options);
    let registry = CodecRegistry::from_specs(&config.codecs).unwrap_or_else(|e| fail(e));

    let reader = AgmReader::open(path).unwrap_or_else(|e| fail(e));
    let header = *reader.header();
    let sample_rate = reader.sample_rate();

    println!("AGM File: {}", path.display());
    println!("========");
    println!("Sample rate: {} Hz", sample_rate);
    println!("Version: {}", header.version);
    println!(
        "Geometry: {}x{} @ {} fps ({} bytes/frame)",
        header.width,
        header.height,
        header.frame_rate,
        header.frame_size()
    );
    println!("Frames: {}", header.total_frames);
    println!("Duration: {} s", header.total_secs);
    println!();

    let segments = reader
        .into_segments(Arc::new(registry))
        .unwrap_or_else(|e| fail(e));
    let summary = summarize_segments(segments);

    println!();
    println!(
        "{} segment(s), {} frame(s), {} error(s)",
        summary.segments, summary.frames, summary.errors
    );
    if summary.segments < header.total_secs as u64
        || summary.frames < header.total_frames as u64
    {
        println!(
            "Stream ends early: header declares {} s and {} frames",
            header.total_secs, header.total_frames
        );
    }
    if summary.failed() {
        std::process::exit(1);
    }
}

/// Totals from walking every segment of a file.
#[derive(Debug, Default, PartialEq, Eq)]
struct InfoSummary {
    segments: u64,
    frames: u64,
    errors: u64,
}

impl InfoSummary {
    /// Any decode error, recoverable or not, fails the command.
    fn failed(&self) -> bool {
        self.errors > 0
    }
}

/// Print one line per segment and each decode error, stopping after a
/// fatal one.
fn summarize_segments<I>(segments: I) -> InfoSummary
where
    I: IntoIterator<Item = AgmResult<Segment>>,
{
    let mut summary = InfoSummary::default();
    for result in segments {
        match result {
            Ok(segment) => {
                println!(
                    "  Segment {:>5} @ {:>10}: {:>3} frames, {} audio bytes",
                    segment.index,
                    segment.offset,
                    segment.frames.len(),
                    segment.audio.len()
                );
                summary.frames += segment.frames.len() as u64;
                summary.segments += 1;
            }
            Err(e) => {
                eprintln!("  {}", e);
                summary.errors += 1;
                if e.is_fatal() {
                    break;
                }
            }
        }
    }
    summary
}

fn run_play(path: &Path, options: &Options) {
    let config = load_playback_config(options);
    let registry = CodecRegistry::from_specs(&config.codecs).unwrap_or_else(|e| fail(e));

    let reader = AgmReader::open(path).unwrap_or_else(|e| fail(e));
    let header = *reader.header();
    println!(
        "Playing {} ({}x{} @ {} fps, {} s)",
        path.display(),
        header.width,
        header.height,
        header.frame_rate,
        header.total_secs
    );

    let segments = reader
        .into_segments(Arc::new(registry))
        .unwrap_or_else(|e| fail(e));

    let start = Instant::now();
    let stats = match &options.dump {
        Some(dir) => {
            let palette = match &options.palette {
                Some(file) => Palette::load(file).unwrap_or_else(|e| fail(e)),
                None => Palette::default(),
            };
            let sink = PngDumpSink::new(dir, palette).unwrap_or_else(|e| fail(e));
            let mut player =
                Player::new(&config, sink, NullAudioSink).unwrap_or_else(|e| fail(e));
            player.play(segments)
        }
        None => {
            let mut player =
                Player::new(&config, NullFrameSink, NullAudioSink).unwrap_or_else(|e| fail(e));
            player.play(segments)
        }
    }
    .unwrap_or_else(|e| fail(e));

    println!("  {}", stats);
    println!("Time: {:.2}s", start.elapsed().as_secs_f32());
}

fn print_example_config() {
    let mut codecs = HashMap::new();
    codecs.insert(
        CodecId::Szip,
        CodecSpec::Command(CommandSpec {
            compress: vec!["szip".into(), "-c".into()],
            decompress: vec!["szip".into(), "-d".into()],
        }),
    );
    let encode = EncodeConfig {
        encoder: EncoderConfig {
            codec: CodecId::Szip,
            batch_frames: true,
            ..Default::default()
        },
        codecs: codecs.clone(),
        ..Default::default()
    };
    let play = PlaybackConfig {
        codecs,
        ..Default::default()
    };

    println!("Example encode configuration (encode.json):");
    println!("{}", to_json(&encode));
    println!();
    println!("Example playback configuration (play.json):");
    println!("{}", to_json(&play));
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| fail(e))
}
