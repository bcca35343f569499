//! Playback scheduler: fixed-cadence presentation with a depth-1 prefetch.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};

use super::present::{AudioSink, FrameSink};
use crate::demux::{Segment, SegmentDecoder};
use crate::format::{AgmError, AgmResult};
use crate::schema::PlaybackConfig;

/// Player lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    PrefetchPending,
    Presenting,
    Draining,
    Finished,
}

/// Why playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The decoder reached end-of-stream.
    #[default]
    Completed,
    Cancelled,
    /// A prefetched segment did not arrive in time.
    PrefetchTimeout,
}

/// Statistics for one playback run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub segments: u64,
    pub frames_presented: u64,
    pub prefetch_requests: u64,
    /// Segments dropped after a recoverable codec failure.
    pub segments_skipped: u64,
    pub stop_reason: StopReason,
}

impl std::fmt::Display for PlaybackStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} segments, {} frames, {} prefetches, {} skipped ({:?})",
            self.segments,
            self.frames_presented,
            self.prefetch_requests,
            self.segments_skipped,
            self.stop_reason
        )
    }
}

/// Blocks until one frame interval has passed since the previous frame.
#[derive(Debug)]
pub struct FramePacer {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl FramePacer {
    /// `realtime == false` (or a zero frame rate) disables waiting.
    pub fn new(frame_rate: u8, realtime: bool) -> Self {
        let interval = (realtime && frame_rate > 0)
            .then(|| Duration::from_secs_f64(1.0 / frame_rate as f64));
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn wait(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        let deadline = self.last.unwrap_or(now) + interval;
        if deadline > now {
            thread::sleep(deadline - now);
            self.last = Some(deadline);
        } else {
            // Running late: restart the cadence rather than bursting.
            self.last = Some(now);
        }
    }
}

type Prefetched = Option<AgmResult<Segment>>;

/// Presents segments from a decoder while the next one decodes on a worker.
///
/// Usage:
/// ```ignore
/// let mut player = Player::new(&config, sink, NullAudioSink)?;
/// let cancel = player.cancel_handle();
/// let stats = player.play(reader.into_segments(registry)?)?;
/// ```
pub struct Player<F: FrameSink, A: AudioSink> {
    frame_sink: F,
    audio_sink: A,
    prefetch_timeout: Duration,
    realtime: bool,
    cancelled: Arc<AtomicBool>,
    state: PlayerState,
}

impl<F: FrameSink, A: AudioSink> Player<F, A> {
    pub fn new(config: &PlaybackConfig, frame_sink: F, audio_sink: A) -> AgmResult<Self> {
        config.validate()?;
        Ok(Self {
            frame_sink,
            audio_sink,
            prefetch_timeout: config.prefetch_timeout(),
            realtime: config.realtime,
            cancelled: Arc::new(AtomicBool::new(false)),
            state: PlayerState::Idle,
        })
    }

    /// Share an existing cancellation flag.
    pub fn with_cancel_handle(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn frame_sink(&self) -> &F {
        &self.frame_sink
    }

    pub fn audio_sink(&self) -> &A {
        &self.audio_sink
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Play every segment in file order until end-of-stream, cancellation
    /// or a prefetch timeout.
    ///
    /// Recoverable codec failures skip their segment. Fatal decode errors
    /// and sink errors end playback with `Err`.
    pub fn play<R: Read + Send + 'static>(
        &mut self,
        decoder: SegmentDecoder<R>,
    ) -> AgmResult<PlaybackStats> {
        let header = *decoder.header();
        let sample_rate = decoder.sample_rate();
        let mut pacer = FramePacer::new(header.frame_rate, self.realtime);
        let mut stats = PlaybackStats::default();

        let (request_tx, request_rx) = mpsc::channel::<()>();
        let (result_tx, result_rx) = mpsc::sync_channel::<Prefetched>(1);
        let worker = thread::Builder::new()
            .name("agm-prefetch".to_string())
            .spawn(move || prefetch_worker(decoder, request_rx, result_tx))?;

        self.state = PlayerState::Idle;
        let mut in_flight = request_tx.send(()).is_ok();
        stats.prefetch_requests += 1;
        self.state = PlayerState::PrefetchPending;

        let mut outcome = Ok(());
        let mut frame_index = 0u64;

        'playback: loop {
            let item = match result_rx.recv_timeout(self.prefetch_timeout) {
                Ok(item) => {
                    in_flight = false;
                    item
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "no segment after {:?}, stopping playback",
                        self.prefetch_timeout
                    );
                    stats.stop_reason = StopReason::PrefetchTimeout;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    in_flight = false;
                    outcome = Err(AgmError::Io(io::Error::other(
                        "prefetch worker exited unexpectedly",
                    )));
                    break;
                }
            };

            let segment = match item {
                None => break,
                Some(Ok(segment)) => segment,
                Some(Err(e)) if e.is_fatal() => {
                    log::error!("{}", e);
                    outcome = Err(e);
                    break;
                }
                Some(Err(e)) => {
                    log::warn!("skipping segment: {}", e);
                    stats.segments_skipped += 1;
                    if self.is_cancelled() {
                        stats.stop_reason = StopReason::Cancelled;
                        break;
                    }
                    if request_tx.send(()).is_ok() {
                        stats.prefetch_requests += 1;
                        in_flight = true;
                    }
                    continue;
                }
            };

            if self.is_cancelled() {
                stats.stop_reason = StopReason::Cancelled;
                break;
            }

            // Depth 1: the next decode runs while this segment presents.
            if request_tx.send(()).is_ok() {
                stats.prefetch_requests += 1;
                in_flight = true;
            }

            self.state = PlayerState::Presenting;
            stats.segments += 1;
            log::debug!(
                "presenting segment {} ({} frames)",
                segment.index,
                segment.frames.len()
            );
            self.audio_sink.play(&segment.audio, sample_rate);

            for frame in &segment.frames {
                if self.is_cancelled() {
                    stats.stop_reason = StopReason::Cancelled;
                    break 'playback;
                }
                if let Err(e) = self.frame_sink.present(frame_index, frame, &header) {
                    outcome = Err(e.in_segment(segment.index, segment.offset));
                    break 'playback;
                }
                frame_index += 1;
                stats.frames_presented += 1;
                pacer.wait();
            }

            self.state = PlayerState::PrefetchPending;
        }

        self.state = PlayerState::Draining;
        drop(request_tx);
        let idle = !in_flight
            || (stats.stop_reason != StopReason::PrefetchTimeout
                && !matches!(
                    result_rx.recv_timeout(self.prefetch_timeout),
                    Err(RecvTimeoutError::Timeout)
                ));
        drop(result_rx);
        if idle {
            if worker.join().is_err() {
                log::error!("prefetch worker panicked");
            }
        } else {
            log::warn!("prefetch worker still decoding, detaching it");
        }
        self.state = PlayerState::Finished;

        log::info!("playback finished: {}", stats);
        outcome.map(|()| stats)
    }
}

/// Decode one segment per request until the decoder or either channel ends.
fn prefetch_worker<R: Read>(
    mut decoder: SegmentDecoder<R>,
    requests: Receiver<()>,
    results: SyncSender<Prefetched>,
) {
    while requests.recv().is_ok() {
        let item = decoder.next();
        let end = item.is_none();
        if results.send(item).is_err() || end {
            break;
        }
    }
    log::debug!("prefetch worker done after {} segment(s)", decoder.position());
}
