use std::collections::BTreeMap;
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::metrics::{DropCause, SharedMetrics};
use crate::source::Frame;

#[derive(Debug, Clone, PartialEq)]
pub struct PlayedFrame {
    pub frame_id: u32,
    pub pts_ms: f32,
    /// how late the frame was released relative to its deadline, in whole milliseconds
    pub delay_ms: f64,
    pub len: usize,
    pub played_at: Instant,
}

/// Output of the playback scheduler. Rendering is out of scope, so this is where frames end.
pub trait FrameSink: Send + 'static {
    fn on_frame_played(&mut self, frame: &PlayedFrame);
}

pub struct LoggingSink;

impl FrameSink for LoggingSink {
    fn on_frame_played(&mut self, frame: &PlayedFrame) {
        info!("PLAYED frame {} (PTS: {}ms, delay: {:.2}ms)", frame.frame_id, frame.pts_ms as i64, frame.delay_ms);
    }
}

#[derive(Debug)]
pub enum PlaybackInput {
    Frame(Frame),
    EndOfStream,
}

#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub prebuffer_frames: usize,
    pub capacity: usize,
    pub stall_timeout: Duration,
    /// playback ends when no input arrives for this long while the buffer is empty
    pub idle_timeout: Duration,
    pub nominal_frame_interval_ms: f64,
}

impl PlaybackSettings {
    pub fn from_config(config: &ClientConfig) -> PlaybackSettings {
        PlaybackSettings {
            prebuffer_frames: config.prebuffer_frames,
            capacity: config.jitter_buffer_capacity,
            stall_timeout: config.stall_timeout,
            idle_timeout: config.idle_timeout,
            nominal_frame_interval_ms: 1000.0 / config.nominal_frame_rate,
        }
    }
}

/// Maps presentation timestamps to instants. Stalls halt the clock, which shifts all later
///  deadlines by the stall's duration.
struct PlaybackClock {
    epoch: Instant,
    base_pts_ms: f64,
    halted: Duration,
}

impl PlaybackClock {
    const MAX_OFFSET: Duration = Duration::from_secs(86_400);

    fn deadline(&self, pts_ms: f64) -> Instant {
        let offset_ms = (pts_ms - self.base_pts_ms).max(0.0);
        let offset = Duration::try_from_secs_f64(offset_ms / 1000.0)
            .unwrap_or(Self::MAX_OFFSET)
            .min(Self::MAX_OFFSET);
        self.epoch.checked_add(offset.saturating_add(self.halted))
            .unwrap_or(self.epoch)
    }
}

/// Jitter buffer and playback scheduler: buffers frames until the pre-buffer threshold is
///  reached, then releases each frame at `epoch + (pts - first pts)`.
///
/// Frames arrive in increasing id order (the loss detector sees to that), so the lowest
///  buffered frame is always the next one to play and any ids below it are lost. When the
///  buffer runs empty, playback waits for the next frame until its predicted deadline and then
///  stalls.
pub struct PlaybackScheduler {
    settings: PlaybackSettings,
    inputs: mpsc::Receiver<PlaybackInput>,
    metrics: SharedMetrics,
    sink: Box<dyn FrameSink>,

    buffer: BTreeMap<u32, Frame>,
    next_frame_id: u32,
    last_played: Option<(u32, f32)>,
    frame_interval_ms: f64,
    end_of_stream: bool,
    /// set when a stall timed out: playback continues but does not count further stalls until
    ///  the next frame is played
    starved: bool,
}

impl PlaybackScheduler {
    /// shorter halts are below timer resolution and not counted as stalls
    const MIN_STALL: Duration = Duration::from_millis(1);

    pub fn new(settings: PlaybackSettings, inputs: mpsc::Receiver<PlaybackInput>, metrics: SharedMetrics, sink: Box<dyn FrameSink>) -> PlaybackScheduler {
        let frame_interval_ms = settings.nominal_frame_interval_ms;
        PlaybackScheduler {
            settings,
            inputs,
            metrics,
            sink,
            buffer: BTreeMap::new(),
            next_frame_id: 0,
            last_played: None,
            frame_interval_ms,
            end_of_stream: false,
            starved: false,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        self.prebuffer().await;

        let Some(base_pts_ms) = self.buffer.first_key_value().map(|(_, f)| f.pts_ms) else {
            info!("stream ended before playback started");
            return;
        };
        let epoch = Instant::now();
        self.metrics.lock().await.mark_playback_start(epoch);
        let mut clock = PlaybackClock {
            epoch,
            base_pts_ms: base_pts_ms as f64,
            halted: Duration::ZERO,
        };

        loop {
            let next = self.buffer.first_key_value().map(|(&id, f)| (id, f.pts_ms));
            match next {
                Some((frame_id, pts_ms)) => {
                    let deadline = clock.deadline(pts_ms as f64);
                    let input = select! {
                        _ = sleep_until(deadline) => None,
                        input = self.inputs.recv(), if !self.end_of_stream => Some(input),
                    };
                    match input {
                        None => self.play(frame_id, deadline).await,
                        Some(input) => self.on_input(input).await,
                    }
                }
                None if self.end_of_stream => break,
                None => self.wait_for_frame(&mut clock).await,
            }
        }

        self.metrics.lock().await.mark_playback_end(Instant::now());
        info!("playback finished");
    }

    async fn prebuffer(&mut self) {
        let started = Instant::now();
        while !self.end_of_stream && (self.buffer.len() < self.settings.prebuffer_frames || self.buffer.is_empty()) {
            self.recv_or_idle().await;
        }
        info!("Pre-buffering complete after {:.2} ms ({} frames)", started.elapsed().as_secs_f64() * 1000.0, self.buffer.len());
    }

    /// The buffer is empty: wait for the next frame until it is due, then stall
    async fn wait_for_frame(&mut self, clock: &mut PlaybackClock) {
        if self.starved {
            self.recv_or_idle().await;
            return;
        }

        let expected_pts_ms = match self.last_played {
            Some((last_id, last_pts)) => last_pts as f64 + self.frame_interval_ms * self.next_frame_id.saturating_sub(last_id) as f64,
            None => clock.base_pts_ms,
        };
        let input = select! {
            _ = sleep_until(clock.deadline(expected_pts_ms)) => None,
            input = self.inputs.recv() => Some(input),
        };
        if let Some(input) = input {
            self.on_input(input).await;
            return;
        }

        debug!("frame #{} is not available at its deadline - stalling", self.next_frame_id);
        let stall_start = Instant::now();
        match timeout(self.settings.stall_timeout, self.inputs.recv()).await {
            Ok(input) => {
                self.on_input(input).await;

                // the clock stood still from the arrived frame's deadline until now
                if let Some(pts_ms) = self.buffer.first_key_value().map(|(_, f)| f.pts_ms) {
                    let halted = Instant::now().saturating_duration_since(clock.deadline(pts_ms as f64));
                    if halted >= Self::MIN_STALL {
                        info!("resuming playback after a stall of {:.2} ms", halted.as_secs_f64() * 1000.0);
                        clock.halted += halted;
                        self.metrics.lock().await.record_stall(halted);
                    }
                }
            }
            Err(_) => {
                let halted = Instant::now().saturating_duration_since(stall_start);
                warn!("frame #{} still missing after {:?} - resuming playback", self.next_frame_id, halted);
                clock.halted += halted;
                self.metrics.lock().await.record_stall(halted);
                self.starved = true;
            }
        }
    }

    /// Waits for the next input. The end of stream marker is a single datagram, so a stream
    ///  that falls silent for the idle timeout is treated as ended.
    async fn recv_or_idle(&mut self) {
        match timeout(self.settings.idle_timeout, self.inputs.recv()).await {
            Ok(input) => self.on_input(input).await,
            Err(_) => {
                warn!("no frames for {:?} - assuming the end of stream was lost", self.settings.idle_timeout);
                self.end_of_stream = true;
            }
        }
    }

    async fn on_input(&mut self, input: Option<PlaybackInput>) {
        match input {
            Some(PlaybackInput::Frame(frame)) => self.admit(frame).await,
            Some(PlaybackInput::EndOfStream) => {
                debug!("end of stream, {} frames left in the buffer", self.buffer.len());
                self.end_of_stream = true;
            }
            None => {
                debug!("frame producer is gone - treating as end of stream");
                self.end_of_stream = true;
            }
        }
    }

    async fn admit(&mut self, frame: Frame) {
        let cause = if frame.frame_id < self.next_frame_id {
            DropCause::Late
        }
        else if self.buffer.contains_key(&frame.frame_id) {
            DropCause::Duplicate
        }
        else if self.buffer.len() >= self.settings.capacity {
            DropCause::Overflow
        }
        else {
            self.buffer.insert(frame.frame_id, frame);
            return;
        };

        debug!("frame #{} not admitted to the jitter buffer: {:?}", frame.frame_id, cause);
        self.metrics.lock().await.record_dropped(cause);
    }

    async fn play(&mut self, frame_id: u32, deadline: Instant) {
        let Some(frame) = self.buffer.remove(&frame_id) else {
            return;
        };
        let played_at = Instant::now();
        let delay_ms = played_at.saturating_duration_since(deadline).as_millis() as f64;

        if let Some((last_id, last_pts)) = self.last_played {
            if frame_id > last_id {
                let spacing = (frame.pts_ms - last_pts) as f64 / (frame_id - last_id) as f64;
                if spacing > 0.0 {
                    self.frame_interval_ms = spacing;
                }
            }
        }
        self.last_played = Some((frame_id, frame.pts_ms));
        self.next_frame_id = frame_id.saturating_add(1);
        self.starved = false;

        self.metrics.lock().await.record_played(frame.data.len(), delay_ms);
        self.sink.on_frame_played(&PlayedFrame {
            frame_id,
            pts_ms: frame.pts_ms,
            delay_ms,
            len: frame.data.len(),
            played_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::test_util::frames::{collect_played, CollectingSink, SyntheticSource};
    use tokio::runtime::Builder;
    use tokio::time::sleep;

    fn settings(prebuffer_frames: usize) -> PlaybackSettings {
        PlaybackSettings {
            prebuffer_frames,
            capacity: 64,
            stall_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(5),
            nominal_frame_interval_ms: 1000.0 / 24.0,
        }
    }

    fn frame(frame_id: u32) -> Frame {
        SyntheticSource::frame(frame_id, 24.0, 32)
    }

    fn ms(d: Duration) -> f64 {
        d.as_secs_f64() * 1000.0
    }

    #[test]
    fn test_prebuffered_playback_is_paced_by_pts() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(64);
            let metrics = Metrics::new_shared();
            let (sink, mut played) = CollectingSink::new();
            let handle = PlaybackScheduler::new(settings(10), receiver, metrics.clone(), Box::new(sink)).spawn();

            let t0 = Instant::now();
            for id in 0..12 {
                sender.send(PlaybackInput::Frame(frame(id))).await.unwrap();
            }
            sender.send(PlaybackInput::EndOfStream).await.unwrap();
            handle.await.unwrap();

            let played = collect_played(&mut played);
            assert_eq!(played.iter().map(|p| p.frame_id).collect::<Vec<_>>(), (0..12).collect::<Vec<_>>());
            for p in &played {
                assert_eq!(p.delay_ms, 0.0);
                let offset = ms(p.played_at.duration_since(t0));
                assert!(offset >= p.pts_ms as f64 && offset < p.pts_ms as f64 + 1.0, "frame {} at {}", p.frame_id, offset);
            }

            let snapshot = metrics.lock().await.snapshot();
            assert_eq!(snapshot.frames_played, 12);
            assert_eq!(snapshot.stall_count, 0);
            assert_eq!(snapshot.frames_dropped, 0);
            assert_eq!(snapshot.bytes_played, 12 * 32);
        });
    }

    #[test]
    fn test_waits_for_prebuffer() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(64);
            let metrics = Metrics::new_shared();
            let (sink, mut played) = CollectingSink::new();
            let _handle = PlaybackScheduler::new(settings(3), receiver, metrics.clone(), Box::new(sink)).spawn();

            sender.send(PlaybackInput::Frame(frame(0))).await.unwrap();
            sender.send(PlaybackInput::Frame(frame(1))).await.unwrap();
            sleep(Duration::from_millis(500)).await;
            assert!(collect_played(&mut played).is_empty());

            sender.send(PlaybackInput::Frame(frame(2))).await.unwrap();
            sleep(Duration::from_millis(1)).await;
            assert_eq!(collect_played(&mut played).len(), 1);
        });
    }

    #[test]
    fn test_stall_before_frame_8() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(64);
            let metrics = Metrics::new_shared();
            let (sink, mut played) = CollectingSink::new();
            let handle = PlaybackScheduler::new(settings(5), receiver, metrics.clone(), Box::new(sink)).spawn();

            let t0 = Instant::now();
            for id in 0..8 {
                sender.send(PlaybackInput::Frame(frame(id))).await.unwrap();
            }
            // frame 8 is due at 333.3ms and arrives 200ms late
            sleep_until(t0 + Duration::from_secs_f64(0.5333)).await;
            for id in 8..12 {
                sender.send(PlaybackInput::Frame(frame(id))).await.unwrap();
            }
            sender.send(PlaybackInput::EndOfStream).await.unwrap();
            handle.await.unwrap();

            let snapshot = metrics.lock().await.snapshot();
            assert_eq!(snapshot.frames_played, 12);
            assert_eq!(snapshot.stall_count, 1);
            let stall = ms(snapshot.total_stall_duration);
            assert!((199.0..=202.0).contains(&stall), "stall of {} ms", stall);
            assert_eq!(snapshot.max_delay_ms, 0.0);

            // after the stall, frames are aligned to their pts shifted by the stall
            let played = collect_played(&mut played);
            for p in played.iter().filter(|p| p.frame_id >= 8) {
                let offset = ms(p.played_at.duration_since(t0));
                let aligned = p.pts_ms as f64 + stall;
                assert!(offset >= aligned - 0.01 && offset < aligned + 1.0, "frame {} at {}, expected {}", p.frame_id, offset, aligned);
            }
        });
    }

    #[test]
    fn test_lost_frames_are_skipped_without_stall() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(64);
            let metrics = Metrics::new_shared();
            let (sink, mut played) = CollectingSink::new();
            let handle = PlaybackScheduler::new(settings(3), receiver, metrics.clone(), Box::new(sink)).spawn();

            for id in [0, 1, 2, 4, 5, 8, 9] {
                sender.send(PlaybackInput::Frame(frame(id))).await.unwrap();
            }
            sender.send(PlaybackInput::EndOfStream).await.unwrap();
            handle.await.unwrap();

            let played = collect_played(&mut played);
            assert_eq!(played.iter().map(|p| p.frame_id).collect::<Vec<_>>(), vec![0, 1, 2, 4, 5, 8, 9]);
            assert!(played.iter().all(|p| p.delay_ms == 0.0));
            assert_eq!(metrics.lock().await.snapshot().stall_count, 0);
        });
    }

    #[test]
    fn test_gap_in_stream_is_not_a_stall_if_the_next_frame_is_on_time() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(64);
            let metrics = Metrics::new_shared();
            let (sink, _played) = CollectingSink::new();
            let handle = PlaybackScheduler::new(settings(2), receiver, metrics.clone(), Box::new(sink)).spawn();

            let t0 = Instant::now();
            sender.send(PlaybackInput::Frame(frame(0))).await.unwrap();
            sender.send(PlaybackInput::Frame(frame(1))).await.unwrap();
            // frames 2 and 3 are lost, frame 4 (due at 166.7ms) arrives early
            sleep_until(t0 + Duration::from_millis(150)).await;
            sender.send(PlaybackInput::Frame(frame(4))).await.unwrap();
            sender.send(PlaybackInput::EndOfStream).await.unwrap();
            handle.await.unwrap();

            let snapshot = metrics.lock().await.snapshot();
            assert_eq!(snapshot.frames_played, 3);
            assert_eq!(snapshot.stall_count, 0);
            assert_eq!(snapshot.max_delay_ms, 0.0);
        });
    }

    #[test]
    fn test_stall_timeout_resumes_playback() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(64);
            let metrics = Metrics::new_shared();
            let (sink, mut played) = CollectingSink::new();
            let handle = PlaybackScheduler::new(settings(2), receiver, metrics.clone(), Box::new(sink)).spawn();

            let t0 = Instant::now();
            sender.send(PlaybackInput::Frame(frame(0))).await.unwrap();
            sender.send(PlaybackInput::Frame(frame(1))).await.unwrap();
            // frame 2 is due at 83.3ms; the stall times out one second later
            sleep_until(t0 + Duration::from_secs(3)).await;
            sender.send(PlaybackInput::Frame(frame(2))).await.unwrap();
            sender.send(PlaybackInput::EndOfStream).await.unwrap();
            handle.await.unwrap();

            let snapshot = metrics.lock().await.snapshot();
            assert_eq!(snapshot.stall_count, 1);
            let stall = ms(snapshot.total_stall_duration);
            assert!((1000.0..1002.0).contains(&stall), "stall of {} ms", stall);

            // frame 2 is late by 3000 - 83.3 - stall ms
            let last = collect_played(&mut played).pop().unwrap();
            assert_eq!(last.frame_id, 2);
            assert!((1914.0..=1917.0).contains(&last.delay_ms), "delay {}", last.delay_ms);
        });
    }

    #[test]
    fn test_late_duplicate_and_overflow_are_counted() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(64);
            let metrics = Metrics::new_shared();
            let (sink, mut played) = CollectingSink::new();
            let mut settings = settings(2);
            settings.capacity = 3;
            let handle = PlaybackScheduler::new(settings, receiver, metrics.clone(), Box::new(sink)).spawn();

            let t0 = Instant::now();
            for id in [0, 1, 1] {
                sender.send(PlaybackInput::Frame(frame(id))).await.unwrap();
            }
            // frames 0 and 1 are played, frame 2 is not due before 83.3ms
            sleep_until(t0 + Duration::from_millis(50)).await;
            for id in 2..6 {
                sender.send(PlaybackInput::Frame(frame(id))).await.unwrap();
            }
            sleep_until(t0 + Duration::from_millis(300)).await;
            sender.send(PlaybackInput::Frame(frame(1))).await.unwrap();
            sender.send(PlaybackInput::EndOfStream).await.unwrap();
            handle.await.unwrap();

            let snapshot = metrics.lock().await.snapshot();
            assert_eq!(snapshot.duplicate_frames, 1);
            assert_eq!(snapshot.overflow_frames, 1);
            assert_eq!(snapshot.late_frames, 1);
            assert_eq!(snapshot.frames_dropped, 3);
            assert_eq!(collect_played(&mut played).iter().map(|p| p.frame_id).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        });
    }

    #[test]
    fn test_end_of_stream_before_prebuffer_is_complete() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(64);
            let metrics = Metrics::new_shared();
            let (sink, mut played) = CollectingSink::new();
            let handle = PlaybackScheduler::new(settings(10), receiver, metrics.clone(), Box::new(sink)).spawn();

            for id in 0..3 {
                sender.send(PlaybackInput::Frame(frame(id))).await.unwrap();
            }
            drop(sender);
            handle.await.unwrap();

            assert_eq!(collect_played(&mut played).len(), 3);
            let snapshot = metrics.lock().await.snapshot();
            assert_eq!(snapshot.frames_played, 3);
            assert!(snapshot.playback_duration.is_some());
        });
    }

    #[test]
    fn test_silent_stream_ends_after_idle_timeout() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(64);
            let metrics = Metrics::new_shared();
            let (sink, mut played) = CollectingSink::new();
            let handle = PlaybackScheduler::new(settings(2), receiver, metrics.clone(), Box::new(sink)).spawn();

            let t0 = Instant::now();
            for id in 0..3 {
                sender.send(PlaybackInput::Frame(frame(id))).await.unwrap();
            }
            // no end of stream, and the sender stays alive
            handle.await.unwrap();

            // frame 3 was due at 125ms, then one second of stall and five idle seconds
            let ended = ms(t0.elapsed());
            assert!((6125.0..6128.0).contains(&ended), "ended after {} ms", ended);
            assert_eq!(collect_played(&mut played).len(), 3);
            let snapshot = metrics.lock().await.snapshot();
            assert_eq!(snapshot.frames_played, 3);
            assert_eq!(snapshot.stall_count, 1);
            assert!(snapshot.playback_duration.is_some());
            drop(sender);
        });
    }

    #[test]
    fn test_silent_stream_ends_during_prebuffering() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(64);
            let metrics = Metrics::new_shared();
            let (sink, mut played) = CollectingSink::new();
            let handle = PlaybackScheduler::new(settings(10), receiver, metrics.clone(), Box::new(sink)).spawn();

            sender.send(PlaybackInput::Frame(frame(0))).await.unwrap();
            handle.await.unwrap();

            assert_eq!(collect_played(&mut played).len(), 1);
            drop(sender);
        });
    }

    #[test]
    fn test_far_future_pts_does_not_break_playback() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(64);
            let metrics = Metrics::new_shared();
            let (sink, mut played) = CollectingSink::new();
            let handle = PlaybackScheduler::new(settings(2), receiver, metrics.clone(), Box::new(sink)).spawn();

            sender.send(PlaybackInput::Frame(frame(0))).await.unwrap();
            sender.send(PlaybackInput::Frame(Frame { frame_id: 1, pts_ms: 1.0e30, data: frame(1).data })).await.unwrap();
            sender.send(PlaybackInput::EndOfStream).await.unwrap();
            handle.await.unwrap();

            assert_eq!(collect_played(&mut played).iter().map(|p| p.frame_id).collect::<Vec<_>>(), vec![0, 1]);
        });
    }
}
