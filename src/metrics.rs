use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use ordered_float::OrderedFloat;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Why a frame did not make it to the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    Corrupt,
    Lost,
    Duplicate,
    Late,
    /// the playback queue or jitter buffer was full
    Overflow,
}

pub type SharedMetrics = Arc<Mutex<Metrics>>;

/// Accumulates the raw playback measurements of one stream
#[derive(Debug, Default)]
pub struct Metrics {
    frames_played: u64,
    bytes_played: u64,
    corrupt: u64,
    lost: u64,
    duplicate: u64,
    late: u64,
    overflow: u64,
    delay_samples_ms: Vec<f64>,
    stall_durations: Vec<Duration>,
    requested_at: Option<Instant>,
    playback_started_at: Option<Instant>,
    playback_ended_at: Option<Instant>,
}

impl Metrics {
    pub fn new() -> Metrics {
        Default::default()
    }

    pub fn new_shared() -> SharedMetrics {
        Arc::new(Mutex::new(Metrics::new()))
    }

    pub fn mark_requested(&mut self, at: Instant) {
        self.requested_at = Some(at);
    }

    pub fn mark_playback_start(&mut self, at: Instant) {
        self.playback_started_at.get_or_insert(at);
    }

    /// no-op unless playback started, and only the first call counts
    pub fn mark_playback_end(&mut self, at: Instant) {
        if self.playback_started_at.is_some() {
            self.playback_ended_at.get_or_insert(at);
        }
    }

    pub fn record_played(&mut self, bytes: usize, delay_ms: f64) {
        self.frames_played += 1;
        self.bytes_played += bytes as u64;
        self.delay_samples_ms.push(delay_ms.max(0.0));
    }

    pub fn record_dropped(&mut self, cause: DropCause) {
        self.record_dropped_many(cause, 1);
    }

    pub fn record_dropped_many(&mut self, cause: DropCause, count: u64) {
        let counter = match cause {
            DropCause::Corrupt => &mut self.corrupt,
            DropCause::Lost => &mut self.lost,
            DropCause::Duplicate => &mut self.duplicate,
            DropCause::Late => &mut self.late,
            DropCause::Overflow => &mut self.overflow,
        };
        *counter += count;
    }

    pub fn record_stall(&mut self, duration: Duration) {
        self.stall_durations.push(duration);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_stall_duration: Duration = self.stall_durations.iter().sum();
        let average_stall_duration = if self.stall_durations.is_empty() {
            Duration::ZERO
        }
        else {
            total_stall_duration / self.stall_durations.len() as u32
        };

        let mut sorted: Vec<OrderedFloat<f64>> = self.delay_samples_ms.iter()
            .map(|&d| OrderedFloat(d))
            .collect();
        sorted.sort();

        let average_delay_ms = if sorted.is_empty() {
            0.0
        }
        else {
            self.delay_samples_ms.iter().sum::<f64>() / sorted.len() as f64
        };

        let startup_delay = match (self.requested_at, self.playback_started_at) {
            (Some(requested), Some(started)) => Some(started.saturating_duration_since(requested)),
            _ => None,
        };
        let playback_duration = match (self.playback_started_at, self.playback_ended_at) {
            (Some(started), Some(ended)) => Some(ended.saturating_duration_since(started)),
            _ => None,
        };

        MetricsSnapshot {
            frames_played: self.frames_played,
            frames_dropped: self.corrupt + self.lost + self.duplicate + self.late + self.overflow,
            corrupt_frames: self.corrupt,
            lost_frames: self.lost,
            duplicate_frames: self.duplicate,
            late_frames: self.late,
            overflow_frames: self.overflow,
            bytes_played: self.bytes_played,
            stall_count: self.stall_durations.len(),
            total_stall_duration,
            average_stall_duration,
            startup_delay,
            playback_duration,
            average_delay_ms,
            max_delay_ms: sorted.last().map(|d| d.0).unwrap_or(0.0),
            p95_delay_ms: nearest_rank_percentile(&sorted, 95.0),
            delay_samples_ms: self.delay_samples_ms.clone(),
        }
    }
}

/// Nearest-rank percentile: the smallest sample such that at least `percentile`% of all
///  samples are less than or equal to it. 0 for an empty sample set.
fn nearest_rank_percentile(sorted: &[OrderedFloat<f64>], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (percentile / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1].0
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub frames_played: u64,
    /// corrupt + lost + duplicate + late + overflow
    pub frames_dropped: u64,
    pub corrupt_frames: u64,
    pub lost_frames: u64,
    pub duplicate_frames: u64,
    pub late_frames: u64,
    pub overflow_frames: u64,
    pub bytes_played: u64,
    pub stall_count: usize,
    pub total_stall_duration: Duration,
    pub average_stall_duration: Duration,
    /// from the PLAY request to the end of pre-buffering
    pub startup_delay: Option<Duration>,
    pub playback_duration: Option<Duration>,
    pub average_delay_ms: f64,
    pub max_delay_ms: f64,
    pub p95_delay_ms: f64,
    pub delay_samples_ms: Vec<f64>,
}

impl Display for MetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let rule = "=".repeat(50);
        writeln!(f, "{}", rule)?;
        writeln!(f, "PLAYBACK METRICS SUMMARY")?;
        writeln!(f, "{}", rule)?;
        writeln!(f, "Total Frames Played: {}", self.frames_played)?;
        writeln!(f, "Total Frames Dropped: {} (corrupt {}, lost {}, duplicate {}, late {}, overflow {})",
                 self.frames_dropped, self.corrupt_frames, self.lost_frames, self.duplicate_frames, self.late_frames, self.overflow_frames)?;
        writeln!(f, "Total Bytes Played: {}", self.bytes_played)?;
        writeln!(f, "Total Stalls: {}", self.stall_count)?;
        writeln!(f, "Max Delay: {:.2} ms", self.max_delay_ms)?;
        writeln!(f, "Average Delay: {:.2} ms", self.average_delay_ms)?;
        writeln!(f, "95th Percentile Delay: {:.2} ms", self.p95_delay_ms)?;
        writeln!(f, "Average Stall Duration: {:.2} ms", self.average_stall_duration.as_secs_f64() * 1000.0)?;
        if let Some(startup_delay) = self.startup_delay {
            writeln!(f, "Startup Delay: {:.2} ms", startup_delay.as_secs_f64() * 1000.0)?;
        }
        if let Some(playback_duration) = self.playback_duration {
            writeln!(f, "Playback Duration: {:.2} ms", playback_duration.as_secs_f64() * 1000.0)?;
        }
        write!(f, "{}", rule)
    }
}
