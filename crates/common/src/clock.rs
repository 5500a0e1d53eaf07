//! Media clock utilities.
//!
//! Codec APIs speak microseconds; this module holds the conversions and
//! the small timing helpers the merge loop uses:
//! - Output frame cadence (presentation timestamps for frame `n`)
//! - Drift measurement between the two input streams
//! - A stall watchdog for the cooperative decode loop

use std::time::{Duration, Instant};

/// Microseconds per second.
pub const MICROS_PER_SEC: i64 = 1_000_000;

/// Convert microseconds to seconds.
pub fn us_to_secs(us: i64) -> f64 {
    us as f64 / MICROS_PER_SEC as f64
}

/// Convert seconds to microseconds.
pub fn secs_to_us(secs: f64) -> i64 {
    (secs * MICROS_PER_SEC as f64).round() as i64
}

/// Fixed-rate presentation timestamps for an output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCadence {
    frame_rate: u32,
}

impl FrameCadence {
    /// A zero rate is clamped to 1 fps.
    pub fn new(frame_rate: u32) -> Self {
        Self {
            frame_rate: frame_rate.max(1),
        }
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    /// Presentation time of frame `index`, in microseconds.
    pub fn pts_us(&self, index: u64) -> i64 {
        (index as i128 * MICROS_PER_SEC as i128 / self.frame_rate as i128) as i64
    }

    /// Duration of a single frame, in microseconds.
    pub fn frame_duration_us(&self) -> i64 {
        MICROS_PER_SEC / self.frame_rate as i64
    }

    /// Duration covered by `frames` frames, in seconds.
    pub fn duration_secs(&self, frames: u64) -> f64 {
        frames as f64 / self.frame_rate as f64
    }

    /// Number of frames needed to cover `duration_us`, rounded to nearest.
    pub fn frames_for_duration_us(&self, duration_us: i64) -> u64 {
        if duration_us <= 0 {
            return 0;
        }
        ((duration_us as f64 * self.frame_rate as f64) / MICROS_PER_SEC as f64).round() as u64
    }
}

/// Drift measurement between two streams.
#[derive(Debug, Clone, Copy)]
pub struct DriftMeasurement {
    /// Timestamp in the reference stream (µs).
    pub reference_us: i64,
    /// Timestamp in the measured stream (µs).
    pub measured_us: i64,
}

impl DriftMeasurement {
    /// Drift in microseconds (positive = measured is ahead).
    pub fn drift_us(&self) -> i64 {
        self.measured_us - self.reference_us
    }

    /// Drift in milliseconds.
    pub fn drift_ms(&self) -> f64 {
        self.drift_us() as f64 / 1_000.0
    }

    /// Whether drift exceeds an acceptable threshold.
    pub fn exceeds_threshold_ms(&self, threshold_ms: f64) -> bool {
        self.drift_ms().abs() > threshold_ms
    }
}

/// Detects a polling loop that has stopped making progress.
#[derive(Debug)]
pub struct StallWatchdog {
    timeout: Duration,
    last_progress: Instant,
}

impl StallWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_progress: Instant::now(),
        }
    }

    /// Record that the loop produced something.
    pub fn progressed(&mut self) {
        self.last_progress = Instant::now();
    }

    /// Time since the last recorded progress.
    pub fn idle(&self) -> Duration {
        self.last_progress.elapsed()
    }

    pub fn is_stalled(&self) -> bool {
        self.idle() >= self.timeout
    }
}
