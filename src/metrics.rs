//! Per-stream throughput and latency accounting.
//!
//! Nothing here is persisted. FPS is derived from the running frame count and
//! the instant of the first successful connection; latency is derived from the
//! capture instant of the frame the poll loop just consumed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters written by a capture loop and read by the poll loop.
///
/// Atomic so the capture thread never waits on a reader.
#[derive(Debug, Default)]
pub struct StreamCounters {
    frames: AtomicU64,
}

impl StreamCounters {
    pub fn record_frame(&self) -> u64 {
        self.frames.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

/// Derived view computed once per delivered frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricsSnapshot {
    pub frame_count: u64,
    pub elapsed: Duration,
    pub fps: f64,
    pub latency: Duration,
}

impl MetricsSnapshot {
    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

/// Frames per second over `elapsed`, or 0.0 when no time has passed.
pub fn fps(frame_count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        frame_count as f64 / secs
    } else {
        0.0
    }
}

/// Owned by a `StreamConnection`; shares its counters with the capture loop.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    counters: Arc<StreamCounters>,
    first_success: Option<Instant>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle given to the capture loop.
    pub fn counters(&self) -> Arc<StreamCounters> {
        self.counters.clone()
    }

    pub fn frame_count(&self) -> u64 {
        self.counters.frames()
    }

    pub fn first_success(&self) -> Option<Instant> {
        self.first_success
    }

    /// Remember the first successful connection. Later reconnects keep the first instant.
    pub fn mark_connected(&mut self, at: Instant) {
        self.first_success.get_or_insert(at);
    }

    pub fn snapshot(&self, captured_at: Instant, now: Instant) -> MetricsSnapshot {
        let frame_count = self.frame_count();
        let elapsed = self
            .first_success
            .map(|first| now.saturating_duration_since(first))
            .unwrap_or_default();
        MetricsSnapshot {
            frame_count,
            elapsed,
            fps: fps(frame_count, elapsed),
            latency: now.saturating_duration_since(captured_at),
        }
    }

    /// Average FPS since first success, `None` if the stream never connected.
    pub fn average_fps(&self, end: Instant) -> Option<f64> {
        self.first_success
            .map(|first| fps(self.frame_count(), end.saturating_duration_since(first)))
    }
}
