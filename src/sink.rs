//! Consumer side of the poll loop.
//!
//! The supervisor hands every freshly polled frame to a `FrameSink`. Rendering
//! and overlays live outside this crate; `LogSink` is the headless sink the
//! daemon uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::StreamError;
use crate::frame::Frame;
use crate::metrics::MetricsSnapshot;
use crate::StreamId;

/// One frame handed to the sink, with the metrics computed when it was polled.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub id: StreamId,
    pub label: String,
    pub frame: Frame,
    pub sequence: u64,
    pub metrics: MetricsSnapshot,
    /// Local wall-clock time of the poll, `HH:MM:SS`.
    pub wall_clock: String,
}

impl Delivery {
    pub fn latency_ms(&self) -> f64 {
        self.metrics.latency_ms()
    }

    pub fn fps(&self) -> f64 {
        self.metrics.fps
    }

    pub fn frame_count(&self) -> u64 {
        self.metrics.frame_count
    }
}

pub fn wall_clock_label() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

pub trait FrameSink {
    fn deliver(&mut self, delivery: Delivery);

    /// Checked once per poll iteration; `true` ends the run loop.
    fn stop_requested(&self) -> bool {
        false
    }

    /// Called exactly once when a source leaves the rotation for good.
    fn source_removed(&mut self, _id: StreamId, _label: &str, _reason: &StreamError) {}
}

#[derive(Debug, Default)]
struct SinkStream {
    last_sequence: Option<u64>,
    last_logged: Option<Instant>,
    skipped: u64,
}

/// Logs one status line per stream at most every `interval`.
pub struct LogSink {
    interval: Duration,
    streams: HashMap<StreamId, SinkStream>,
    quit: Option<Arc<AtomicBool>>,
}

impl LogSink {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            streams: HashMap::new(),
            quit: None,
        }
    }

    /// Share a flag that, once set, asks the run loop to stop.
    pub fn with_quit_flag(mut self, quit: Arc<AtomicBool>) -> Self {
        self.quit = Some(quit);
        self
    }

    /// Frames the poll loop never saw for `id`, judged from sequence gaps.
    pub fn skipped(&self, id: StreamId) -> u64 {
        self.streams.get(&id).map_or(0, |stream| stream.skipped)
    }
}

impl FrameSink for LogSink {
    fn deliver(&mut self, delivery: Delivery) {
        let stream = self.streams.entry(delivery.id).or_default();
        if let Some(last) = stream.last_sequence {
            if delivery.sequence > last + 1 {
                stream.skipped += delivery.sequence - last - 1;
            }
        }
        stream.last_sequence = Some(delivery.sequence);

        let now = Instant::now();
        let due = stream
            .last_logged
            .map_or(true, |at| now.duration_since(at) >= self.interval);
        if due {
            stream.last_logged = Some(now);
            log::info!(
                "{} FPS: {:.2} latency: {:.1} ms frames: {} time: {}",
                delivery.label,
                delivery.fps(),
                delivery.latency_ms(),
                delivery.frame_count(),
                delivery.wall_clock
            );
        }
    }

    fn stop_requested(&self) -> bool {
        self.quit
            .as_ref()
            .is_some_and(|quit| quit.load(Ordering::SeqCst))
    }

    fn source_removed(&mut self, id: StreamId, label: &str, reason: &StreamError) {
        self.streams.remove(&id);
        log::warn!("{}: removed from rotation: {}", label, reason);
    }
}
