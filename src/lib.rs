//! Multi-stream capture supervisor.
//!
//! Keeps a set of live network video sources connected and exposes the most
//! recent frame of each one to a single consumer loop.
//!
//! # Architecture
//!
//! - One `StreamConnection` per configured source owns that source's decoder
//!   handle and its connect/retry state machine.
//! - Each connected source runs a `CaptureLoop` on its own thread that
//!   publishes into a bufferless `FrameSlot` (latest frame wins).
//! - The `StreamSupervisor` polls every slot, computes metrics, hands frames
//!   to a `FrameSink`, reconnects or removes failed sources, and shuts
//!   everything down within a bounded time.
//!
//! Delivery is lossy on purpose: a slow consumer misses frames, a slow
//! producer yields duplicates. Nothing is queued.
//!
//! # Module Structure
//!
//! - `frame`: `Frame`, `FrameSlot`
//! - `decoder`: decoder collaborator traits, synthetic and GStreamer backends
//! - `capture`: background capture loop
//! - `connection`: per-source state machine
//! - `metrics`: frame counts, FPS, latency
//! - `sink`: consumer trait and the logging sink
//! - `supervisor`: startup, poll loop, failure policy, shutdown
//! - `config`: daemon configuration

use std::fmt;

pub mod capture;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod sink;
pub mod supervisor;
pub mod ui;

pub use config::StreamdConfig;
pub use connection::{ConnectionState, RetryPolicy, StreamConnection};
pub use decoder::{Decoder, DecoderFactory, DefaultDecoderFactory, SyntheticFactory};
pub use error::StreamError;
pub use frame::{Frame, FrameSlot, SlotRead};
pub use metrics::{MetricsRecorder, MetricsSnapshot};
pub use sink::{Delivery, FrameSink, LogSink};
pub use supervisor::{
    ExhaustionPolicy, RunOptions, ShutdownReport, StopReason, StreamSummary, StreamSupervisor,
    SupervisorConfig,
};

// -------------------- Sources --------------------

/// Stable identity of a configured source, 1-based in configuration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub usize);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub uri: String,
    pub label: String,
}

impl SourceDescriptor {
    pub fn new(uri: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            label: label.into(),
        }
    }

    /// Descriptor with the default label for the `n`-th source (1-based).
    pub fn numbered(uri: impl Into<String>, n: usize) -> Self {
        let uri = uri.into();
        let label = default_label(&uri, n);
        Self { uri, label }
    }
}

/// `Stream_{last path segment}_id={n}`, ignoring any query string.
pub fn default_label(uri: &str, n: usize) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let tail = path.rsplit('/').next().unwrap_or(path);
    format!("Stream_{}_id={}", tail, n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_labels_use_last_path_segment() {
        assert_eq!(
            default_label("rtsp://192.168.200.132:554/Streaming/Channels/101", 1),
            "Stream_101_id=1"
        );
        assert_eq!(default_label("stub://front_camera?fps=10", 2), "Stream_front_camera_id=2");
    }

    #[test]
    fn numbered_descriptor_carries_default_label() {
        let source = SourceDescriptor::numbered("stub://lobby", 3);
        assert_eq!(source.uri, "stub://lobby");
        assert_eq!(source.label, "Stream_lobby_id=3");
        assert_eq!(StreamId(3).to_string(), "#3");
    }
}
