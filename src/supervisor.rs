//! The supervisor: startup, steady-state polling, failure policy and shutdown.
//!
//! One entry exists per configured source for the whole run, whether it ever
//! connects or not, so the final report covers every source. The rotation is
//! the subset the poll loop still visits; a source leaves it at most once.
//!
//! Reconnects run on their own thread. While one is in flight the entry owns
//! only its join handle, and the poll loop keeps serving the other sources.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::connection::{
    ConnectionState, RetryPolicy, StreamConnection, CLOSE_GRACE, DEFAULT_JOIN_TIMEOUT,
};
use crate::decoder::DecoderFactory;
use crate::error::StreamError;
use crate::metrics::{fps, StreamCounters};
use crate::sink::{wall_clock_label, Delivery, FrameSink};
use crate::{SourceDescriptor, StreamId};

/// Default wait between reconnect rounds under `ExhaustionPolicy::RetryForever`.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// What happens to a source once a reconnect exhausts its attempt budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Remove the source from the rotation.
    #[default]
    DropOnExhaustion,
    /// Park the source and try again after `backoff`.
    RetryForever { backoff: Duration },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub retry: RetryPolicy,
    pub exhaustion: ExhaustionPolicy,
    pub join_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            exhaustion: ExhaustionPolicy::default(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Sleep between poll iterations. `None` only yields.
    pub poll_interval: Option<Duration>,
    /// Stop after this long. `None` runs until cancelled.
    pub duration: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    SinkRequested,
    DurationElapsed,
    NoActiveStreams,
}

type ReconnectOutcome = (StreamConnection, Result<(), StreamError>);

/// One configured source. Holds its connection, or the handle of the thread
/// currently reconnecting it, or neither once the connection is lost.
struct Entry {
    id: StreamId,
    label: String,
    uri: String,
    counters: Arc<StreamCounters>,
    first_success: Option<Instant>,
    conn: Option<StreamConnection>,
    reconnect: Option<JoinHandle<ReconnectOutcome>>,
    lost: Option<StreamError>,
}

impl Entry {
    fn new(conn: StreamConnection) -> Self {
        Self {
            id: conn.id(),
            label: conn.label().to_string(),
            uri: conn.uri().to_string(),
            counters: conn.metrics().counters(),
            first_success: conn.first_success(),
            conn: Some(conn),
            reconnect: None,
            lost: None,
        }
    }

    fn reconnect_finished(&self) -> bool {
        self.reconnect
            .as_ref()
            .is_some_and(|handle| handle.is_finished())
    }

    /// Take the connection back from a finished reconnect thread.
    fn join_reconnect(&mut self) -> Option<Result<(), StreamError>> {
        let handle = self.reconnect.take()?;
        match handle.join() {
            Ok((conn, result)) => {
                self.first_success = conn.first_success();
                self.conn = Some(conn);
                Some(result)
            }
            Err(_) => {
                let err = StreamError::connect(&self.uri, "reconnect thread panicked");
                self.lost = Some(err.clone());
                Some(Err(err))
            }
        }
    }

    /// Wait for an in-flight reconnect until `deadline`, then detach it.
    fn reap_reconnect(&mut self, deadline: Instant) {
        let Some(handle) = &self.reconnect else {
            return;
        };
        while !handle.is_finished() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(5)));
        }
        if self.reconnect_finished() {
            self.join_reconnect();
        } else if self.reconnect.take().is_some() {
            log::warn!("{}: reconnect still running at shutdown; detaching", self.label);
            self.lost = Some(StreamError::connect(
                &self.uri,
                "reconnect still running at shutdown",
            ));
        }
    }

    fn summary(&self, end: Instant) -> StreamSummary {
        match &self.conn {
            Some(conn) => StreamSummary {
                id: self.id,
                label: self.label.clone(),
                uri: self.uri.clone(),
                frame_count: conn.frame_count(),
                average_fps: conn.metrics().average_fps(end),
                last_error: conn.last_error(),
            },
            None => {
                let frame_count = self.counters.frames();
                StreamSummary {
                    id: self.id,
                    label: self.label.clone(),
                    uri: self.uri.clone(),
                    frame_count,
                    average_fps: self
                        .first_success
                        .map(|first| fps(frame_count, end.saturating_duration_since(first))),
                    last_error: self.lost.clone(),
                }
            }
        }
    }
}

pub struct StreamSupervisor {
    config: SupervisorConfig,
    entries: Vec<Entry>,
    rotation: Vec<StreamId>,
    parked: HashMap<StreamId, Instant>,
    stop: Arc<AtomicBool>,
}

impl StreamSupervisor {
    /// Create one connection per source and connect them all in parallel.
    ///
    /// Only an empty source list is an error. Sources that fail to connect
    /// are logged and left out of the rotation (or parked, under
    /// `RetryForever`); they still appear in the shutdown report.
    pub fn start_all(
        sources: Vec<SourceDescriptor>,
        factory: Arc<dyn DecoderFactory>,
        config: SupervisorConfig,
    ) -> Result<Self, StreamError> {
        Self::start_all_with_stop(sources, factory, config, Arc::new(AtomicBool::new(false)))
    }

    /// `start_all` with a caller-owned stop flag.
    ///
    /// Setting `stop` while sources are still connecting cuts their retry
    /// budgets short, and the supervisor returned is already cancelled.
    pub fn start_all_with_stop(
        sources: Vec<SourceDescriptor>,
        factory: Arc<dyn DecoderFactory>,
        config: SupervisorConfig,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, StreamError> {
        if sources.is_empty() {
            return Err(StreamError::config("no stream sources configured"));
        }

        let mut connections: Vec<StreamConnection> = sources
            .into_iter()
            .enumerate()
            .map(|(idx, source)| {
                StreamConnection::new(StreamId(idx + 1), source, factory.clone())
                    .with_join_timeout(config.join_timeout)
            })
            .collect();

        let retry = config.retry;
        let cancel: &AtomicBool = &stop;
        let connected: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = connections
                .iter_mut()
                .map(|conn| scope.spawn(move || conn.connect_until(&retry, cancel).is_ok()))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(false))
                .collect()
        });

        let mut supervisor = Self {
            config,
            entries: connections.into_iter().map(Entry::new).collect(),
            rotation: Vec::new(),
            parked: HashMap::new(),
            stop,
        };
        let now = Instant::now();
        for (entry, ok) in supervisor.entries.iter().zip(connected) {
            if ok {
                supervisor.rotation.push(entry.id);
                continue;
            }
            match supervisor.config.exhaustion {
                ExhaustionPolicy::DropOnExhaustion => {
                    log::error!("{}: could not connect; not added to rotation", entry.label);
                }
                ExhaustionPolicy::RetryForever { backoff } => {
                    log::warn!(
                        "{}: could not connect; retrying in {:?}",
                        entry.label,
                        backoff
                    );
                    supervisor.rotation.push(entry.id);
                    supervisor.parked.insert(entry.id, now + backoff);
                }
            }
        }
        if supervisor.stop.load(Ordering::SeqCst) {
            log::warn!("startup cancelled");
        }
        log::info!(
            "{} of {} streams connected",
            supervisor.running_captures(),
            supervisor.entries.len()
        );
        Ok(supervisor)
    }

    /// Flag checked by the run loop; set it to cancel from another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Sources in the rotation that are not waiting out a backoff.
    pub fn active_ids(&self) -> Vec<StreamId> {
        self.rotation
            .iter()
            .copied()
            .filter(|id| !self.parked.contains_key(id))
            .collect()
    }

    /// Sources waiting to be retried under `RetryForever`.
    pub fn parked_ids(&self) -> Vec<StreamId> {
        self.rotation
            .iter()
            .copied()
            .filter(|id| self.parked.contains_key(id))
            .collect()
    }

    /// Sources whose reconnect is running on a background thread.
    pub fn reconnecting_ids(&self) -> Vec<StreamId> {
        self.entries
            .iter()
            .filter(|entry| entry.reconnect.is_some())
            .map(|entry| entry.id)
            .collect()
    }

    /// The connection of `id`, unless a reconnect currently holds it.
    pub fn connection(&self, id: StreamId) -> Option<&StreamConnection> {
        self.entry(id).and_then(|entry| entry.conn.as_ref())
    }

    pub fn running_captures(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|entry| entry.conn.as_ref())
            .filter(|conn| conn.is_capturing())
            .count()
    }

    fn entry(&self, id: StreamId) -> Option<&Entry> {
        id.0.checked_sub(1).and_then(|idx| self.entries.get(idx))
    }

    /// Poll until cancelled, the sink asks to stop, the duration elapses or
    /// no source is left in the rotation.
    pub fn run_loop(&mut self, sink: &mut dyn FrameSink, options: &RunOptions) -> StopReason {
        log::info!(
            "poll loop starting with {} running capture threads",
            self.running_captures()
        );
        let started = Instant::now();
        let reason = loop {
            if self.stop.load(Ordering::SeqCst) {
                break StopReason::Cancelled;
            }
            if sink.stop_requested() {
                break StopReason::SinkRequested;
            }
            if options
                .duration
                .is_some_and(|duration| started.elapsed() >= duration)
            {
                break StopReason::DurationElapsed;
            }
            if self.rotation.is_empty() {
                break StopReason::NoActiveStreams;
            }

            self.poll_once(sink);

            match options.poll_interval {
                Some(interval) if !interval.is_zero() => thread::sleep(interval),
                _ => thread::yield_now(),
            }
        };
        log::info!("poll loop stopped: {:?}", reason);
        reason
    }

    /// One pass over the rotation. Returns the number of frames delivered.
    ///
    /// Never waits on a connect: failed sources are handed to a reconnect
    /// thread, and finished reconnects are collected on a later pass.
    pub fn poll_once(&mut self, sink: &mut dyn FrameSink) -> usize {
        let mut delivered = 0;
        for id in self.rotation.clone() {
            let Some(idx) = id.0.checked_sub(1).filter(|idx| *idx < self.entries.len()) else {
                continue;
            };
            if self.entries[idx].reconnect.is_some() {
                if self.entries[idx].reconnect_finished() {
                    self.finish_reconnect(idx, sink);
                }
                continue;
            }
            if let Some(&retry_at) = self.parked.get(&id) {
                if Instant::now() >= retry_at {
                    self.begin_reconnect(idx, sink);
                }
                continue;
            }
            let Some(conn) = self.entries[idx].conn.as_ref() else {
                continue;
            };
            match conn.state() {
                ConnectionState::Connected => {
                    if let Some(read) = conn.slot().read() {
                        let now = Instant::now();
                        let metrics = conn.metrics().snapshot(read.captured_at, now);
                        sink.deliver(Delivery {
                            id,
                            label: conn.label().to_string(),
                            frame: read.frame,
                            sequence: read.sequence,
                            metrics,
                            wall_clock: wall_clock_label(),
                        });
                        delivered += 1;
                    }
                }
                ConnectionState::Failed => self.begin_reconnect(idx, sink),
                _ => {}
            }
        }
        delivered
    }

    fn begin_reconnect(&mut self, idx: usize, sink: &mut dyn FrameSink) {
        let retry = self.config.retry;
        let stop = self.stop.clone();
        let entry = &mut self.entries[idx];
        let Some(mut conn) = entry.conn.take() else {
            return;
        };
        let id = entry.id;
        self.parked.remove(&id);

        log::info!("{}: reconnecting to {}", entry.label, entry.uri);
        let spawned = thread::Builder::new()
            .name(format!("reconnect-{}", entry.label))
            .spawn(move || {
                let result = conn.connect_until(&retry, &stop);
                (conn, result)
            });
        let err = match spawned {
            Ok(handle) => {
                entry.reconnect = Some(handle);
                return;
            }
            Err(err) => StreamError::connect(
                &entry.uri,
                format!("spawn reconnect thread: {}", err),
            ),
        };

        // The connection went down with the closure; nothing left to retry.
        entry.lost = Some(err.clone());
        let label = entry.label.clone();
        self.rotation.retain(|other| *other != id);
        log::error!("{}: removed: {}", label, err);
        sink.source_removed(id, &label, &err);
    }

    fn finish_reconnect(&mut self, idx: usize, sink: &mut dyn FrameSink) {
        let exhaustion = self.config.exhaustion;
        let entry = &mut self.entries[idx];
        let id = entry.id;
        let Some(result) = entry.join_reconnect() else {
            return;
        };
        let err = match result {
            Ok(()) => {
                self.parked.remove(&id);
                return;
            }
            Err(err) => err,
        };
        if self.stop.load(Ordering::SeqCst) {
            return;
        }

        let lost = entry.conn.is_none();
        match exhaustion {
            ExhaustionPolicy::RetryForever { backoff } if !lost => {
                log::warn!("{}: reconnect failed; next try in {:?}", entry.label, backoff);
                self.parked.insert(id, Instant::now() + backoff);
            }
            _ => {
                if let Some(conn) = entry.conn.as_mut() {
                    conn.mark_removed();
                }
                let label = entry.label.clone();
                self.parked.remove(&id);
                self.rotation.retain(|other| *other != id);
                log::warn!("{}: removed after failed reconnect", label);
                sink.source_removed(id, &label, &err);
            }
        }
    }

    /// Stop every capture loop, release every connection and summarise the run.
    ///
    /// All loops are signalled before any is joined, and in-flight reconnects
    /// share the same deadline, so the whole call is bounded by one join
    /// timeout plus one close grace period.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.stop.store(true, Ordering::SeqCst);
        for conn in self.entries.iter().filter_map(|entry| entry.conn.as_ref()) {
            conn.signal_stop();
        }

        let join_deadline = Instant::now() + self.config.join_timeout;
        for entry in &mut self.entries {
            entry.reap_reconnect(join_deadline);
        }
        for conn in self.entries.iter().filter_map(|entry| entry.conn.as_ref()) {
            conn.signal_stop();
        }
        for conn in self.entries.iter().filter_map(|entry| entry.conn.as_ref()) {
            conn.wait_for_capture(join_deadline);
        }
        for conn in self.entries.iter_mut().filter_map(|entry| entry.conn.as_mut()) {
            conn.interrupt();
        }
        let grace_deadline = Instant::now() + CLOSE_GRACE;
        for conn in self.entries.iter_mut().filter_map(|entry| entry.conn.as_mut()) {
            conn.release_by(join_deadline, grace_deadline);
        }

        let end = Instant::now();
        let streams: Vec<StreamSummary> = self
            .entries
            .iter()
            .map(|entry| entry.summary(end))
            .collect();
        for summary in &streams {
            log::info!("{}", summary);
        }
        ShutdownReport { streams }
    }
}

// ----------------------------------------------------------------------------
// Final report
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct StreamSummary {
    pub id: StreamId,
    pub label: String,
    pub uri: String,
    pub frame_count: u64,
    /// `None` when the source never connected.
    pub average_fps: Option<f64>,
    pub last_error: Option<StreamError>,
}

impl fmt::Display for StreamSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.average_fps {
            Some(fps) => write!(
                f,
                "{} - average FPS: {:.2} (total frames: {})",
                self.label, fps, self.frame_count
            ),
            None => write!(f, "{} - connection failed", self.label),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShutdownReport {
    pub streams: Vec<StreamSummary>,
}

impl ShutdownReport {
    pub fn stream(&self, id: StreamId) -> Option<&StreamSummary> {
        self.streams.iter().find(|summary| summary.id == id)
    }

    pub fn total_frames(&self) -> u64 {
        self.streams.iter().map(|summary| summary.frame_count).sum()
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Final report:")?;
        for summary in &self.streams {
            writeln!(f, "{}", summary)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(average_fps: Option<f64>, frame_count: u64) -> StreamSummary {
        StreamSummary {
            id: StreamId(1),
            label: "Stream_101_id=1".to_string(),
            uri: "rtsp://10.0.0.2:554/Streaming/Channels/101".to_string(),
            frame_count,
            average_fps,
            last_error: None,
        }
    }

    #[test]
    fn summary_lines_match_report_format() {
        assert_eq!(
            summary(Some(24.987), 7496).to_string(),
            "Stream_101_id=1 - average FPS: 24.99 (total frames: 7496)"
        );
        assert_eq!(
            summary(None, 0).to_string(),
            "Stream_101_id=1 - connection failed"
        );
    }

    #[test]
    fn report_lists_every_stream() {
        let report = ShutdownReport {
            streams: vec![summary(Some(10.0), 100), summary(None, 0)],
        };
        let text = report.to_string();
        assert_eq!(text.lines().count(), 3);
        assert_eq!(report.total_frames(), 100);
        assert!(report.stream(StreamId(1)).is_some());
        assert!(report.stream(StreamId(9)).is_none());
    }

    #[test]
    fn defaults_follow_retry_budget() {
        let config = SupervisorConfig::default();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.retry_interval, Duration::from_secs(2));
        assert_eq!(config.exhaustion, ExhaustionPolicy::DropOnExhaustion);
        assert_eq!(config.join_timeout, Duration::from_secs(1));
    }
}
