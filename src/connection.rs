//! One source's connection: decoder handle, connect/retry state machine and
//! capture loop ownership.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Failed -> Disconnected | Removed
//!                     |                                   ^
//!                     +------ (attempts exhausted) -------+--> Failed
//! ```
//!
//! A connection holds at most one open decoder handle and at most one running
//! capture loop. `connect` releases anything still held before retrying, and
//! every attempt that opened a handle but could not read a first frame closes
//! that handle before the next attempt.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::capture::{CaptureContext, CaptureHandle, CaptureLoop};
use crate::decoder::{guarded_open, guarded_read, Decoder, DecoderFactory};
use crate::error::StreamError;
use crate::frame::FrameSlot;
use crate::metrics::MetricsRecorder;
use crate::{SourceDescriptor, StreamId};

/// Default bound on joining a capture thread during release.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Extra wait after force-closing the decoder of a thread that missed the join timeout.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_millis(250);

const CANCEL_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Removed,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Failed => 3,
            Self::Removed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Failed,
            4 => Self::Removed,
            _ => Self::Disconnected,
        }
    }
}

/// State written by both the capture thread and the owning connection.
#[derive(Debug)]
pub struct ConnectionShared {
    state: AtomicU8,
    last_error: Mutex<Option<StreamError>>,
}

impl Default for ConnectionShared {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionShared {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Connected -> Failed. Returns true only for the call that made the transition.
    pub fn mark_failed(&self, err: &StreamError) -> bool {
        let transitioned = self
            .state
            .compare_exchange(
                ConnectionState::Connected.as_u8(),
                ConnectionState::Failed.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if transitioned {
            self.set_last_error(err.clone());
        }
        transitioned
    }

    pub fn last_error(&self) -> Option<StreamError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_error(&self, err: StreamError) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err);
    }
}

/// Bounded connect policy: fixed interval between attempts, no exponential growth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_interval: Duration::from_secs(2),
        }
    }
}

pub struct StreamConnection {
    id: StreamId,
    source: SourceDescriptor,
    factory: Arc<dyn DecoderFactory>,
    shared: Arc<ConnectionShared>,
    slot: Arc<FrameSlot>,
    metrics: MetricsRecorder,
    decoder: Option<Arc<dyn Decoder>>,
    capture: Option<CaptureHandle>,
    attempts_used: u32,
    join_timeout: Duration,
}

impl StreamConnection {
    pub fn new(id: StreamId, source: SourceDescriptor, factory: Arc<dyn DecoderFactory>) -> Self {
        Self {
            id,
            source,
            factory,
            shared: Arc::new(ConnectionShared::new()),
            slot: Arc::new(FrameSlot::new()),
            metrics: MetricsRecorder::new(),
            decoder: None,
            capture: None,
            attempts_used: 0,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.source.label
    }

    pub fn uri(&self) -> &str {
        &self.source.uri
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn last_error(&self) -> Option<StreamError> {
        self.shared.last_error()
    }

    /// Attempts spent by the most recent `connect`.
    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn frame_count(&self) -> u64 {
        self.metrics.frame_count()
    }

    pub fn first_success(&self) -> Option<Instant> {
        self.metrics.first_success()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture
            .as_ref()
            .is_some_and(|capture| !capture.is_finished())
    }

    /// Open the decoder and validate it with one read, up to `policy.max_attempts` times.
    ///
    /// On success the slot holds the first frame and a capture loop is running.
    /// On failure the state is `Failed` and nothing is left open.
    pub fn connect(&mut self, policy: &RetryPolicy) -> Result<(), StreamError> {
        self.connect_until(policy, &AtomicBool::new(false))
    }

    /// `connect` that gives up early once `cancel` is set.
    ///
    /// The flag is checked before every attempt and while waiting between
    /// attempts; an open or first read already in progress is not interrupted.
    pub fn connect_until(
        &mut self,
        policy: &RetryPolicy,
        cancel: &AtomicBool,
    ) -> Result<(), StreamError> {
        self.release();
        self.shared.set_state(ConnectionState::Connecting);
        self.attempts_used = 0;

        let max_attempts = policy.max_attempts.max(1);
        let mut last_err = StreamError::connect(&self.source.uri, "no connection attempt made");
        for attempt in 1..=max_attempts {
            if attempt > 1 && !sleep_unless_cancelled(policy.retry_interval, cancel) {
                return Err(self.cancelled());
            }
            if cancel.load(Ordering::SeqCst) {
                return Err(self.cancelled());
            }
            self.attempts_used = attempt;
            match self.try_connect_once() {
                Ok(()) => {
                    log::info!(
                        "{}: connected to {} (attempt {}/{})",
                        self.source.label,
                        self.source.uri,
                        attempt,
                        max_attempts
                    );
                    return Ok(());
                }
                Err(err) => {
                    log::warn!(
                        "{}: connect attempt {}/{} failed: {}",
                        self.source.label,
                        attempt,
                        max_attempts,
                        err
                    );
                    last_err = err;
                }
            }
        }

        log::error!(
            "{}: giving up after {} attempts",
            self.source.label,
            max_attempts
        );
        self.shared.set_state(ConnectionState::Failed);
        self.shared.set_last_error(last_err.clone());
        Err(last_err)
    }

    fn cancelled(&self) -> StreamError {
        log::info!(
            "{}: connect cancelled after {} attempts",
            self.source.label,
            self.attempts_used
        );
        let err = StreamError::connect(&self.source.uri, "connect cancelled");
        self.shared.set_state(ConnectionState::Failed);
        self.shared.set_last_error(err.clone());
        err
    }

    fn try_connect_once(&mut self) -> Result<(), StreamError> {
        let decoder = guarded_open(self.factory.as_ref(), &self.source.uri)?;
        let first = match guarded_read(decoder.as_ref()) {
            Ok(frame) => frame,
            Err(err) => {
                decoder.close();
                return Err(err);
            }
        };

        let now = Instant::now();
        self.metrics.mark_connected(now);
        self.slot.publish(first, now);
        self.shared.set_state(ConnectionState::Connected);

        let ctx = CaptureContext {
            label: self.source.label.clone(),
            decoder: decoder.clone(),
            slot: self.slot.clone(),
            counters: self.metrics.counters(),
            shared: self.shared.clone(),
        };
        match CaptureLoop::spawn(ctx) {
            Ok(capture) => {
                self.decoder = Some(decoder);
                self.capture = Some(capture);
                Ok(())
            }
            Err(err) => {
                decoder.close();
                self.slot.clear();
                self.shared.set_state(ConnectionState::Connecting);
                Err(StreamError::read(format!("spawn capture thread: {}", err)))
            }
        }
    }

    /// Ask the capture loop to stop without waiting for it.
    pub fn signal_stop(&self) {
        if let Some(capture) = &self.capture {
            capture.signal_stop();
        }
    }

    /// Stop the capture loop, close the decoder and clear the slot. Idempotent.
    pub fn release(&mut self) {
        let join_deadline = Instant::now() + self.join_timeout;
        self.release_by(join_deadline, join_deadline + CLOSE_GRACE);
    }

    /// Wait until the capture loop has exited or `deadline` passes.
    pub(crate) fn wait_for_capture(&self, deadline: Instant) -> bool {
        loop {
            if !self.is_capturing() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(5)));
        }
    }

    /// Close the decoder under a capture loop that is still running.
    pub(crate) fn interrupt(&mut self) {
        if self.is_capturing() {
            if let Some(decoder) = self.decoder.take() {
                log::debug!("{}: closing decoder under running capture", self.source.label);
                decoder.close();
            }
        }
    }

    pub(crate) fn release_by(&mut self, join_deadline: Instant, grace_deadline: Instant) {
        let pending = self.capture.take().and_then(|capture| {
            capture.signal_stop();
            capture
                .join_within(join_deadline.saturating_duration_since(Instant::now()))
                .err()
        });

        if let Some(decoder) = self.decoder.take() {
            decoder.close();
        }

        if let Some(capture) = pending {
            let grace = grace_deadline.saturating_duration_since(Instant::now());
            if let Err(capture) = capture.join_within(grace) {
                log::warn!(
                    "{}: capture thread did not exit after decoder close; detaching",
                    self.source.label
                );
                capture.detach();
            }
        }

        self.slot.clear();
        if self.state() != ConnectionState::Removed {
            self.shared.set_state(ConnectionState::Disconnected);
        }
    }

    /// Release and take the connection out of rotation for good.
    pub fn mark_removed(&mut self) {
        self.release();
        self.shared.set_state(ConnectionState::Removed);
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.release();
    }
}

/// Sleep for `duration` unless `cancel` is set first. Returns false when cancelled.
fn sleep_unless_cancelled(duration: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SyntheticFactory;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            retry_interval: Duration::from_millis(5),
        }
    }

    fn connection(factory: &Arc<SyntheticFactory>, uri: &str) -> StreamConnection {
        StreamConnection::new(
            StreamId(1),
            SourceDescriptor::new(uri, "cam-1"),
            factory.clone(),
        )
    }

    #[test]
    fn connect_seeds_slot_and_starts_capture() -> Result<(), StreamError> {
        let factory = Arc::new(SyntheticFactory::new());
        let mut conn = connection(&factory, "stub://cam?fps=100");

        conn.connect(&quick_policy(2))?;
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.first_success().is_some());
        assert!(conn.slot().read().is_some());
        assert!(conn.is_capturing());
        assert_eq!(conn.attempts_used(), 1);

        conn.release();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.slot().read().is_none());
        assert_eq!(factory.open_handles(), 0);
        Ok(())
    }

    #[test]
    fn connect_retries_open_failures_within_budget() -> Result<(), StreamError> {
        let factory = Arc::new(SyntheticFactory::new());
        let mut conn = connection(&factory, "stub://cam?fps=0&fail_opens=2");

        conn.connect(&quick_policy(3))?;
        assert_eq!(conn.attempts_used(), 3);
        assert_eq!(factory.open_attempts(), 3);
        conn.release();
        Ok(())
    }

    #[test]
    fn failed_first_read_closes_handle_before_retrying() -> Result<(), StreamError> {
        let factory = Arc::new(SyntheticFactory::new());
        let mut conn = connection(&factory, "stub://cam?fps=0&width=8&height=8&fail_first_reads=1");

        conn.connect(&quick_policy(2))?;
        assert_eq!(factory.opened(), 2);
        // First handle was closed during connect; second is still owned.
        assert_eq!(factory.open_handles(), 1);
        conn.release();
        assert_eq!(factory.close_calls(), 2);
        Ok(())
    }

    #[test]
    fn exhausted_attempts_leave_failed_state() {
        let factory = Arc::new(SyntheticFactory::new());
        let mut conn = connection(&factory, "stub://cam?fail_opens=all");

        let err = conn.connect(&quick_policy(2)).expect_err("never connects");
        assert!(err.is_connect());
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert_eq!(conn.last_error(), Some(err));
        assert!(conn.first_success().is_none());
        assert_eq!(factory.opened(), 0);
    }

    #[test]
    fn cancel_flag_cuts_the_retry_wait_short() {
        let factory = Arc::new(SyntheticFactory::new());
        let mut conn = connection(&factory, "stub://cam?fail_opens=all");
        let cancel = Arc::new(AtomicBool::new(false));
        let policy = RetryPolicy {
            max_attempts: 5,
            retry_interval: Duration::from_secs(1),
        };

        let setter = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                cancel.store(true, Ordering::SeqCst);
            })
        };
        let started = Instant::now();
        let err = conn
            .connect_until(&policy, &cancel)
            .expect_err("cancelled before success");
        setter.join().expect("setter thread");

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(err.is_connect());
        assert_eq!(conn.attempts_used(), 1);
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert_eq!(factory.open_attempts(), 1);
    }

    #[test]
    fn preset_cancel_flag_skips_every_attempt() {
        let factory = Arc::new(SyntheticFactory::new());
        let mut conn = connection(&factory, "stub://cam?fps=0");
        let cancel = AtomicBool::new(true);
        assert!(conn.connect_until(&quick_policy(3), &cancel).is_err());
        assert_eq!(factory.open_attempts(), 0);
        assert!(conn.first_success().is_none());
    }

    #[test]
    fn capture_failure_is_reported_once() -> Result<(), StreamError> {
        let factory = Arc::new(SyntheticFactory::new());
        let mut conn = connection(&factory, "stub://cam?fps=0&fail_after=5");

        conn.connect(&quick_policy(1))?;
        let deadline = Instant::now() + Duration::from_secs(2);
        while conn.state() != ConnectionState::Failed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(conn.last_error().is_some_and(|err| err.is_read()));
        // A second transition attempt from Failed is refused.
        assert!(!conn.shared.mark_failed(&StreamError::read("again")));
        // Seed frame is not counted; the capture loop produced the other four.
        assert_eq!(conn.frame_count(), 4);
        conn.release();
        Ok(())
    }

    #[test]
    fn release_is_idempotent() -> Result<(), StreamError> {
        let factory = Arc::new(SyntheticFactory::new());
        let mut conn = connection(&factory, "stub://cam?fps=50");
        conn.release();
        conn.connect(&quick_policy(1))?;
        conn.release();
        conn.release();
        assert_eq!(factory.opened(), 1);
        assert_eq!(factory.close_calls(), 1);
        Ok(())
    }

    #[test]
    fn reconnect_releases_previous_handle() -> Result<(), StreamError> {
        let factory = Arc::new(SyntheticFactory::new());
        let mut conn = connection(&factory, "stub://cam?fps=50");
        conn.connect(&quick_policy(1))?;
        conn.connect(&quick_policy(1))?;
        assert_eq!(factory.opened(), 2);
        assert_eq!(factory.open_handles(), 1);
        drop(conn);
        assert_eq!(factory.open_handles(), 0);
        Ok(())
    }

    #[test]
    fn release_detaches_a_stuck_thread_within_bound() -> Result<(), StreamError> {
        let factory = Arc::new(SyntheticFactory::new());
        let mut conn = connection(&factory, "stub://cam?fps=0&stall_after=1")
            .with_join_timeout(Duration::from_millis(20));
        conn.connect(&quick_policy(1))?;

        let started = Instant::now();
        conn.release();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(factory.close_calls(), 1);
        Ok(())
    }

    #[test]
    fn panicking_decoder_is_contained() -> Result<(), StreamError> {
        let factory = Arc::new(SyntheticFactory::new());
        let mut conn = connection(&factory, "stub://cam?fps=0&panic_after=2");
        conn.connect(&quick_policy(1))?;
        let deadline = Instant::now() + Duration::from_secs(2);
        while conn.state() != ConnectionState::Failed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(conn.last_error().is_some_and(|err| err.is_read()));
        conn.release();
        Ok(())
    }
}
