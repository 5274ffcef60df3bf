//! Background capture loop, one per connected source.
//!
//! The loop pulls frames from its decoder and publishes them into the source's
//! `FrameSlot`. It never retries on its own: the first read error moves the
//! connection to `Failed` and the loop exits, leaving the retry decision to the
//! supervisor.
//!
//! Everything the loop touches arrives through `CaptureContext`; there is no
//! state shared with other sources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::connection::ConnectionShared;
use crate::decoder::{guarded_read, Decoder};
use crate::frame::FrameSlot;
use crate::metrics::StreamCounters;

const JOIN_POLL: Duration = Duration::from_millis(5);

/// Per-connection state handed to the capture thread.
pub struct CaptureContext {
    pub label: String,
    pub decoder: Arc<dyn Decoder>,
    pub slot: Arc<FrameSlot>,
    pub counters: Arc<StreamCounters>,
    pub shared: Arc<ConnectionShared>,
}

pub struct CaptureLoop;

impl CaptureLoop {
    /// Start the loop on a dedicated thread named after the source.
    pub fn spawn(ctx: CaptureContext) -> std::io::Result<CaptureHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let join = thread::Builder::new()
            .name(format!("capture-{}", ctx.label))
            .spawn(move || run(ctx, &stop_thread))?;
        Ok(CaptureHandle { stop, join })
    }
}

fn run(ctx: CaptureContext, stop: &AtomicBool) {
    log::debug!("{}: capture loop started", ctx.label);
    while !stop.load(Ordering::SeqCst) {
        match guarded_read(ctx.decoder.as_ref()) {
            Ok(frame) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let sequence = ctx.slot.publish(frame, Instant::now());
                ctx.counters.record_frame();
                log::trace!("{}: published frame seq={}", ctx.label, sequence);
            }
            Err(err) => {
                if stop.load(Ordering::SeqCst) {
                    // Read was interrupted by release(); not a stream failure.
                    break;
                }
                if ctx.shared.mark_failed(&err) {
                    log::warn!("{}: capture failed: {}", ctx.label, err);
                }
                break;
            }
        }
    }
    log::debug!(
        "{}: capture loop exited after {} frames",
        ctx.label,
        ctx.counters.frames()
    );
}

/// Owner's side of a running capture loop.
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl CaptureHandle {
    /// Ask the loop to exit after its current read.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Join if the thread exits within `timeout`; hand the handle back otherwise.
    pub fn join_within(self, timeout: Duration) -> Result<(), Self> {
        let deadline = Instant::now() + timeout;
        while !self.join.is_finished() {
            let now = Instant::now();
            if now >= deadline {
                return Err(self);
            }
            thread::sleep((deadline - now).min(JOIN_POLL));
        }
        if self.join.join().is_err() {
            log::error!("capture thread panicked");
        }
        Ok(())
    }

    /// Give up on the thread. It exits on its own once its read returns.
    pub fn detach(self) {
        drop(self.join);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::decoder::{DecoderFactory, SyntheticFactory};

    fn context(factory: &SyntheticFactory, uri: &str) -> (CaptureContext, Arc<ConnectionShared>) {
        let shared = Arc::new(ConnectionShared::new());
        shared.set_state(ConnectionState::Connected);
        let ctx = CaptureContext {
            label: "test".to_string(),
            decoder: factory.open(uri).expect("open synthetic"),
            slot: Arc::new(FrameSlot::new()),
            counters: Arc::new(StreamCounters::default()),
            shared: shared.clone(),
        };
        (ctx, shared)
    }

    #[test]
    fn publishes_until_stopped() {
        let factory = SyntheticFactory::new();
        let (ctx, shared) = context(&factory, "stub://cam?fps=200");
        let slot = ctx.slot.clone();
        let counters = ctx.counters.clone();
        let decoder = ctx.decoder.clone();

        let handle = CaptureLoop::spawn(ctx).expect("spawn");
        thread::sleep(Duration::from_millis(60));
        handle.signal_stop();
        assert!(handle.join_within(Duration::from_secs(1)).is_ok());
        decoder.close();

        assert!(counters.frames() > 0);
        assert_eq!(slot.sequence(), counters.frames());
        assert_eq!(shared.state(), ConnectionState::Connected);
    }

    #[test]
    fn read_error_marks_failed_and_exits() {
        let factory = SyntheticFactory::new();
        let (ctx, shared) = context(&factory, "stub://cam?fps=0&fail_after=3");
        let counters = ctx.counters.clone();
        let decoder = ctx.decoder.clone();

        let handle = CaptureLoop::spawn(ctx).expect("spawn");
        assert!(handle.join_within(Duration::from_secs(1)).is_ok());
        decoder.close();

        assert_eq!(counters.frames(), 3);
        assert_eq!(shared.state(), ConnectionState::Failed);
        assert!(shared.last_error().is_some());
    }

    #[test]
    fn stalled_loop_times_out_then_exits_when_decoder_closes() {
        let factory = SyntheticFactory::new();
        let (ctx, shared) = context(&factory, "stub://cam?fps=0&stall_after=1");
        let decoder = ctx.decoder.clone();
        let slot = ctx.slot.clone();

        let handle = CaptureLoop::spawn(ctx).expect("spawn");
        while slot.sequence() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        handle.signal_stop();
        let handle = handle
            .join_within(Duration::from_millis(30))
            .expect_err("stalled read keeps the thread alive");

        decoder.close();
        assert!(handle.join_within(Duration::from_secs(1)).is_ok());
        // Interrupted by stop, not a stream failure.
        assert_eq!(shared.state(), ConnectionState::Connected);
    }
}
