//! Frames and the bufferless latest-frame mailbox.
//!
//! - `Frame`: immutable decoded picture. Cloning shares the pixel allocation.
//! - `FrameSlot`: single-slot store holding only the most recent frame of one
//!   source, its capture instant and a publish sequence number.
//!
//! The slot is deliberately lossy. A producer never waits for the consumer;
//! a slow consumer simply misses intermediate frames and sees a gap in the
//! sequence. Do not put a queue behind it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A complete decoded frame.
///
/// Pixel bytes are immutable once constructed, so a reader holding a clone
/// can never observe a later capture being written into it.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            width,
            height,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

// ----------------------------------------------------------------------------
// FrameSlot
// ----------------------------------------------------------------------------

/// What a reader gets back from `FrameSlot::read`.
#[derive(Clone, Debug)]
pub struct SlotRead {
    pub frame: Frame,
    pub captured_at: Instant,
    pub sequence: u64,
}

#[derive(Default)]
struct SlotInner {
    latest: Option<(Frame, Instant)>,
    sequence: u64,
}

/// Single-slot mailbox shared by one capture loop (writer) and the poll loop (reader).
///
/// The lock only covers swapping the `(frame, timestamp, sequence)` triple in
/// or cloning it out, so neither side holds it while decoding or delivering.
#[derive(Default)]
pub struct FrameSlot {
    inner: Mutex<SlotInner>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current contents and return the new sequence number.
    ///
    /// Never blocks on the consumer and never queues.
    pub fn publish(&self, frame: Frame, captured_at: Instant) -> u64 {
        let (previous, sequence) = {
            let mut inner = self.lock();
            inner.sequence += 1;
            (inner.latest.replace((frame, captured_at)), inner.sequence)
        };
        // Replaced frame is freed outside the critical section.
        drop(previous);
        sequence
    }

    /// Latest frame, or `None` immediately if nothing has been published yet.
    pub fn read(&self) -> Option<SlotRead> {
        let inner = self.lock();
        inner
            .latest
            .as_ref()
            .map(|(frame, captured_at)| SlotRead {
                frame: frame.clone(),
                captured_at: *captured_at,
                sequence: inner.sequence,
            })
    }

    /// Drop the held frame. The sequence is kept so it never goes backwards.
    pub fn clear(&self) {
        let previous = self.lock().latest.take();
        drop(previous);
    }

    /// Number of successful publishes so far.
    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    pub fn is_empty(&self) -> bool {
        self.lock().latest.is_none()
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn patterned_frame(value: u8) -> Frame {
        Frame::new(vec![value; 64 * 48 * 3], 64, 48)
    }

    #[test]
    fn empty_slot_reads_none() {
        let slot = FrameSlot::new();
        assert!(slot.read().is_none());
        assert_eq!(slot.sequence(), 0);
        assert!(slot.is_empty());
    }

    #[test]
    fn publish_increments_sequence_by_one() {
        let slot = FrameSlot::new();
        for expected in 1..=5u64 {
            let seq = slot.publish(patterned_frame(expected as u8), Instant::now());
            assert_eq!(seq, expected);
        }
        let read = slot.read().expect("frame published");
        assert_eq!(read.sequence, 5);
        assert_eq!(read.frame.data()[0], 5);
    }

    #[test]
    fn fast_reader_sees_duplicates_with_unchanged_sequence() {
        let slot = FrameSlot::new();
        slot.publish(patterned_frame(7), Instant::now());

        let first = slot.read().expect("frame");
        let second = slot.read().expect("frame");
        assert_eq!(first.sequence, second.sequence);
        assert_eq!(first.captured_at, second.captured_at);
    }

    #[test]
    fn clear_keeps_sequence_monotonic() {
        let slot = FrameSlot::new();
        slot.publish(patterned_frame(1), Instant::now());
        slot.publish(patterned_frame(2), Instant::now());
        slot.clear();

        assert!(slot.read().is_none());
        assert_eq!(slot.sequence(), 2);
        assert_eq!(slot.publish(patterned_frame(3), Instant::now()), 3);
    }

    #[test]
    fn concurrent_reads_never_see_mixed_frames() {
        let slot = Arc::new(FrameSlot::new());
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let slot = slot.clone();
            let done = done.clone();
            thread::spawn(move || {
                for i in 0..2_000u32 {
                    slot.publish(patterned_frame((i % 251) as u8), Instant::now());
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let mut last_sequence = 0;
        let mut reads = 0u64;
        while !done.load(Ordering::SeqCst) || reads == 0 {
            if let Some(read) = slot.read() {
                let first = read.frame.data()[0];
                assert!(
                    read.frame.data().iter().all(|&b| b == first),
                    "frame bytes mix two captures"
                );
                assert!(read.sequence >= last_sequence, "sequence went backwards");
                last_sequence = read.sequence;
                reads += 1;
            }
        }
        writer.join().expect("writer thread");
        assert_eq!(slot.sequence(), 2_000);
    }

    #[test]
    fn slow_consumer_misses_frames_without_blocking_producer() {
        let slot = Arc::new(FrameSlot::new());

        let producer = {
            let slot = slot.clone();
            thread::spawn(move || {
                let mut slowest = Duration::ZERO;
                for i in 0..45u32 {
                    let started = Instant::now();
                    slot.publish(patterned_frame(i as u8), Instant::now());
                    slowest = slowest.max(started.elapsed());
                    thread::sleep(Duration::from_millis(33));
                }
                slowest
            })
        };

        while slot.read().is_none() {
            thread::yield_now();
        }

        let mut seen = Vec::new();
        for _ in 0..10 {
            if let Some(read) = slot.read() {
                seen.push(read.sequence);
            }
            thread::sleep(Duration::from_millis(100));
        }
        let slowest_publish = producer.join().expect("producer thread");

        let distinct: BTreeSet<u64> = seen.iter().copied().collect();
        assert!(distinct.len() <= 10);
        assert!(
            seen.windows(2).any(|pair| pair[1] > pair[0] + 1),
            "expected at least one skipped sequence, saw {:?}",
            seen
        );
        assert!(seen.windows(2).all(|pair| pair[1] >= pair[0]));
        assert!(slowest_publish < Duration::from_millis(50));
    }
}
