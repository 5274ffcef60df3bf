//! Synthetic decoder for `stub://` sources.
//!
//! Produces frames at a fixed rate without touching the network. The query
//! string scripts transport behaviour so retry, failure and shutdown paths can
//! be exercised deterministically:
//!
//! | parameter          | effect                                              |
//! |--------------------|-----------------------------------------------------|
//! | `fps`              | pacing between frames (default 30, 0 = unpaced)     |
//! | `width`, `height`  | frame size (default 320x240)                        |
//! | `jitter_ms`        | random extra delay per read, up to this many ms     |
//! | `fail_opens`       | first k opens of this URI fail (`all` = every open) |
//! | `fail_first_reads` | first read of the first k opened handles fails      |
//! | `open_limit`       | opens fail once n handles have been opened          |
//! | `fail_after`       | reads fail once a handle has produced n frames      |
//! | `stall_after`      | reads block until closed after n frames             |
//! | `panic_after`      | reads panic after n frames                          |
//!
//! Every byte of a frame carries the same value (frame number modulo 256), so
//! a torn frame is trivially detectable.
//!
//! The factory counts open attempts, successful opens and close calls. A run
//! that released everything exactly once ends with `opened() == close_calls()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use url::Url;

use super::{Decoder, DecoderFactory};
use crate::error::StreamError;
use crate::frame::Frame;

pub(crate) const SCHEME_PREFIX: &str = "stub://";

const DEFAULT_FPS: u32 = 30;
const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const CLOSE_POLL: Duration = Duration::from_millis(2);

#[derive(Clone, Debug, PartialEq, Eq)]
struct Script {
    fps: u32,
    width: u32,
    height: u32,
    jitter_ms: u64,
    fail_opens: u32,
    fail_first_reads: u32,
    open_limit: Option<u32>,
    fail_after: Option<u64>,
    stall_after: Option<u64>,
    panic_after: Option<u64>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            jitter_ms: 0,
            fail_opens: 0,
            fail_first_reads: 0,
            open_limit: None,
            fail_after: None,
            stall_after: None,
            panic_after: None,
        }
    }
}

impl Script {
    fn parse(uri: &str) -> Result<Self, StreamError> {
        let url = Url::parse(uri).map_err(|e| StreamError::connect(uri, e.to_string()))?;
        if url.scheme() != "stub" {
            return Err(StreamError::connect(uri, "synthetic decoder requires stub://"));
        }
        let mut script = Script::default();
        for (key, value) in url.query_pairs() {
            let parse = |value: &str| -> Result<u64, StreamError> {
                value.parse::<u64>().map_err(|_| {
                    StreamError::connect(uri, format!("'{}' must be an integer, got '{}'", key, value))
                })
            };
            let parse_u32 = |value: &str| -> Result<u32, StreamError> {
                u32::try_from(parse(value)?).map_err(|_| {
                    StreamError::connect(
                        uri,
                        format!("'{}' is out of range (max {}), got '{}'", key, u32::MAX, value),
                    )
                })
            };
            match key.as_ref() {
                "fps" => script.fps = parse_u32(value.as_ref())?,
                "width" => script.width = parse_u32(value.as_ref())?,
                "height" => script.height = parse_u32(value.as_ref())?,
                "jitter_ms" => script.jitter_ms = parse(value.as_ref())?,
                "fail_opens" if value == "all" => script.fail_opens = u32::MAX,
                "fail_opens" => script.fail_opens = parse_u32(value.as_ref())?,
                "fail_first_reads" => script.fail_first_reads = parse_u32(value.as_ref())?,
                "open_limit" => script.open_limit = Some(parse_u32(value.as_ref())?),
                "fail_after" => script.fail_after = Some(parse(value.as_ref())?),
                "stall_after" => script.stall_after = Some(parse(value.as_ref())?),
                "panic_after" => script.panic_after = Some(parse(value.as_ref())?),
                other => {
                    return Err(StreamError::connect(
                        uri,
                        format!("unknown stub parameter '{}'", other),
                    ))
                }
            }
        }
        Ok(script)
    }

    fn frame_interval(&self) -> Duration {
        if self.fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / self.fps as f64)
        }
    }
}

#[derive(Default)]
struct Counters {
    open_attempts: AtomicUsize,
    opened: AtomicUsize,
    close_calls: AtomicUsize,
    closed_handles: AtomicUsize,
    attempts_by_uri: Mutex<HashMap<String, u32>>,
}

/// Opens `SyntheticDecoder`s and keeps open/close accounting.
#[derive(Default)]
pub struct SyntheticFactory {
    counters: Arc<Counters>,
}

impl SyntheticFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call to `open`, successful or not.
    pub fn open_attempts(&self) -> usize {
        self.counters.open_attempts.load(Ordering::SeqCst)
    }

    /// Opens that returned a handle.
    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Every call to `close`, including repeated calls on the same handle.
    pub fn close_calls(&self) -> usize {
        self.counters.close_calls.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.opened()
            .saturating_sub(self.counters.closed_handles.load(Ordering::SeqCst))
    }
}

impl DecoderFactory for SyntheticFactory {
    fn open(&self, uri: &str) -> Result<Arc<dyn Decoder>, StreamError> {
        let script = Script::parse(uri)?;
        self.counters.open_attempts.fetch_add(1, Ordering::SeqCst);

        let attempt = {
            let mut attempts = self
                .counters
                .attempts_by_uri
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let entry = attempts.entry(uri.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };

        if attempt <= script.fail_opens {
            return Err(StreamError::connect(
                uri,
                format!("synthetic open failure (attempt {})", attempt),
            ));
        }

        let handle_index = attempt - script.fail_opens;
        if script.open_limit.is_some_and(|limit| handle_index > limit) {
            return Err(StreamError::connect(
                uri,
                format!("synthetic open limit reached (attempt {})", attempt),
            ));
        }
        let fail_first_read = handle_index <= script.fail_first_reads;
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        log::debug!("SyntheticDecoder: opened {} (handle {})", uri, handle_index);

        Ok(Arc::new(SyntheticDecoder {
            uri: uri.to_string(),
            script,
            frame_count: AtomicU64::new(0),
            fail_first_read: AtomicBool::new(fail_first_read),
            closed: AtomicBool::new(false),
            counters: self.counters.clone(),
        }))
    }
}

/// Decoder handle produced by `SyntheticFactory`.
pub struct SyntheticDecoder {
    uri: String,
    script: Script,
    frame_count: AtomicU64,
    fail_first_read: AtomicBool,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl SyntheticDecoder {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn frames_produced(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, returning early with `false` if the handle is closed.
    fn pace(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_closed() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(CLOSE_POLL));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> StreamError {
        StreamError::read(format!("{} closed", self.uri))
    }
}

impl Decoder for SyntheticDecoder {
    fn read(&self) -> Result<Frame, StreamError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if self.fail_first_read.swap(false, Ordering::SeqCst) {
            return Err(StreamError::read(format!("{} opened but produced no frame", self.uri)));
        }

        let produced = self.frame_count.load(Ordering::SeqCst);
        if let Some(limit) = self.script.fail_after {
            if produced >= limit {
                return Err(StreamError::read(format!(
                    "{} ended after {} frames",
                    self.uri, produced
                )));
            }
        }
        if let Some(limit) = self.script.panic_after {
            if produced >= limit {
                panic!("synthetic decoder for {} panicked after {} frames", self.uri, produced);
            }
        }
        if let Some(limit) = self.script.stall_after {
            if produced >= limit {
                while self.pace(Duration::from_secs(1)) {}
                return Err(self.closed_error());
            }
        }

        let mut delay = self.script.frame_interval();
        if self.script.jitter_ms > 0 {
            let jitter = rand::thread_rng().gen_range(0..=self.script.jitter_ms);
            delay += Duration::from_millis(jitter);
        }
        if !self.pace(delay) {
            return Err(self.closed_error());
        }

        let number = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
        let len = (self.script.width as usize) * (self.script.height as usize) * 3;
        Ok(Frame::new(
            vec![(number % 256) as u8; len],
            self.script.width,
            self.script.height,
        ))
    }

    fn close(&self) {
        self.counters.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.closed_handles.fetch_add(1, Ordering::SeqCst);
            log::debug!(
                "SyntheticDecoder: closed {} after {} frames",
                self.uri,
                self.frames_produced()
            );
        }
    }
}
