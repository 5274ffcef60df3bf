//! GStreamer decoder for network sources.
//!
//! `rtsp://` and `rtsps://` go through `rtspsrc`; other schemes go through
//! `uridecodebin`. The appsink keeps a single buffer and drops older ones,
//! so the transport side is latest-frame as well.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use gstreamer::prelude::*;

use super::Decoder;
use crate::error::StreamError;
use crate::frame::Frame;

/// How long a read waits for a sample before the stream counts as stalled.
const PULL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GstreamerDecoder {
    uri: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    closed: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl GstreamerDecoder {
    pub fn open(uri: &str) -> Result<Self, StreamError> {
        gstreamer::init().map_err(|e| StreamError::connect(uri, format!("initialize gstreamer: {}", e)))?;

        let pipeline_description = pipeline_description(uri);
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .map_err(|e| StreamError::connect(uri, format!("build pipeline: {}", e)))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| StreamError::connect(uri, "pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| StreamError::connect(uri, "appsink element missing from pipeline"))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| StreamError::connect(uri, "appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        if let Err(err) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(StreamError::connect(uri, format!("set pipeline to Playing: {}", err)));
        }
        log::info!("GstreamerDecoder: opened {}", uri);

        Ok(Self {
            uri: uri.to_string(),
            pipeline,
            appsink,
            closed: AtomicBool::new(false),
            last_error: Mutex::new(None),
        })
    }

    fn poll_bus(&self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            let error = match message.view() {
                MessageView::Error(err) => Some(format!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                )),
                MessageView::Eos(..) => Some("gstreamer reached EOS".to_string()),
                _ => None,
            };
            if let Some(error) = error {
                *self
                    .last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(error);
            }
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Decoder for GstreamerDecoder {
    fn read(&self) -> Result<Frame, StreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::read(format!("{} closed", self.uri)));
        }
        self.poll_bus();
        if let Some(err) = self.last_error() {
            return Err(StreamError::read(err));
        }

        let timeout = gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.closed.load(Ordering::SeqCst) {
                return Err(StreamError::read(format!("{} closed", self.uri)));
            }
            if self.appsink.is_eos() {
                return Err(StreamError::read(format!("{} reached end of stream", self.uri)));
            }
            return Err(StreamError::read(format!(
                "{} stalled: no frame within {:?}",
                self.uri, PULL_TIMEOUT
            )));
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Ok(Frame::new(pixels, width, height))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerDecoder: failed to stop {}: {}", self.uri, err);
        }
        log::info!("GstreamerDecoder: closed {}", self.uri);
    }
}

impl Drop for GstreamerDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

fn pipeline_description(uri: &str) -> String {
    let sink = "videoconvert ! video/x-raw,format=RGB ! \
                appsink name=appsink sync=false max-buffers=1 drop=true";
    if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
        format!("rtspsrc location={} latency=0 ! decodebin ! {}", launch_quote(uri), sink)
    } else {
        format!("uridecodebin uri={} ! {}", launch_quote(uri), sink)
    }
}

/// Quote a property value for `gst::parse::launch` so spaces, `!` and `=`
/// inside it stay part of the value.
fn launch_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32), StreamError> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| StreamError::read("sample missing buffer"))?;
    let caps = sample
        .caps()
        .ok_or_else(|| StreamError::read("sample missing caps"))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .map_err(|e| StreamError::read(format!("parse caps as video info: {}", e)))?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer
        .map_readable()
        .map_err(|e| StreamError::read(format!("map buffer: {}", e)))?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| StreamError::read("buffer row is out of bounds"))?,
        );
    }

    Ok((pixels, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtsp_uses_rtspsrc_and_a_single_buffer_sink() {
        let description = pipeline_description("rtsp://10.0.0.2:554/Streaming/Channels/101");
        assert!(description.starts_with("rtspsrc location=\"rtsp://10.0.0.2:554"));
        assert!(description.contains("max-buffers=1 drop=true"));
    }

    #[test]
    fn other_schemes_use_uridecodebin() {
        let description = pipeline_description("http://10.0.0.2/live.mjpg");
        assert!(description.starts_with("uridecodebin uri=\"http://10.0.0.2/live.mjpg\" ! "));
    }

    #[test]
    fn uri_with_pipeline_syntax_stays_one_value() {
        let uri = "rtsp://cam/live name=x ! fakesink \"q\"";
        let description = pipeline_description(uri);
        assert!(description.starts_with(
            "rtspsrc location=\"rtsp://cam/live name=x ! fakesink \\\"q\\\"\" latency=0 ! "
        ));
        assert_eq!(launch_quote(r"a\b"), r#""a\\b""#);
    }
}
