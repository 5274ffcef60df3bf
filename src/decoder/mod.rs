//! Decoder collaborators.
//!
//! The supervisor never decodes video itself. It talks to a `DecoderFactory`
//! that opens a `Decoder` per source URI:
//! - `stub://` URIs: synthetic frames with scriptable failures (tests, demos)
//! - everything else: GStreamer RTSP decoding (feature: rtsp-gstreamer)
//!
//! A decoder handle is shared between the capture thread that reads from it
//! and the connection that owns it, so `close` can be called while a `read`
//! is blocked and must make that read return.
//!
//! Decoders are third-party territory. Panics escaping `open` or `read` are
//! caught here and turned into `StreamError` so one misbehaving source cannot
//! take the supervisor down.

#[cfg(feature = "rtsp-gstreamer")]
pub mod gstreamer;
pub mod synthetic;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::StreamError;
use crate::frame::Frame;

pub use synthetic::{SyntheticDecoder, SyntheticFactory};

/// An open decoder for one source.
pub trait Decoder: Send + Sync {
    /// Block until the next complete frame is available.
    ///
    /// End of stream and transient transport errors both surface as
    /// `StreamError::Read`.
    fn read(&self) -> Result<Frame, StreamError>;

    /// Release the underlying transport. Unblocks a pending `read`.
    fn close(&self);
}

/// Opens decoders for source URIs.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, uri: &str) -> Result<Arc<dyn Decoder>, StreamError>;
}

/// Routes URIs to the synthetic or GStreamer backend by scheme.
#[derive(Default)]
pub struct DefaultDecoderFactory {
    synthetic: SyntheticFactory,
}

impl DefaultDecoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synthetic backend, exposed for open/close accounting.
    pub fn synthetic(&self) -> &SyntheticFactory {
        &self.synthetic
    }
}

impl DecoderFactory for DefaultDecoderFactory {
    fn open(&self, uri: &str) -> Result<Arc<dyn Decoder>, StreamError> {
        if uri.starts_with(synthetic::SCHEME_PREFIX) {
            return self.synthetic.open(uri);
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            let decoder = gstreamer::GstreamerDecoder::open(uri)?;
            Ok(Arc::new(decoder))
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(StreamError::connect(
                uri,
                "network sources require the rtsp-gstreamer feature",
            ))
        }
    }
}

/// Open a decoder, normalising a panic into `StreamError::Connect`.
pub(crate) fn guarded_open(
    factory: &dyn DecoderFactory,
    uri: &str,
) -> Result<Arc<dyn Decoder>, StreamError> {
    panic::catch_unwind(AssertUnwindSafe(|| factory.open(uri))).unwrap_or_else(|payload| {
        Err(StreamError::connect(
            uri,
            format!("decoder panicked during open: {}", panic_message(&payload)),
        ))
    })
}

/// Read one frame, normalising a panic into `StreamError::Read`.
pub(crate) fn guarded_read(decoder: &dyn Decoder) -> Result<Frame, StreamError> {
    panic::catch_unwind(AssertUnwindSafe(|| decoder.read())).unwrap_or_else(|payload| {
        Err(StreamError::read(format!(
            "decoder panicked during read: {}",
            panic_message(&payload)
        )))
    })
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingFactory;

    impl DecoderFactory for PanickingFactory {
        fn open(&self, _uri: &str) -> Result<Arc<dyn Decoder>, StreamError> {
            panic!("transport exploded");
        }
    }

    #[test]
    fn default_factory_routes_stub_uris_to_synthetic() -> Result<(), StreamError> {
        let factory = DefaultDecoderFactory::new();
        let decoder = factory.open("stub://lobby?fps=0")?;
        let frame = decoder.read()?;
        assert_eq!((frame.width, frame.height), (320, 240));
        decoder.close();
        assert_eq!(factory.synthetic().opened(), 1);
        assert_eq!(factory.synthetic().close_calls(), 1);
        Ok(())
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn network_uris_need_the_gstreamer_feature() {
        let factory = DefaultDecoderFactory::new();
        let err = factory
            .open("rtsp://192.168.200.132:554/Streaming/Channels/101")
            .err()
            .expect("rtsp without backend must fail");
        assert!(err.is_connect());
        assert!(err.to_string().contains("rtsp-gstreamer"));
    }

    #[test]
    fn panics_in_open_become_connect_errors() {
        let err = guarded_open(&PanickingFactory, "stub://boom")
            .err()
            .expect("panic normalised");
        assert!(err.is_connect());
        assert!(err.to_string().contains("transport exploded"));
    }

    #[test]
    fn panics_in_read_become_read_errors() -> Result<(), StreamError> {
        let factory = SyntheticFactory::new();
        let decoder = factory.open("stub://flaky?fps=0&panic_after=1")?;
        assert!(guarded_read(decoder.as_ref()).is_ok());
        let err = guarded_read(decoder.as_ref())
            .err()
            .expect("second read panics");
        assert!(err.is_read());
        decoder.close();
        Ok(())
    }
}
