//! Error taxonomy for stream supervision.
//!
//! Connect and read failures are local to one source and are always retried
//! within the configured attempt budget. Configuration errors are the only
//! kind that should stop the process before any connection is attempted.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The decoder could not be opened for the source URI.
    #[error("connect to {uri} failed: {reason}")]
    Connect { uri: String, reason: String },

    /// The decoder was open but did not yield a frame (including end of stream).
    #[error("read failed: {reason}")]
    Read { reason: String },

    /// The source list is empty or malformed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StreamError {
    pub fn connect(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connect {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    pub fn read(reason: impl Into<String>) -> Self {
        Self::Read {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_source() {
        let err = StreamError::connect("rtsp://cam-1/101", "timed out");
        assert_eq!(err.to_string(), "connect to rtsp://cam-1/101 failed: timed out");
        assert!(err.is_connect());
        assert!(!err.is_read());
    }

    #[test]
    fn config_errors_survive_anyhow_round_trip() {
        let err: anyhow::Error = StreamError::config("no sources configured").into();
        let inner = err
            .downcast_ref::<StreamError>()
            .expect("StreamError inside anyhow");
        assert!(inner.is_config());
    }
}
