//! Error types for the proxy service.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use hl7_mllp::EncodeError;
use thiserror::Error;

/// Proxy errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration rejected at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The listening socket could not be opened.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The backend refused or reset the connection attempt.
    #[error("failed to connect to backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The backend did not answer within the connect timeout.
    #[error("backend {addr} did not accept within {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    /// The capture file could not be opened or reset.
    #[error("capture file {}: {source}", path.display())]
    CaptureFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An encoder command could not be set up.
    #[error("encoder error: {0}")]
    Encoder(#[from] EncodeError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "config_invalid",
            ProxyError::Bind { .. } => "listen_failed",
            ProxyError::Dial { .. } => "backend_dial_failed",
            ProxyError::DialTimeout { .. } => "backend_dial_timeout",
            ProxyError::CaptureFile { .. } => "capture_file_failed",
            ProxyError::Encoder(_) => "encoder_failed",
            ProxyError::Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let err = ProxyError::DialTimeout {
            addr: "forum:7000".to_string(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.reason_code(), "backend_dial_timeout");
        assert_eq!(err.to_string(), "backend forum:7000 did not accept within 2s");

        let err = ProxyError::from(EncodeError::EmptyCommand);
        assert_eq!(err.reason_code(), "encoder_failed");
    }
}
