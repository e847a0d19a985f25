//! Proxy configuration.
//!
//! Options come from the command line with environment variable fallbacks.
//! The resulting [`ProxyConfig`] is read-only for the lifetime of the process.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hl7_mllp::{EncoderFailurePolicy, DEFAULT_MAX_FRAME_LEN};

use crate::error::ProxyError;
use crate::logging::LogFormat;

/// Default grace period between one direction ending and session teardown.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Default connect timeout for the backend.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Command line of the `hl7proxy` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "hl7proxy", version, about = "HL7 connection proxy")]
pub struct Args {
    /// Proxy listen address (:5000 or host:port).
    #[arg(short = 's', long = "source", env = "HL7_PROXY_SOURCE")]
    pub source: String,

    /// Backend address (forumserver:7000).
    #[arg(short = 'd', long = "dest", env = "HL7_PROXY_DEST")]
    pub dest: String,

    /// Encoder command for incoming HL7 messages (client to backend).
    /// Quote paths that contain spaces.
    #[arg(long = "senc", env = "HL7_PROXY_SOURCE_ENCODER")]
    pub source_encoder: Option<String>,

    /// Encoder command for outgoing HL7 messages (backend to client).
    /// Quote paths that contain spaces.
    #[arg(long = "denc", env = "HL7_PROXY_DEST_ENCODER")]
    pub dest_encoder: Option<String>,

    /// File receiving a copy of all HL7 data sent by the client.
    #[arg(short = 'f', long = "file", env = "HL7_PROXY_FILE")]
    pub file: Option<PathBuf>,

    /// Trim data to valid HL7 message blocks in MLLP.
    #[arg(
        long = "hl7",
        env = "HL7_PROXY_HL7",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub hl7: bool,

    /// What to do with a message the encoder cannot convert (close-session, forward, drop).
    #[arg(
        long = "encoder-failure",
        env = "HL7_PROXY_ENCODER_FAILURE",
        default_value_t = EncoderFailurePolicy::CloseSession
    )]
    pub encoder_failure: EncoderFailurePolicy,

    /// Milliseconds to keep relaying after one direction has ended.
    #[arg(long = "grace-ms", env = "HL7_PROXY_GRACE_MS", default_value_t = 1000)]
    pub grace_ms: u64,

    /// Milliseconds to wait for the backend to accept a connection.
    #[arg(
        long = "connect-timeout-ms",
        env = "HL7_PROXY_CONNECT_TIMEOUT_MS",
        default_value_t = 2000
    )]
    pub connect_timeout_ms: u64,

    /// Largest accepted MLLP frame in bytes.
    #[arg(
        long = "max-frame-bytes",
        env = "HL7_PROXY_MAX_FRAME_BYTES",
        default_value_t = DEFAULT_MAX_FRAME_LEN
    )]
    pub max_frame_bytes: usize,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long = "log-level", env = "HL7_PROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(
        long = "log-format",
        env = "HL7_PROXY_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Json
    )]
    pub log_format: LogFormat,
}

impl Args {
    /// Validate the command line and build the proxy configuration.
    pub fn into_config(self) -> Result<ProxyConfig, ProxyError> {
        let listen_addr = normalize_addr(&self.source, "source")?;
        let backend_addr = normalize_addr(&self.dest, "dest")?;

        if self.max_frame_bytes < 4 {
            return Err(ProxyError::Config(format!(
                "max frame size {} is too small to hold a frame",
                self.max_frame_bytes
            )));
        }

        Ok(ProxyConfig {
            listen_addr,
            backend_addr,
            framing: self.hl7,
            source_encoder: non_empty(self.source_encoder),
            destination_encoder: non_empty(self.dest_encoder),
            encoder_failure: self.encoder_failure,
            log_file: self.file.filter(|p| !p.as_os_str().is_empty()),
            grace_period: Duration::from_millis(self.grace_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms.max(1)),
            max_frame_len: self.max_frame_bytes,
        })
    }
}

/// Process-wide proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the proxy listens on.
    pub listen_addr: String,

    /// Address of the backend dialed for each session.
    pub backend_addr: String,

    /// Filter both directions down to well-formed MLLP frames.
    pub framing: bool,

    /// Encoder command for client to backend payloads.
    pub source_encoder: Option<String>,

    /// Encoder command for backend to client payloads.
    pub destination_encoder: Option<String>,

    /// Policy for payloads an encoder fails to convert.
    pub encoder_failure: EncoderFailurePolicy,

    /// Capture file for the client to backend stream.
    pub log_file: Option<PathBuf>,

    /// Delay between one direction ending and session teardown.
    pub grace_period: Duration,

    /// Connect timeout for the backend.
    pub connect_timeout: Duration,

    /// Largest accepted MLLP frame.
    pub max_frame_len: usize,
}

impl ProxyConfig {
    /// Configuration with defaults for everything but the two addresses.
    pub fn new(listen_addr: impl Into<String>, backend_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            backend_addr: backend_addr.into(),
            framing: true,
            source_encoder: None,
            destination_encoder: None,
            encoder_failure: EncoderFailurePolicy::default(),
            log_file: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Accept `:port` shorthand for all interfaces.
fn normalize_addr(addr: &str, name: &str) -> Result<String, ProxyError> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(ProxyError::Config(format!("{} address is empty", name)));
    }

    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };

    match normalized.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => Ok(normalized),
        _ => Err(ProxyError::Config(format!(
            "{} address '{}' must be host:port",
            name, addr
        ))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("hl7proxy").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["-s", ":5000", "-d", "forumserver:7000"])
            .into_config()
            .unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:5000");
        assert_eq!(config.backend_addr, "forumserver:7000");
        assert!(config.framing);
        assert!(config.source_encoder.is_none());
        assert!(config.destination_encoder.is_none());
        assert!(config.log_file.is_none());
        assert_eq!(config.encoder_failure, EncoderFailurePolicy::CloseSession);
        assert_eq!(config.grace_period, DEFAULT_GRACE_PERIOD);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn test_all_options() {
        let config = parse(&[
            "--source",
            "127.0.0.1:5000",
            "--dest",
            "[::1]:7000",
            "--senc",
            "latin1-to-utf8",
            "--denc",
            "utf8-to-latin1",
            "-f",
            "/var/log/hl7.dat",
            "--hl7",
            "false",
            "--encoder-failure",
            "forward",
            "--grace-ms",
            "250",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.backend_addr, "[::1]:7000");
        assert!(!config.framing);
        assert_eq!(config.source_encoder.as_deref(), Some("latin1-to-utf8"));
        assert_eq!(config.destination_encoder.as_deref(), Some("utf8-to-latin1"));
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/hl7.dat")));
        assert_eq!(config.encoder_failure, EncoderFailurePolicy::Forward);
        assert_eq!(config.grace_period, Duration::from_millis(250));
    }

    #[test]
    fn test_blank_encoder_means_none() {
        let config = parse(&["-s", ":5000", "-d", "forum:7000", "--senc", "  "])
            .into_config()
            .unwrap();
        assert!(config.source_encoder.is_none());
    }

    #[rstest]
    #[case(":5000", "0.0.0.0:5000")]
    #[case(" :6661 ", "0.0.0.0:6661")]
    #[case("127.0.0.1:5000", "127.0.0.1:5000")]
    #[case("forumserver:7000", "forumserver:7000")]
    #[case("[::1]:7000", "[::1]:7000")]
    fn test_normalize_addr(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_addr(input, "listen").unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("forumserver")]
    #[case("forumserver:")]
    #[case(":99999")]
    #[case("host:port")]
    fn test_normalize_addr_rejects(#[case] input: &str) {
        let err = normalize_addr(input, "backend").unwrap_err();
        assert_eq!(err.reason_code(), "config_invalid");
    }

    #[test]
    fn test_rejects_address_without_port() {
        let err = parse(&["-s", "localhost", "-d", "forum:7000"])
            .into_config()
            .unwrap_err();
        assert_eq!(err.reason_code(), "config_invalid");
    }

    #[test]
    fn test_rejects_unknown_failure_policy() {
        let result = Args::try_parse_from([
            "hl7proxy",
            "-s",
            ":5000",
            "-d",
            "forum:7000",
            "--encoder-failure",
            "abort",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_required_addresses() {
        assert!(Args::try_parse_from(["hl7proxy", "-s", ":5000"]).is_err());
    }
}
