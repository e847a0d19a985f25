//! One proxied client session.
//!
//! A session owns the accepted client connection and the backend connection
//! dialed for it. Each direction is copied by its own task:
//!
//! ```text
//! client -> [FrameFilter] -> [capture file] -> backend
//! backend -> [FrameFilter] -> client
//! ```
//!
//! When either direction ends the session waits out a grace period, so bytes
//! already in flight in the other direction (typically the backend's final
//! response) still reach their peer, and then tears both directions down.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hl7_mllp::{
    Accumulator, Encoder, EncoderFailurePolicy, FilterStats, FrameFilter, DEFAULT_MAX_FRAME_LEN,
};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use super::teardown::{raised, Direction, TeardownSignal};
use crate::config::DEFAULT_GRACE_PERIOD;

/// Buffer size of a copy task.
const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Per-session settings derived from the proxy configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Filter both directions down to well-formed MLLP frames.
    pub framing: bool,
    /// Encoder for client to backend payloads.
    pub source_encoder: Option<Arc<dyn Encoder>>,
    /// Encoder for backend to client payloads.
    pub destination_encoder: Option<Arc<dyn Encoder>>,
    /// Policy for payloads an encoder fails to convert.
    pub encoder_failure: EncoderFailurePolicy,
    /// Largest accepted MLLP frame.
    pub max_frame_len: usize,
    /// Capture file for the client to backend stream.
    pub log_file: Option<PathBuf>,
    /// Delay between one direction ending and teardown.
    pub grace_period: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            framing: true,
            source_encoder: None,
            destination_encoder: None,
            encoder_failure: EncoderFailurePolicy::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            log_file: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl SessionConfig {
    fn reader<R: AsyncRead + Unpin>(&self, source: R, direction: Direction) -> SessionReader<R> {
        if !self.framing {
            return SessionReader::Raw(source);
        }

        let accumulator = Accumulator::with_max_frame_len(self.max_frame_len);
        let filter = FrameFilter::with_accumulator(source, accumulator);

        let encoder = match direction {
            Direction::Upstream => self.source_encoder.clone(),
            Direction::Downstream => self.destination_encoder.clone(),
        };

        match encoder {
            Some(encoder) => {
                SessionReader::Framed(filter.with_encoder(encoder, self.encoder_failure))
            }
            None => SessionReader::Framed(filter),
        }
    }
}

/// Why a copy direction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEnd {
    /// The source closed cleanly.
    Eof,
    /// Reading the source failed.
    ReadError(io::ErrorKind),
    /// Writing the destination failed.
    WriteError(io::ErrorKind),
    /// The session was torn down while the direction was still running.
    TornDown,
}

/// Outcome of one copy direction.
#[derive(Debug, Clone)]
pub struct DirectionReport {
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Why the direction stopped.
    pub end: CopyEnd,
    /// Frame filter counters, when framing was enabled.
    pub filter: Option<FilterStats>,
}

/// Outcome of a whole session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Client to backend.
    pub upstream: DirectionReport,
    /// Backend to client.
    pub downstream: DirectionReport,
}

/// Source side of a copy direction.
enum SessionReader<R> {
    Raw(R),
    Framed(FrameFilter<R>),
}

impl<R: AsyncRead + Unpin> SessionReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SessionReader::Raw(reader) => reader.read(buf).await,
            SessionReader::Framed(filter) => filter.read(buf).await,
        }
    }

    fn stats(&self) -> Option<FilterStats> {
        match self {
            SessionReader::Raw(_) => None,
            SessionReader::Framed(filter) => Some(filter.stats()),
        }
    }
}

/// A client connection paired with its backend connection.
pub struct Session {
    client: TcpStream,
    backend: TcpStream,
    config: SessionConfig,
}

impl Session {
    /// Pair an accepted client with an established backend connection.
    pub fn new(client: TcpStream, backend: TcpStream, config: SessionConfig) -> Self {
        Self {
            client,
            backend,
            config,
        }
    }

    /// Relay both directions until teardown.
    ///
    /// The backend connection is shut down before returning. The client
    /// connection is handed back for the caller to close.
    pub async fn run(mut self) -> (TcpStream, SessionReport) {
        let signal = TeardownSignal::new();
        let capture = match &self.config.log_file {
            Some(path) => open_capture(path).await,
            None => None,
        };

        let (upstream, downstream, capture) = {
            let (client_read, client_write) = self.client.split();
            let (backend_read, backend_write) = self.backend.split();

            let upstream = copy_direction(
                Direction::Upstream,
                self.config.reader(client_read, Direction::Upstream),
                backend_write,
                capture,
                &signal,
            );
            let downstream = copy_direction(
                Direction::Downstream,
                self.config.reader(backend_read, Direction::Downstream),
                client_write,
                None,
                &signal,
            );
            let coordinator = coordinate(&signal, self.config.grace_period);

            let ((upstream, capture), (downstream, _), ()) =
                tokio::join!(upstream, downstream, coordinator);
            (upstream, downstream, capture)
        };

        if let Some(mut file) = capture {
            if let Err(e) = file.flush().await {
                error!(error = %e, "failed to flush capture file");
            }
        }

        if let Err(e) = self.backend.shutdown().await {
            debug!(error = %e, "backend shutdown failed");
        }

        info!(
            bytes_to_backend = upstream.bytes,
            bytes_to_client = downstream.bytes,
            upstream_end = ?upstream.end,
            downstream_end = ?downstream.end,
            "session closed"
        );

        (
            self.client,
            SessionReport {
                upstream,
                downstream,
            },
        )
    }
}

/// Wait for the first direction to end, then tear down after the grace period.
async fn coordinate(signal: &TeardownSignal, grace_period: Duration) {
    signal.wait_first_finished().await;
    debug!(grace_ms = grace_period.as_millis() as u64, "one side finished, delaying teardown");
    tokio::time::sleep(grace_period).await;
    signal.tear_down();
    debug!("session torn down");
}

/// Copy `reader` into `writer` until either fails or the session is torn down.
///
/// Everything read is also appended to `capture` when present.
async fn copy_direction<R, W>(
    direction: Direction,
    mut reader: SessionReader<R>,
    mut writer: W,
    mut capture: Option<File>,
    signal: &TeardownSignal,
) -> (DirectionReport, Option<File>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut teardown = signal.subscribe();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let n = tokio::select! {
            biased;

            _ = raised(&mut teardown) => break CopyEnd::TornDown,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break CopyEnd::Eof,
                Ok(n) => n,
                Err(e) => break CopyEnd::ReadError(e.kind()),
            },
        };

        let failed = match capture.as_mut() {
            Some(file) => file.write_all(&buf[..n]).await.err(),
            None => None,
        };
        if let Some(e) = failed {
            error!(%direction, error = %e, "capture file write failed, capture disabled");
            capture = None;
        }

        tokio::select! {
            biased;

            _ = raised(&mut teardown) => break CopyEnd::TornDown,
            result = writer.write_all(&buf[..n]) => {
                if let Err(e) = result {
                    break CopyEnd::WriteError(e.kind());
                }
            }
        }

        bytes += n as u64;
    };

    debug!(%direction, bytes, end = ?end, "copy finished");
    signal.side_finished();

    let report = DirectionReport {
        bytes,
        end,
        filter: reader.stats(),
    };
    (report, capture)
}

async fn open_capture(path: &Path) -> Option<File> {
    debug!(path = %path.display(), "opening capture file");
    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(file) => Some(file),
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to open capture file, continuing without capture");
            None
        }
    }
}
