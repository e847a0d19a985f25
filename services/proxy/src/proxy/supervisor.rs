//! Listener ownership and the accept loop.
//!
//! The supervisor serves one client at a time:
//!
//! ```text
//! Listening --accept--> dial backend --ok--> Serving --session ends--> Listening
//!                            |
//!                            +--fail--> drop client, reopen listener --> Listening
//! ```
//!
//! A failed backend dial closes and reopens the listener, so clients queued
//! in the accept backlog are dropped and must reconnect.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hl7_mllp::{CommandEncoder, Encoder};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::session::{Session, SessionConfig};
use super::teardown::raised;
use crate::config::ProxyConfig;
use crate::error::ProxyError;

/// Pause after a failed accept or listener open.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No client session active.
    Listening,
    /// A client session is being relayed.
    Serving,
}

/// Statistics for a supervisor.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions relayed to completion.
    pub sessions_completed: AtomicU64,
    /// Backend dial failures.
    pub backend_failed: AtomicU64,
    /// Backend dials that hit the connect timeout.
    pub backend_timeouts: AtomicU64,
    /// Times the listener was closed and reopened.
    pub listener_resets: AtomicU64,
    /// Accept failures not caused by shutdown.
    pub accept_errors: AtomicU64,
    /// Bytes relayed to the backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed to clients.
    pub bytes_to_client: AtomicU64,
    /// A client session is being relayed.
    pub serving: AtomicBool,
}

impl SupervisorStats {
    /// Current supervisor state.
    pub fn state(&self) -> SupervisorState {
        if self.serving.load(Ordering::Acquire) {
            SupervisorState::Serving
        } else {
            SupervisorState::Listening
        }
    }
}

/// Owns the listener and runs sessions one after another.
pub struct Supervisor {
    /// Proxy configuration.
    config: ProxyConfig,
    /// Settings handed to every session.
    session_config: SessionConfig,
    /// Listener, when open.
    listener: Option<TcpListener>,
    /// Address of the first successful bind, reused on reopen.
    bound_addr: Option<SocketAddr>,
    /// Shutdown flag.
    shutdown: watch::Receiver<bool>,
    /// Statistics and current state.
    stats: Arc<SupervisorStats>,
}

impl Supervisor {
    /// Create a supervisor. The listener is not opened until [`Supervisor::bind`] or [`Supervisor::run`].
    pub fn new(config: ProxyConfig, shutdown: watch::Receiver<bool>) -> Result<Self, ProxyError> {
        let session_config = session_config(&config)?;

        Ok(Self {
            config,
            session_config,
            listener: None,
            bound_addr: None,
            shutdown,
            stats: Arc::new(SupervisorStats::default()),
        })
    }

    /// Open the listener if it is not open yet. Returns the bound address.
    pub async fn bind(&mut self) -> Result<SocketAddr, ProxyError> {
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr()?);
        }

        let result = match self.bound_addr {
            Some(addr) => TcpListener::bind(addr).await,
            None => TcpListener::bind(self.config.listen_addr.as_str()).await,
        };
        let listener = result.map_err(|source| ProxyError::Bind {
            addr: self.config.listen_addr.clone(),
            source,
        })?;

        let local_addr = listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener bound");

        self.bound_addr = Some(local_addr);
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Address the listener is (or was last) bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    /// Shared statistics handle.
    pub fn stats(&self) -> Arc<SupervisorStats> {
        Arc::clone(&self.stats)
    }

    /// Run the accept loop until shutdown.
    pub async fn run(mut self) {
        info!(
            listen_addr = %self.config.listen_addr,
            backend_addr = %self.config.backend_addr,
            framing = self.config.framing,
            "Supervisor started"
        );

        while !*self.shutdown.borrow() {
            if let Err(e) = self.bind().await {
                error!(error = %e, "Failed to open listener");
                self.close_listener();
                self.pause().await;
                continue;
            }

            let (client, peer_addr) = match self.accept().await {
                None => break,
                Some(Ok(accepted)) => accepted,
                Some(Err(e)) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Accept error");
                    self.pause().await;
                    continue;
                }
            };

            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            info!(peer_addr = %peer_addr, "Client connected");

            let backend = match self.dial_backend().await {
                Ok(backend) => backend,
                Err(e) => {
                    self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                    if matches!(e, ProxyError::DialTimeout { .. }) {
                        self.stats.backend_timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    error!(
                        peer_addr = %peer_addr,
                        error = %e,
                        "Connection to backend not possible, resetting listener"
                    );
                    drop(client);
                    self.close_listener();
                    self.stats.listener_resets.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            self.serve(client, backend, peer_addr).await;
        }

        self.close_listener();
        info!("Supervisor stopped");
    }

    /// Relay one session to completion, then close the client.
    async fn serve(&mut self, client: TcpStream, backend: TcpStream, peer_addr: SocketAddr) {
        self.stats.serving.store(true, Ordering::Release);
        debug!(peer_addr = %peer_addr, "Start data transfer");

        let session = Session::new(client, backend, self.session_config.clone())
            .run()
            .instrument(tracing::info_span!("session", peer = %peer_addr));
        tokio::pin!(session);

        // Shutdown stops new clients at once; the active session drains on its own.
        let (mut client, report) = tokio::select! {
            result = &mut session => result,
            _ = raised(&mut self.shutdown) => {
                info!(peer_addr = %peer_addr, "Shutdown requested, draining session");
                self.close_listener();
                session.await
            }
        };

        if let Err(e) = client.shutdown().await {
            debug!(peer_addr = %peer_addr, error = %e, "Client shutdown failed");
        }

        self.stats
            .bytes_to_backend
            .fetch_add(report.upstream.bytes, Ordering::Relaxed);
        self.stats
            .bytes_to_client
            .fetch_add(report.downstream.bytes, Ordering::Relaxed);
        self.stats.sessions_completed.fetch_add(1, Ordering::Relaxed);

        info!(peer_addr = %peer_addr, "Client disconnected");
        self.stats.serving.store(false, Ordering::Release);
    }

    /// Accept one client. Returns `None` when shutdown was requested.
    async fn accept(&mut self) -> Option<io::Result<(TcpStream, SocketAddr)>> {
        let Some(listener) = self.listener.as_ref() else {
            return Some(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener is closed",
            )));
        };

        debug!("Waiting for client");
        tokio::select! {
            biased;

            _ = raised(&mut self.shutdown) => {
                info!("Shutdown requested, closing listener");
                None
            }
            result = listener.accept() => Some(result),
        }
    }

    /// Connect to the backend, bounded by the connect timeout.
    async fn dial_backend(&self) -> Result<TcpStream, ProxyError> {
        let addr = &self.config.backend_addr;
        debug!(backend_addr = %addr, "Connecting to backend");

        match timeout(self.config.connect_timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => {
                debug!(backend_addr = %addr, "Backend connection established");
                Ok(stream)
            }
            Ok(Err(source)) => Err(ProxyError::Dial {
                addr: addr.clone(),
                source,
            }),
            Err(_) => Err(ProxyError::DialTimeout {
                addr: addr.clone(),
                timeout: self.config.connect_timeout,
            }),
        }
    }

    fn close_listener(&mut self) {
        if self.listener.take().is_some() {
            debug!("Listener closed");
        }
    }

    /// Sleep for [`RETRY_DELAY`], cut short by shutdown.
    async fn pause(&mut self) {
        tokio::select! {
            _ = raised(&mut self.shutdown) => {}
            _ = tokio::time::sleep(RETRY_DELAY) => {}
        }
    }
}

/// Build the per-session settings, parsing encoder commands once.
fn session_config(config: &ProxyConfig) -> Result<SessionConfig, ProxyError> {
    let source_encoder: Option<Arc<dyn Encoder>> = match &config.source_encoder {
        Some(command) => {
            let encoder = CommandEncoder::parse(command)?;
            info!(command = %encoder.command_line(), "Source encoder configured");
            Some(Arc::new(encoder))
        }
        None => None,
    };

    let destination_encoder: Option<Arc<dyn Encoder>> = match &config.destination_encoder {
        Some(command) => {
            let encoder = CommandEncoder::parse(command)?;
            info!(command = %encoder.command_line(), "Destination encoder configured");
            Some(Arc::new(encoder))
        }
        None => None,
    };

    if !config.framing && (source_encoder.is_some() || destination_encoder.is_some()) {
        warn!("Encoders are ignored while HL7 framing is disabled");
    }

    Ok(SessionConfig {
        framing: config.framing,
        source_encoder,
        destination_encoder,
        encoder_failure: config.encoder_failure,
        max_frame_len: config.max_frame_len,
        log_file: config.log_file.clone(),
        grace_period: config.grace_period,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_from_proxy_config() {
        let mut config = ProxyConfig::new("127.0.0.1:0", "127.0.0.1:7000");
        config.source_encoder = Some("convert --to utf8".to_string());
        config.grace_period = Duration::from_millis(5);

        let session = session_config(&config).unwrap();
        assert!(session.framing);
        assert!(session.source_encoder.is_some());
        assert!(session.destination_encoder.is_none());
        assert_eq!(session.grace_period, Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_bind_is_idempotent() {
        let (_tx, rx) = watch::channel(false);
        let mut supervisor =
            Supervisor::new(ProxyConfig::new("127.0.0.1:0", "127.0.0.1:1"), rx).unwrap();

        let first = supervisor.bind().await.unwrap();
        let second = supervisor.bind().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(supervisor.local_addr(), Some(first));
        assert_eq!(supervisor.stats().state(), SupervisorState::Listening);
    }

    #[tokio::test]
    async fn test_refused_dial_is_not_a_timeout() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let (_tx, rx) = watch::channel(false);
        let supervisor =
            Supervisor::new(ProxyConfig::new("127.0.0.1:0", backend_addr), rx).unwrap();

        let err = supervisor.dial_backend().await.unwrap_err();
        assert_eq!(err.reason_code(), "backend_dial_failed");
    }

    #[tokio::test]
    async fn test_reopen_reuses_bound_port() {
        let (_tx, rx) = watch::channel(false);
        let mut supervisor =
            Supervisor::new(ProxyConfig::new("127.0.0.1:0", "127.0.0.1:1"), rx).unwrap();

        let first = supervisor.bind().await.unwrap();
        supervisor.close_listener();
        let second = supervisor.bind().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_bind_failure_reports_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let (_tx, rx) = watch::channel(false);
        let mut supervisor =
            Supervisor::new(ProxyConfig::new(addr.clone(), "127.0.0.1:1"), rx).unwrap();

        let err = supervisor.bind().await.unwrap_err();
        assert_eq!(err.reason_code(), "listen_failed");
        assert!(err.to_string().contains(&addr));
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown_while_listening() {
        let (tx, rx) = watch::channel(false);
        let mut supervisor =
            Supervisor::new(ProxyConfig::new("127.0.0.1:0", "127.0.0.1:1"), rx).unwrap();
        supervisor.bind().await.unwrap();

        let handle = tokio::spawn(supervisor.run());
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_empty_encoder_command_rejected() {
        let mut config = ProxyConfig::new("127.0.0.1:0", "127.0.0.1:7000");
        config.destination_encoder = Some(String::new());

        let (_tx, rx) = watch::channel(false);
        let err = Supervisor::new(config, rx).err().unwrap();
        assert_eq!(err.reason_code(), "encoder_failed");
    }
}
