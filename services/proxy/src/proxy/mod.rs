//! MLLP-aware TCP proxy.
//!
//! This module provides:
//! - The supervisor owning the listener and the accept loop
//! - Sessions pairing one client with one backend connection
//! - One-shot teardown coordination between the two copy directions
//!
//! ## Architecture
//!
//! ```text
//! Client -> Supervisor -> Session -> [FrameFilter] -> [capture file] -> Backend
//!                            ^                                            |
//!                            +------------- [FrameFilter] <---------------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use hl7_proxy::{ProxyConfig, Supervisor};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let mut supervisor = Supervisor::new(ProxyConfig::new(":5000", "forum:7000"), shutdown_rx)?;
//! supervisor.bind().await?;
//! supervisor.run().await;
//! ```

mod session;
mod supervisor;
mod teardown;

pub use session::{CopyEnd, DirectionReport, Session, SessionConfig, SessionReport};
pub use supervisor::{Supervisor, SupervisorState, SupervisorStats, RETRY_DELAY};
pub use teardown::{Direction, TeardownSignal, TeardownState};
