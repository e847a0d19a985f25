pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;

pub use config::{Args, ProxyConfig};
pub use error::ProxyError;
pub use proxy::{
    CopyEnd, Direction, DirectionReport, Session, SessionConfig, SessionReport, Supervisor,
    SupervisorState, SupervisorStats,
};
