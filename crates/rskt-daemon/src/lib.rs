//! rskt-daemon: the per-node half of rskt's control plane.
//!
//! One daemon runs per node. Libraries connect to it over a
//! [`ControlChannel`](rskt_core::ControlChannel) and ask it to:
//!
//! - allocate socket numbers (explicit binds and a dynamic range)
//! - park CONNECTs in a listener's backlog until an ACCEPT matches them
//! - name the pair of memory windows each new connection maps
//!
//! It also tells libraries to let go: a CLOSE reported as not flushed, or
//! a library disappearing, turns into a forced close for the peer.
//!
//! ```ignore
//! let daemon = Daemon::new(DaemonConfig::from_env())?;
//! daemon.serve(ControlListener::bind("/run/rskt.sock")?).await?;
//! ```

mod config;
mod daemon;
mod error;
mod registry;

pub use config::{ConfigError, DaemonConfig};
pub use daemon::Daemon;
pub use error::DaemonError;
