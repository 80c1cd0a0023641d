//! rskt: reliable byte-stream sockets over remotely-writable memory.
//!
//! Sockets are addressed by `(component_tag, socket_number)`. A per-node
//! daemon hands out socket numbers and brokers connection setup over a local
//! control channel; once connected, bytes move through a ring buffer living
//! in a pair of memory windows, with no daemon involvement.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use rskt::{LoopbackBackend, Rskt, RsktConfig, SocketAddr};
//!
//! let backend = Arc::new(LoopbackBackend::new());
//! let rskt = Rskt::connect_daemon("/run/rskt.sock", backend, RsktConfig::from_env()).await?;
//!
//! let sock = rskt.create()?;
//! rskt.connect(sock, SocketAddr::new(5, 100)).await?;
//! rskt.write(sock, &[1, 2, 3, 4]).await?;
//! rskt.close(sock).await?;
//! ```
//!
//! # Tasks
//!
//! Each [`Rskt`] runs three tokio tasks:
//!
//! - a sender draining the outbound control queue
//! - a receiver matching responses to waiting callers by sequence number
//! - a request handler serving daemon-ordered forced closes
//!
//! Losing the control channel shuts all three down and fails every pending
//! request with [`RsktError::ConnectionReset`].

mod config;
mod context;
mod link;
mod socket;
mod state;
mod table;

pub use config::RsktConfig;
pub use context::Rskt;
pub use socket::ConnectorRole;
pub use state::SocketState;
pub use table::{Handle, HandleTable, TableError, BLOCK_SIZE};

pub use rskt_core::{ControlChannel, ControlListener, ErrorKind, Resource, RsktError, SocketAddr};
pub use rskt_transport_shm::{
    Backend, LoopbackBackend, PollPolicy, StatsSnapshot, Transfer,
};
