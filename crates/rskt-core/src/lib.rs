//! rskt-core: shared vocabulary for the rskt reliable-socket stack.
//!
//! This crate holds everything the application library and the per-node
//! daemon must agree on:
//!
//! - [`SocketAddr`]: a `(component_tag, socket_number)` endpoint
//! - [`RsktError`] / [`ErrorKind`] / [`Status`]: the error taxonomy, both as
//!   surfaced to callers and as carried on the control channel
//! - [`wire`]: the control-message records exchanged with the daemon
//! - [`channel`]: the message-boundary-preserving local control channel
//! - [`PendingRegistry`] / [`Shutdown`]: request correlation and the stop
//!   latch shared by the library's and the daemon's worker tasks
//!
//! The data plane (ring buffers in remotely-writable memory) lives in
//! `rskt-transport-shm`.

mod addr;
pub mod channel;
mod error;
mod pending;
mod shutdown;
pub mod wire;

pub use addr::SocketAddr;
pub use channel::{ChannelError, ControlChannel, ControlListener};
pub use error::{ErrorKind, Resource, RsktError, Status};
pub use pending::{Outcome, PendingGuard, PendingRegistry};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use wire::{Body, ConnSetup, Kind, Message, Reply, Request, Response, WireError};
