//! rskt-transport-shm: ring-buffer data plane for rskt.
//!
//! A connection is a pair of memory windows, one per peer. Each side writes
//! into its own tx region, pushes the bytes into the peer's rx region with a
//! [`Backend`] transfer primitive, then pushes its 16-byte header quad into
//! the peer's mirrored header slot. Nothing else crosses the fabric.
//!
//! # Window layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Header (64 bytes)                                        │
//! │    [0..16)  local quad: wr_ptr, wr_flags, rd_ptr, rd_flags│
//! │    [16..32) remote quad (peer's local quad, pushed in)    │
//! ├──────────────────────────────────────────────────────────┤
//! │  tx region (buffer_size): staging for outbound pushes     │
//! ├──────────────────────────────────────────────────────────┤
//! │  rx region (buffer_size): peer pushes data here           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Before data flows, both sides run the three-phase [`handshake`] so that
//! neither starts writing while the other may still be zeroing its view.

pub mod backend;
pub mod handshake;
pub mod layout;
mod loopback;
pub mod poll;
mod ring;

pub use backend::{Backend, BackendError, MappedWindow, ObjectId, PortHandle, RemoteObject, Transfer};
pub use handshake::{HandshakeError, Phase};
pub use layout::{
    HandshakeFlags, LayoutError, LinkFlags, QuadSnapshot, RingLayout, SideFlags, DEFAULT_BUFFER_SIZE,
    HEADER_SIZE, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE,
};
pub use loopback::{LoopbackBackend, TransferRecord};
pub use poll::{poll_until, PollPolicy, PollTimeout};
pub use ring::{free_bytes, segments, used_bytes, Avail, CloseOutcome, Ring, RingError, Segment, StatsSnapshot};
