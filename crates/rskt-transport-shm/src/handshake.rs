//! Three-phase link handshake.
//!
//! Each side walks Announce → Settle → Arm. On entering a phase it writes
//! the phase's own flags (and, in Arm, its starting pointers) into its local
//! quad and pushes the quad to the peer. It then waits for the peer's quad
//! to show a state the phase accepts. Each phase accepts the peer being one
//! step ahead, so neither ordering of the two sides can deadlock.
//!
//! | phase    | own flags            | accepts from peer                |
//! |----------|----------------------|----------------------------------|
//! | Announce | ZEROED \| INIT_DONE  | ZEROED \| INIT_DONE, or ZEROED   |
//! | Settle   | ZEROED               | ZEROED, or INIT                  |
//! | Arm      | INIT (w=1, r=0)      | INIT                             |
//!
//! A peer showing CLOSING, CLOSED or ERROR at any point aborts the
//! handshake. This module is the pure decision logic; the async driver
//! lives on the ring.

use crate::layout::{HandshakeFlags, LinkFlags, QuadSnapshot};

/// Write pointer a side starts with once armed.
pub const INITIAL_WRITE_PTR: u32 = 1;

/// Read pointer a side starts with once armed.
pub const INITIAL_READ_PTR: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Announce,
    Settle,
    Arm,
    /// Handshake complete.
    Live,
}

impl Phase {
    /// The phases a side passes through, in order.
    pub const SEQUENCE: [Phase; 3] = [Phase::Announce, Phase::Settle, Phase::Arm];

    /// Handshake flags this side shows while in the phase.
    pub fn own_flags(self) -> HandshakeFlags {
        match self {
            Phase::Announce => HandshakeFlags::ZEROED | HandshakeFlags::INIT_DONE,
            Phase::Settle => HandshakeFlags::ZEROED,
            Phase::Arm | Phase::Live => HandshakeFlags::INIT,
        }
    }

    /// Whether entering this phase also stamps the starting pointers.
    pub fn stamps_pointers(self) -> bool {
        self == Phase::Arm
    }

    /// Whether the peer showing `peer` lets this side leave the phase.
    pub fn accepts(self, peer: HandshakeFlags) -> bool {
        match self {
            Phase::Announce => {
                peer == HandshakeFlags::ZEROED | HandshakeFlags::INIT_DONE
                    || peer == HandshakeFlags::ZEROED
            }
            Phase::Settle => peer == HandshakeFlags::ZEROED || peer == HandshakeFlags::INIT,
            Phase::Arm | Phase::Live => peer == HandshakeFlags::INIT,
        }
    }

    pub fn next(self) -> Phase {
        match self {
            Phase::Announce => Phase::Settle,
            Phase::Settle => Phase::Arm,
            Phase::Arm | Phase::Live => Phase::Live,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("peer raised {flags:?} during {phase:?}")]
    Aborted { phase: Phase, flags: LinkFlags },

    #[error("peer did not leave {phase:?} in time")]
    TimedOut { phase: Phase },

    #[error("handshake cancelled")]
    Cancelled,

    #[error("failed to push header: {0}")]
    Backend(#[from] crate::backend::BackendError),
}

/// Judge the peer's mirrored quad against the current phase.
///
/// `Ok(true)` means the phase is complete, `Ok(false)` means keep waiting.
/// Both the write-side and read-side flags must be acceptable.
pub fn evaluate(phase: Phase, remote: &QuadSnapshot) -> Result<bool, HandshakeError> {
    let link = remote.link();
    if !link.is_empty() {
        return Err(HandshakeError::Aborted { phase, flags: link });
    }
    Ok(phase.accepts(remote.write_flags.handshake) && phase.accepts(remote.read_flags.handshake))
}
