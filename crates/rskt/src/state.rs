//! Socket lifecycle states.

use std::fmt;

/// Where a socket is in its life.
///
/// The `Req*` states cover a request that is in flight to the daemon, so a
/// socket stuck mid-round-trip is distinguishable from a settled one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SocketState {
    Uninit = 0,
    Alloced = 1,
    ReqBound = 2,
    Bound = 3,
    ReqListen = 4,
    Listening = 5,
    Accepting = 6,
    ReqConnect = 7,
    Connecting = 8,
    Connected = 9,
    /// The daemon ordered a forced close.
    ShuttingDown = 10,
    /// The application closed a connected socket.
    CloseByLocal = 11,
    /// The peer closed first.
    CloseByRemote = 12,
    Closing = 13,
    ShutDown = 14,
    Closed = 15,
}

impl SocketState {
    pub const ALL: [SocketState; 16] = [
        SocketState::Uninit,
        SocketState::Alloced,
        SocketState::ReqBound,
        SocketState::Bound,
        SocketState::ReqListen,
        SocketState::Listening,
        SocketState::Accepting,
        SocketState::ReqConnect,
        SocketState::Connecting,
        SocketState::Connected,
        SocketState::ShuttingDown,
        SocketState::CloseByLocal,
        SocketState::CloseByRemote,
        SocketState::Closing,
        SocketState::ShutDown,
        SocketState::Closed,
    ];

    #[inline]
    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            SocketState::Uninit => "uninit",
            SocketState::Alloced => "alloced",
            SocketState::ReqBound => "reqbound",
            SocketState::Bound => "bound",
            SocketState::ReqListen => "reqlisten",
            SocketState::Listening => "listening",
            SocketState::Accepting => "accepting",
            SocketState::ReqConnect => "reqconnect",
            SocketState::Connecting => "connecting",
            SocketState::Connected => "connected",
            SocketState::ShuttingDown => "shutting_down",
            SocketState::CloseByLocal => "close_by_local",
            SocketState::CloseByRemote => "close_by_remote",
            SocketState::Closing => "closing",
            SocketState::ShutDown => "shut_down",
            SocketState::Closed => "closed",
        }
    }

    /// Data may still be read in this state.
    pub fn is_readable(self) -> bool {
        matches!(self, SocketState::Connected | SocketState::CloseByRemote)
    }

    /// The socket has, or had, a ring.
    pub fn has_connection(self) -> bool {
        matches!(
            self,
            SocketState::Connecting
                | SocketState::Connected
                | SocketState::ShuttingDown
                | SocketState::CloseByLocal
                | SocketState::CloseByRemote
                | SocketState::Closing
                | SocketState::ShutDown
                | SocketState::Closed
        )
    }

    /// Teardown has begun.
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            SocketState::ShuttingDown
                | SocketState::CloseByLocal
                | SocketState::Closing
                | SocketState::ShutDown
                | SocketState::Closed
        )
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discriminants_round_trip() {
        for (i, state) in SocketState::ALL.iter().enumerate() {
            assert_eq!(*state as u8 as usize, i);
            assert_eq!(SocketState::from_u8(i as u8), Some(*state));
        }
        assert_eq!(SocketState::from_u8(16), None);
    }

    #[test]
    fn test_classification() {
        assert!(SocketState::CloseByRemote.is_readable());
        assert!(!SocketState::CloseByRemote.is_closing());
        assert!(SocketState::ShuttingDown.is_closing());
        assert!(!SocketState::Bound.has_connection());
        assert_eq!(SocketState::CloseByLocal.to_string(), "close_by_local");
    }
}
