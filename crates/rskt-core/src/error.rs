//! Error taxonomy.
//!
//! [`RsktError`] is what every public operation returns. [`Status`] is the
//! numeric code the daemon puts in a response; the two convert losslessly
//! for every condition the daemon can report.

use std::fmt;

/// Coarse classification of an [`RsktError`], stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotConnected,
    ConnectionReset,
    ResourceExhausted,
    TimedOut,
    AddressInUse,
    NotBound,
    Busy,
    NoRoute,
    Refused,
    DaemonUnreachable,
}

/// A resource that can run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// The library's socket handle table is full.
    Handles,
    /// The daemon has no free socket numbers.
    SocketNumbers,
    /// The outbound control queue is closed or full.
    ControlQueue,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Handles => f.write_str("socket handles"),
            Resource::SocketNumbers => f.write_str("socket numbers"),
            Resource::ControlQueue => f.write_str("control queue"),
        }
    }
}

/// Errors returned by rskt operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RsktError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invalid or stale socket handle {0:#018x}")]
    InvalidHandle(u64),

    #[error("operation not permitted in socket state {0}")]
    InvalidState(&'static str),

    #[error("socket is not connected")]
    NotConnected,

    #[error("connection reset")]
    ConnectionReset,

    #[error("{0} exhausted")]
    Exhausted(Resource),

    #[error("operation timed out")]
    TimedOut,

    #[error("address in use")]
    AddressInUse,

    #[error("socket is not bound")]
    NotBound,

    #[error("socket is busy")]
    Busy,

    #[error("no route to destination")]
    NoRoute,

    #[error("connection refused")]
    Refused,

    #[error("daemon unreachable")]
    DaemonUnreachable,
}

impl RsktError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RsktError::InvalidArgument(_)
            | RsktError::InvalidHandle(_)
            | RsktError::InvalidState(_) => ErrorKind::InvalidArgument,
            RsktError::NotConnected => ErrorKind::NotConnected,
            RsktError::ConnectionReset => ErrorKind::ConnectionReset,
            RsktError::Exhausted(_) => ErrorKind::ResourceExhausted,
            RsktError::TimedOut => ErrorKind::TimedOut,
            RsktError::AddressInUse => ErrorKind::AddressInUse,
            RsktError::NotBound => ErrorKind::NotBound,
            RsktError::Busy => ErrorKind::Busy,
            RsktError::NoRoute => ErrorKind::NoRoute,
            RsktError::Refused => ErrorKind::Refused,
            RsktError::DaemonUnreachable => ErrorKind::DaemonUnreachable,
        }
    }
}

/// Response status code carried on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    InvalidArgument = 1,
    AddressInUse = 2,
    NotBound = 3,
    Busy = 4,
    NoRoute = 5,
    Refused = 6,
    Exhausted = 7,
    Reset = 8,
    NotFound = 9,
}

impl Status {
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            0 => Status::Ok,
            1 => Status::InvalidArgument,
            2 => Status::AddressInUse,
            3 => Status::NotBound,
            4 => Status::Busy,
            5 => Status::NoRoute,
            6 => Status::Refused,
            7 => Status::Exhausted,
            8 => Status::Reset,
            9 => Status::NotFound,
            _ => return None,
        })
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Convert a status into the error a caller sees.
    pub fn into_result(self) -> Result<(), RsktError> {
        match self {
            Status::Ok => Ok(()),
            Status::InvalidArgument => Err(RsktError::InvalidArgument("rejected by daemon")),
            Status::AddressInUse => Err(RsktError::AddressInUse),
            Status::NotBound => Err(RsktError::NotBound),
            Status::Busy => Err(RsktError::Busy),
            Status::NoRoute => Err(RsktError::NoRoute),
            Status::Refused => Err(RsktError::Refused),
            Status::Exhausted => Err(RsktError::Exhausted(Resource::SocketNumbers)),
            Status::Reset => Err(RsktError::ConnectionReset),
            Status::NotFound => Err(RsktError::InvalidArgument("unknown socket number")),
        }
    }
}

impl From<&RsktError> for Status {
    fn from(e: &RsktError) -> Self {
        match e {
            RsktError::InvalidArgument(_)
            | RsktError::InvalidHandle(_)
            | RsktError::InvalidState(_) => Status::InvalidArgument,
            RsktError::NotConnected | RsktError::ConnectionReset | RsktError::TimedOut => {
                Status::Reset
            }
            RsktError::Exhausted(_) => Status::Exhausted,
            RsktError::AddressInUse => Status::AddressInUse,
            RsktError::NotBound => Status::NotBound,
            RsktError::Busy => Status::Busy,
            RsktError::NoRoute => Status::NoRoute,
            RsktError::Refused => Status::Refused,
            RsktError::DaemonUnreachable => Status::Reset,
        }
    }
}
