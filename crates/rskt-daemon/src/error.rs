use std::io;

use rskt_core::{ChannelError, RsktError, Status, WireError};

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("control channel: {0}")]
    Channel(#[from] ChannelError),

    #[error("malformed control record: {0}")]
    Wire(#[from] WireError),

    #[error("socket number {0} is not in use")]
    UnknownSocket(u32),

    #[error("client {0} is gone")]
    SessionGone(u32),

    #[error("forced close of {sn} not acknowledged in time")]
    ForcedCloseTimedOut { sn: u32 },

    #[error("forced close of {sn} failed: {reason}")]
    ForcedCloseFailed { sn: u32, reason: RsktError },

    #[error("forced close of {sn} answered with {status:?}")]
    ForcedCloseRejected { sn: u32, status: Status },

    #[error("daemon is shut down")]
    ShutDown,
}
