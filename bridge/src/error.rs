use std::{io, time::Duration};

/// The bridge module's result type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures of the bridge between both parties.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("the bridge is not connected")]
    NotConnected,
    #[error("the bridge is already connected")]
    AlreadyConnected,
    #[error("the transmit stream was terminated")]
    Terminated,
    #[error("channel failure: {0}, maybe caused by peer restart")]
    Channel(String),
    #[error("the peer rejected the connection: {0}")]
    Rejected(String),
    #[error("timed out after {timeout:?} waiting for the peer at {remote}")]
    ConnectTimeout { timeout: Duration, remote: String },
    #[error("last iteration {0} not finished")]
    IterInProgress(u64),
    #[error("no iteration started")]
    NotStarted,
    #[error("peer committed without sending {name} for iter_id {iter_id}, please check model code")]
    PeerCommittedWithout { iter_id: u64, name: String },
    #[error("peer terminated without sending {name} for iter_id {iter_id}")]
    PeerTerminated { iter_id: u64, name: String },
    #[error("a data block handler is already registered")]
    HandlerRegistered,
    #[error("{name} for iter_id {iter_id} is not a {expected} payload")]
    PayloadKind {
        iter_id: u64,
        name: String,
        expected: &'static str,
    },
    #[error("the peer reported an error: {0}")]
    Remote(String),
}

impl BridgeError {
    /// Whether the error comes from a broken channel, in which case the
    /// process should exit with `RESTART_EXIT_CODE`.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, BridgeError::Channel(_))
    }
}
