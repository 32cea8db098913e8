use std::{io, path::PathBuf};

use bridge::{BridgeError, Role};

/// The trainer module's result type.
pub type Result<T> = std::result::Result<T, TrainerError>;

/// Invalid flags or environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("{0:?} is not a host:port address")]
    Address(String),
    #[error("invalid cluster spec: {0}")]
    ClusterSpec(String),
    #[error("{0} requests an attested secure channel, which this build does not provide")]
    SecureChannelUnsupported(&'static str),
}

/// Failures of a training role.
#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("{path}:{line}: {reason}")]
    Data {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("no data blocks found under {0}")]
    NoData(PathBuf),
    #[error("the peer's example ids for iter_id {iter_id} don't match ours")]
    Misaligned { iter_id: u64 },
    #[error("size mismatch for {what}: got {got}, expected {expected}")]
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("the leader's examples must carry labels")]
    MissingLabels,
    #[error("the model state belongs to the {found} role, expected {expected}")]
    ModelRole { expected: Role, found: Role },
}

impl TrainerError {
    /// Whether the failure comes from a broken channel to the peer.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, TrainerError::Bridge(e) if e.is_channel_failure())
    }
}
