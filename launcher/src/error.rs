use std::io;

/// The launcher module's result type.
pub type Result<T> = std::result::Result<T, LaunchError>;

/// Failures while running a launch plan.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid launch plan: {0}")]
    Plan(#[from] toml::de::Error),
    #[error("invalid cpu list {0:?}, expected ranges like 0-3,8")]
    InvalidCpus(String),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{name} exited with status {code:?}")]
    StepFailed { name: String, code: Option<i32> },
    #[error("interrupted")]
    Interrupted,
}

impl LaunchError {
    /// The status the launching process should exit with.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::StepFailed {
                code: Some(code), ..
            } => *code,
            LaunchError::Interrupted => 130,
            _ => 1,
        }
    }
}
