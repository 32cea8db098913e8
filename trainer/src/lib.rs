pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod runner;

pub use config::{ClusterSpec, LogLevel, RoleConfig, RuntimeEnv};
pub use error::{ConfigError, Result, TrainerError};
pub use model::{Batch, LinearSplit, Model, StepStats};
pub use runner::{RunSummary, Trainer, run_role};
