mod bridge;
mod channel;
pub mod config;
pub mod error;
mod state;

pub use bridge::{Bridge, ChannelEvent, DataBlockHandler};
pub use config::{BridgeConfig, Role};
pub use error::{BridgeError, Result};

/// Exit status a role process uses to ask its scheduler for a restart after
/// the channel to its peer broke.
pub const RESTART_EXIT_CODE: i32 = 138;
