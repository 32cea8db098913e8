use std::{fmt, num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};

const DEFAULT_APP_ID: &str = "test_trainer";
const DEFAULT_STREAM_QUEUE_SIZE: usize = 1024;
const MIN_WAITING_ALERT_TIMEOUT: Duration = Duration::from_secs(1);

/// The side of the two-party setup a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable settings of a `Bridge`.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub role: Role,
    /// A `host:port` pair, resolved when connecting.
    pub listen_addr: String,
    pub remote_addr: String,
    pub app_id: String,
    pub rank: u32,
    pub stream_queue_size: NonZeroUsize,
    pub connect_timeout: Duration,
    pub retry_interval: Duration,
    pub close_timeout: Duration,
    waiting_alert_timeout: Duration,
}

impl BridgeConfig {
    /// Creates a configuration with the default tunables.
    ///
    /// # Arguments
    /// * `role` - Which side this process plays.
    /// * `listen_addr` - Where the peer's requests are accepted.
    /// * `remote_addr` - Where the peer accepts ours.
    pub fn new(role: Role, listen_addr: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        Self {
            role,
            listen_addr: listen_addr.into(),
            remote_addr: remote_addr.into(),
            app_id: DEFAULT_APP_ID.to_string(),
            rank: 0,
            stream_queue_size: NonZeroUsize::new(DEFAULT_STREAM_QUEUE_SIZE)
                .unwrap_or(NonZeroUsize::MIN),
            connect_timeout: Duration::from_secs(300),
            retry_interval: Duration::from_millis(500),
            close_timeout: Duration::from_secs(30),
            waiting_alert_timeout: Duration::from_secs(10),
        }
    }

    /// Sets how long `receive` waits between warnings, never less than a second.
    pub fn with_waiting_alert_timeout(mut self, timeout: Duration) -> Self {
        self.waiting_alert_timeout = timeout.max(MIN_WAITING_ALERT_TIMEOUT);
        self
    }

    pub fn waiting_alert_timeout(&self) -> Duration {
        self.waiting_alert_timeout
    }

    /// The token both parties must agree on during the handshake.
    pub fn token(&self) -> String {
        format!("{}-{}", self.app_id, self.rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BridgeConfig {
        BridgeConfig::new(Role::Leader, "127.0.0.1:0", "127.0.0.1:0")
    }

    #[test]
    fn token_joins_app_id_and_rank() {
        let mut cfg = config();
        assert_eq!(cfg.token(), "test_trainer-0");

        cfg.app_id = "job".into();
        cfg.rank = 3;
        assert_eq!(cfg.token(), "job-3");
    }

    #[test]
    fn waiting_alert_timeout_is_clamped() {
        let cfg = config().with_waiting_alert_timeout(Duration::from_millis(10));
        assert_eq!(cfg.waiting_alert_timeout(), Duration::from_secs(1));
    }
}
