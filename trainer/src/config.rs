use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use bridge::{BridgeConfig, Role};
use log::LevelFilter;
use serde::Deserialize;

use crate::ConfigError;

const INTER_OP_THREADS: &str = "INTER_OP_PARALLELISM_THREADS";
const INTRA_OP_THREADS: &str = "INTRA_OP_PARALLELISM_THREADS";
const GRPC_VERBOSITY: &str = "GRPC_VERBOSITY";
const SECURE_CHANNEL_VARS: [&str; 2] = ["FL_GRPC_SGX_RA_TLS_ENABLE", "TF_GRPC_SGX_RA_TLS_ENABLE"];

/// The verbosity accepted by `--loglevel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    #[value(alias = "warn")]
    Warning,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

/// The flags of a leader or follower process.
#[derive(Debug, Clone, clap::Args)]
pub struct RoleConfig {
    /// `host:port` to accept the peer's requests on.
    #[arg(long, value_parser = parse_host_port)]
    pub local_addr: String,
    /// `host:port` the peer accepts our requests on.
    #[arg(long, value_parser = parse_host_port)]
    pub peer_addr: String,
    /// Directory holding this party's data blocks.
    #[arg(long)]
    pub data_path: PathBuf,
    #[arg(long)]
    pub checkpoint_path: Option<PathBuf>,
    #[arg(long)]
    pub export_path: Option<PathBuf>,
    /// Write a checkpoint every this many steps, 0 only writes one at the end.
    #[arg(long, default_value_t = 0)]
    pub save_checkpoint_steps: u64,
    /// Log a training summary every this many steps, 0 disables it.
    #[arg(long, default_value_t = 0)]
    pub summary_save_steps: u64,
    #[arg(long, default_value_t = 1)]
    pub epoch_num: u32,
    #[arg(long, default_value = "32")]
    pub batch_size: NonZeroUsize,
    #[arg(long, value_parser = ClusterSpec::parse)]
    pub cluster_spec: Option<ClusterSpec>,
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,
    #[arg(long, default_value = "test_trainer")]
    pub app_id: String,
    #[arg(long, default_value_t = 0)]
    pub rank: u32,
    /// Seconds between warnings while waiting for the peer's data.
    #[arg(long, default_value_t = 10)]
    pub waiting_alert_timeout: u64,
    #[arg(long, default_value = "1024")]
    pub stream_queue_size: NonZeroUsize,
    /// Seconds to wait for the peer to come up.
    #[arg(long, default_value_t = 300)]
    pub connect_timeout: u64,
    #[arg(long, default_value_t = 0.05)]
    pub learning_rate: f32,
}

impl RoleConfig {
    /// The bridge settings for `role`.
    pub fn bridge_config(&self, role: Role) -> BridgeConfig {
        let mut cfg = BridgeConfig::new(role, &self.local_addr, &self.peer_addr)
            .with_waiting_alert_timeout(Duration::from_secs(self.waiting_alert_timeout));

        cfg.app_id = self.app_id.clone();
        cfg.rank = self.rank;
        cfg.stream_queue_size = self.stream_queue_size;
        cfg.connect_timeout = Duration::from_secs(self.connect_timeout);
        cfg
    }
}

/// Checks `text` is a `host:port` pair, leaving name resolution to connect time.
pub fn parse_host_port(text: &str) -> Result<String, ConfigError> {
    let valid = text
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());

    if !valid {
        return Err(ConfigError::Address(text.to_string()));
    }

    Ok(text.to_string())
}

/// The addresses of the processes of a distributed job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClusterSpec {
    #[serde(rename = "PS", default)]
    pub ps: Vec<String>,
    #[serde(rename = "Worker", default)]
    pub workers: Vec<String>,
}

#[derive(Deserialize)]
struct ClusterSpecDoc {
    #[serde(rename = "clusterSpec")]
    cluster_spec: ClusterSpec,
}

impl ClusterSpec {
    /// Parses `{"clusterSpec": {"PS": [..], "Worker": [..]}}`, checking every
    /// entry is a `host:port` pair.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let doc: ClusterSpecDoc =
            serde_json::from_str(text).map_err(|e| ConfigError::ClusterSpec(e.to_string()))?;
        let spec = doc.cluster_spec;

        for addr in spec.ps.iter().chain(&spec.workers) {
            parse_host_port(addr).map_err(|e| ConfigError::ClusterSpec(e.to_string()))?;
        }

        Ok(spec)
    }
}

/// Settings read from the process environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeEnv {
    pub inter_op_threads: Option<NonZeroUsize>,
    pub intra_op_threads: Option<NonZeroUsize>,
    pub grpc_verbosity: Option<LevelFilter>,
    /// The variable asking for an attested channel, if any.
    pub secure_channel: Option<&'static str>,
}

impl RuntimeEnv {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let threads = |key: &'static str| -> Result<Option<NonZeroUsize>, ConfigError> {
            match lookup(key) {
                None => Ok(None),
                Some(value) if value.trim().is_empty() => Ok(None),
                Some(value) => value
                    .trim()
                    .parse::<usize>()
                    .map(NonZeroUsize::new)
                    .map_err(|_| ConfigError::InvalidEnv { key, value }),
            }
        };

        let grpc_verbosity = match lookup(GRPC_VERBOSITY) {
            None => None,
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(match value.trim().to_ascii_uppercase().as_str() {
                "DEBUG" => LevelFilter::Debug,
                "INFO" => LevelFilter::Info,
                "ERROR" => LevelFilter::Error,
                "NONE" => LevelFilter::Off,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: GRPC_VERBOSITY,
                        value,
                    });
                }
            }),
        };

        let mut secure_channel = None;
        for key in SECURE_CHANNEL_VARS {
            let Some(value) = lookup(key) else {
                continue;
            };

            match value.trim().to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => {
                    secure_channel.get_or_insert(key);
                }
                "off" | "false" | "0" | "" => {}
                _ => return Err(ConfigError::InvalidEnv { key, value }),
            }
        }

        Ok(Self {
            inter_op_threads: threads(INTER_OP_THREADS)?,
            intra_op_threads: threads(INTRA_OP_THREADS)?,
            grpc_verbosity,
            secure_channel,
        })
    }

    /// Fails if the environment asks for something this build can't honor.
    pub fn ensure_supported(&self) -> Result<(), ConfigError> {
        match self.secure_channel {
            Some(key) => Err(ConfigError::SecureChannelUnsupported(key)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use clap::Parser;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Result<RuntimeEnv, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeEnv::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_has_no_overrides() {
        let env = env(&[]).unwrap();
        assert_eq!(env, RuntimeEnv::default());
        assert!(env.ensure_supported().is_ok());
    }

    #[test]
    fn reads_thread_counts_and_verbosity() {
        let env = env(&[
            ("INTER_OP_PARALLELISM_THREADS", "4"),
            ("INTRA_OP_PARALLELISM_THREADS", "0"),
            ("GRPC_VERBOSITY", "error"),
        ])
        .unwrap();

        assert_eq!(env.inter_op_threads, NonZeroUsize::new(4));
        assert_eq!(env.intra_op_threads, None);
        assert_eq!(env.grpc_verbosity, Some(LevelFilter::Error));
    }

    #[test]
    fn empty_verbosity_is_unset() {
        let env = env(&[("GRPC_VERBOSITY", ""), ("INTER_OP_PARALLELISM_THREADS", " ")]).unwrap();
        assert_eq!(env, RuntimeEnv::default());
    }

    #[test]
    fn rejects_garbage_values() {
        assert!(env(&[("INTER_OP_PARALLELISM_THREADS", "many")]).is_err());
        assert!(env(&[("GRPC_VERBOSITY", "LOUD")]).is_err());
        assert!(env(&[("FL_GRPC_SGX_RA_TLS_ENABLE", "maybe")]).is_err());
    }

    #[test]
    fn secure_channel_request_is_refused() {
        let env = env(&[
            ("TF_GRPC_SGX_RA_TLS_ENABLE", "off"),
            ("FL_GRPC_SGX_RA_TLS_ENABLE", "on"),
        ])
        .unwrap();

        assert_eq!(env.secure_channel, Some("FL_GRPC_SGX_RA_TLS_ENABLE"));
        assert!(matches!(
            env.ensure_supported(),
            Err(ConfigError::SecureChannelUnsupported("FL_GRPC_SGX_RA_TLS_ENABLE"))
        ));
    }

    #[test]
    fn parses_cluster_spec() {
        let spec = ClusterSpec::parse(
            r#"{"clusterSpec": {"PS": ["localhost:10000"], "Worker": ["localhost:20000"]}}"#,
        )
        .unwrap();

        assert_eq!(spec.ps, vec!["localhost:10000"]);
        assert_eq!(spec.workers, vec!["localhost:20000"]);
    }

    #[test]
    fn rejects_bad_cluster_spec() {
        assert!(ClusterSpec::parse("{}").is_err());
        assert!(ClusterSpec::parse(r#"{"clusterSpec": {"PS": ["nowhere"]}}"#).is_err());
        assert!(ClusterSpec::parse(r#"{"clusterSpec": {"PS": [":80"]}}"#).is_err());
    }

    #[derive(clap::Parser)]
    struct Cli {
        #[command(flatten)]
        role: RoleConfig,
    }

    #[test]
    fn flags_parse_with_defaults() {
        let cli = Cli::try_parse_from([
            "leader",
            "--local-addr",
            "127.0.0.1:50051",
            "--peer-addr",
            "127.0.0.1:50052",
            "--data-path",
            "data/leader",
            "--checkpoint-path",
            "model/leader/checkpoint",
            "--save-checkpoint-steps",
            "10",
            "--epoch-num",
            "2",
            "--loglevel",
            "debug",
        ])
        .unwrap();

        let cfg = cli.role;
        assert_eq!(cfg.batch_size.get(), 32);
        assert_eq!(cfg.epoch_num, 2);
        assert_eq!(cfg.save_checkpoint_steps, 10);
        assert_eq!(cfg.loglevel, LogLevel::Debug);
        assert!(cfg.cluster_spec.is_none());

        let bridge = cfg.bridge_config(Role::Leader);
        assert_eq!(bridge.token(), "test_trainer-0");
        assert_eq!(bridge.remote_addr, "127.0.0.1:50052");
    }

    #[test]
    fn addresses_may_name_hosts() {
        let cli = Cli::try_parse_from([
            "follower",
            "--local-addr",
            "[::]:50052",
            "--peer-addr",
            "localhost:50051",
            "--data-path",
            "data/follower",
        ])
        .unwrap();

        let bridge = cli.role.bridge_config(Role::Follower);
        assert_eq!(bridge.listen_addr, "[::]:50052");
        assert_eq!(bridge.remote_addr, "localhost:50051");
    }

    #[test]
    fn addresses_need_a_port() {
        for addr in ["localhost", "localhost:", "host:99999", ":80"] {
            assert!(
                matches!(parse_host_port(addr), Err(ConfigError::Address(_))),
                "{addr:?} should be rejected"
            );
        }
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let res = Cli::try_parse_from([
            "leader",
            "--local-addr",
            "127.0.0.1:1",
            "--peer-addr",
            "127.0.0.1:2",
            "--data-path",
            "d",
            "--batch-size",
            "0",
        ]);
        assert!(res.is_err());
    }
}
