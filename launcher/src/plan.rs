use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{CpuSet, Result};

const LEADER_ADDR: &str = "127.0.0.1:50051";
const FOLLOWER_ADDR: &str = "127.0.0.1:50052";

/// One process of a launch plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Variables set for this process only.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Cores to pin the process to.
    #[serde(default)]
    pub cpus: Option<CpuSet>,
    /// File receiving both stdout and stderr, relative to the working directory.
    #[serde(default)]
    pub log: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cpus: None,
            log: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn log(mut self, log: impl Into<PathBuf>) -> Self {
        self.log = Some(log.into());
        self
    }
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}

fn default_unset_env() -> Vec<String> {
    vec!["http_proxy".to_string(), "https_proxy".to_string()]
}

fn default_reset_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("data"), PathBuf::from("model")]
}

/// The processes of a training job and the environment they run in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchPlan {
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// Variables set for every process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Variables removed from the inherited environment.
    #[serde(default = "default_unset_env")]
    pub unset_env: Vec<String>,
    /// Directories removed before and after the job, relative to `workdir`.
    #[serde(default = "default_reset_dirs")]
    pub reset_dirs: Vec<PathBuf>,
    /// Runs to completion before any role starts.
    #[serde(default)]
    pub data: Option<CommandSpec>,
    #[serde(default)]
    pub parameter_servers: Vec<CommandSpec>,
    pub follower: CommandSpec,
    pub leader: CommandSpec,
}

impl LaunchPlan {
    /// Parses a plan written in TOML.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    /// A job on this machine: synthetic data, then both roles of `program`
    /// talking over the loopback interface.
    ///
    /// # Arguments
    /// * `program` - The binary providing the `make-data`, `leader` and
    ///   `follower` subcommands.
    pub fn local(program: impl Into<String>) -> Self {
        let program = program.into();

        let role = |role: &str, local: &str, peer: &str| {
            let data_path = format!("data/{role}");
            let checkpoint_path = format!("model/{role}/checkpoint");
            let export_path = format!("model/{role}/export");

            CommandSpec::new(&program)
                .args([
                    role,
                    "--local-addr",
                    local,
                    "--peer-addr",
                    peer,
                    "--data-path",
                    data_path.as_str(),
                    "--checkpoint-path",
                    checkpoint_path.as_str(),
                    "--export-path",
                    export_path.as_str(),
                    "--save-checkpoint-steps",
                    "10",
                    "--summary-save-steps",
                    "10",
                    "--epoch-num",
                    "1",
                    "--batch-size",
                    "32",
                    "--loglevel",
                    "debug",
                ])
                .log(format!("{role}.log"))
        };

        let env = [
            ("GRPC_VERBOSITY", "ERROR"),
            ("INTER_OP_PARALLELISM_THREADS", "4"),
            ("INTRA_OP_PARALLELISM_THREADS", "4"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            workdir: default_workdir(),
            env,
            unset_env: default_unset_env(),
            reset_dirs: default_reset_dirs(),
            data: Some(CommandSpec::new(&program).args(["make-data", "--output", "data"])),
            parameter_servers: Vec::new(),
            follower: role("follower", FOLLOWER_ADDR, LEADER_ADDR),
            leader: role("leader", LEADER_ADDR, FOLLOWER_ADDR),
        }
    }
}
