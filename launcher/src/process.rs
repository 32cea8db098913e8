//! Turns the entries of a plan into child processes.

use std::{fs::File, process::ExitStatus, process::Stdio};

use log::{info, warn};
use tokio::process::{Child, Command};

use crate::{CommandSpec, LaunchError, LaunchPlan, Result};

/// Renders a command line the way a shell trace would.
pub(crate) fn command_line(program: &str, args: &[String]) -> String {
    let mut line = String::from(program);

    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            line.push_str(&format!("{arg:?}"));
        } else {
            line.push_str(arg);
        }
    }

    line
}

/// Builds the command of `spec` within the environment of `plan`.
///
/// # Returns
/// The command and its printable command line.
pub(crate) fn build(plan: &LaunchPlan, spec: &CommandSpec) -> Result<(Command, String)> {
    let (program, args) = match &spec.cpus {
        Some(cpus) => cpus.wrap(&spec.program, &spec.args),
        None => (spec.program.clone(), spec.args.clone()),
    };

    let line = command_line(&program, &args);
    let mut command = Command::new(&program);
    command
        .args(&args)
        .current_dir(&plan.workdir)
        .kill_on_drop(true);

    for key in &plan.unset_env {
        command.env_remove(key);
    }
    command.envs(&plan.env).envs(&spec.env);

    if let Some(log) = &spec.log {
        let file = File::create(plan.workdir.join(log))?;
        command
            .stdout(Stdio::from(file.try_clone()?))
            .stderr(Stdio::from(file));
    }

    Ok((command, line))
}

/// A running process of the plan.
#[derive(Debug)]
pub(crate) struct Running {
    pub name: String,
    child: Child,
}

impl Running {
    /// Starts `spec` as the process called `name`, tracing its command line.
    pub fn spawn(name: &str, plan: &LaunchPlan, spec: &CommandSpec) -> Result<Self> {
        let (mut command, line) = build(plan, spec)?;
        info!("+ {line}");

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        Ok(Self {
            name: name.to_string(),
            child,
        })
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        info!(status = status.code(); "{} exited", self.name);
        Ok(status)
    }

    /// Kills the process if it's still running and reaps it.
    pub async fn kill(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        warn!("killing {}", self.name);
        if let Err(e) = self.child.kill().await {
            warn!("failed to kill {}: {e}", self.name);
        }
    }

    /// Fails unless `status` is a successful exit.
    pub fn check(&self, status: ExitStatus) -> Result<ExitStatus> {
        if status.success() {
            return Ok(status);
        }

        Err(LaunchError::StepFailed {
            name: self.name.clone(),
            code: status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;

    use super::*;
    use crate::CpuSet;

    fn plan() -> LaunchPlan {
        LaunchPlan::from_toml(
            r#"
            [env]
            GRPC_VERBOSITY = "ERROR"

            [follower]
            program = "follower"

            [leader]
            program = "leader"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn command_carries_the_environment() {
        let plan = plan();
        let mut spec = CommandSpec::new("fedtrain").args(["leader", "--app-id", "my job"]);
        spec.env.insert("RUST_LOG".into(), "debug".into());

        let (command, line) = build(&plan, &spec).unwrap();
        assert_eq!(line, "fedtrain leader --app-id \"my job\"");

        let envs: Vec<_> = command.as_std().get_envs().collect();
        assert!(envs.contains(&(OsStr::new("http_proxy"), None)));
        assert!(envs.contains(&(OsStr::new("https_proxy"), None)));
        assert!(envs.contains(&(OsStr::new("GRPC_VERBOSITY"), Some(OsStr::new("ERROR")))));
        assert!(envs.contains(&(OsStr::new("RUST_LOG"), Some(OsStr::new("debug")))));
    }

    #[test]
    fn pinned_command_runs_under_taskset() {
        let plan = plan();
        let mut spec = CommandSpec::new("fedtrain").args(["follower"]);
        spec.cpus = Some(CpuSet::parse("0-1").unwrap());

        let (command, line) = build(&plan, &spec).unwrap();
        assert_eq!(line, "taskset -c 0-1 fedtrain follower");
        assert_eq!(command.as_std().get_program(), "taskset");
    }
}
