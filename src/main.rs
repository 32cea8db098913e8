mod logging;

use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use bridge::{RESTART_EXIT_CODE, Role};
use clap::{Parser, Subcommand};
use launcher::{LaunchError, LaunchPlan, Launcher};
use log::{LevelFilter, error, info};
use tokio::runtime;
use trainer::{
    RoleConfig, RuntimeEnv, TrainerError,
    data::{SynthConfig, generate},
    run_role,
};

#[derive(Debug, Parser)]
#[command(name = "fedtrain", version, about = "Two-party vertical federated training")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Runs the party holding the labels.
    Leader(RoleConfig),
    /// Runs the party following the leader's data blocks.
    Follower(RoleConfig),
    /// Writes a synthetic vertically partitioned dataset.
    MakeData(SynthConfig),
    /// Runs a whole job: data, parameter servers, follower and leader.
    Launch(LaunchArgs),
}

#[derive(Debug, clap::Args)]
struct LaunchArgs {
    /// TOML launch plan, a local job of this binary when missing.
    #[arg(long)]
    plan: Option<PathBuf>,
    /// Overrides the working directory of the plan.
    #[arg(long)]
    workdir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let res = match cli.command {
        Cmd::Leader(config) => role(Role::Leader, config),
        Cmd::Follower(config) => role(Role::Follower, config),
        Cmd::MakeData(config) => make_data(config),
        Cmd::Launch(args) => launch(args),
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Maps a failure to the process exit status.
fn exit_code(e: &anyhow::Error) -> u8 {
    if let Some(e) = e.downcast_ref::<TrainerError>()
        && e.is_channel_failure()
    {
        return RESTART_EXIT_CODE as u8;
    }

    if let Some(e) = e.downcast_ref::<LaunchError>() {
        return u8::try_from(e.exit_code()).unwrap_or(1);
    }

    1
}

fn role(role: Role, config: RoleConfig) -> anyhow::Result<()> {
    let env = RuntimeEnv::from_env();
    let transport = env.as_ref().ok().and_then(|env| env.grpc_verbosity);
    logging::init(config.loglevel.into(), transport);
    let env = env?;

    let mut builder = runtime::Builder::new_multi_thread();
    if let Some(threads) = env.inter_op_threads {
        builder.worker_threads(threads.get());
    }
    let rt = builder.enable_all().build()?;

    info!(role = role.as_str(); "starting with {config:?}");
    let summary = rt.block_on(run_role(role, config, env))?;

    info!(
        steps = summary.steps, examples = summary.examples, skipped_blocks = summary.skipped_blocks;
        "{role} done"
    );
    if let Some(loss) = summary.last_loss {
        info!("last loss: {loss}");
    }

    Ok(())
}

fn make_data(config: SynthConfig) -> anyhow::Result<()> {
    logging::init(LevelFilter::Info, None);

    let summary = generate(&config)
        .with_context(|| format!("generating data under {}", config.output.display()))?;
    info!(
        "wrote {} examples to {} and {}",
        summary.examples,
        summary.leader_dir.display(),
        summary.follower_dir.display()
    );

    Ok(())
}

fn launch(args: LaunchArgs) -> anyhow::Result<()> {
    logging::init(LevelFilter::Info, None);

    let mut plan = match &args.plan {
        Some(path) => LaunchPlan::load(path)
            .with_context(|| format!("loading launch plan {}", path.display()))?,
        None => {
            let exe = std::env::current_exe().context("locating this executable")?;
            LaunchPlan::local(exe.display().to_string())
        }
    };

    if let Some(workdir) = args.workdir {
        plan.workdir = workdir;
    }

    let rt = runtime::Builder::new_current_thread().enable_all().build()?;
    let report = rt.block_on(Launcher::new(plan).run())?;
    info!("leader exited with {}", report.leader);
    Ok(())
}

#[cfg(test)]
mod tests {
    use bridge::BridgeError;

    use super::*;

    #[test]
    fn channel_failures_ask_for_a_restart() {
        let e = TrainerError::from(BridgeError::Channel("connection reset".into()));
        assert_eq!(exit_code(&e.into()), 138);

        let e = anyhow::Error::from(TrainerError::from(BridgeError::Channel("eof".into())))
            .context("running the follower");
        assert_eq!(exit_code(&e), 138);
    }

    #[test]
    fn other_trainer_failures_exit_with_one() {
        let e = TrainerError::from(BridgeError::Terminated);
        assert_eq!(exit_code(&e.into()), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("bad flags")), 1);
    }

    #[test]
    fn launch_failures_keep_the_step_status() {
        let failed = |code| LaunchError::StepFailed {
            name: "leader".into(),
            code,
        };

        assert_eq!(exit_code(&failed(Some(2)).into()), 2);
        assert_eq!(exit_code(&failed(Some(138)).into()), 138);
        assert_eq!(exit_code(&failed(None).into()), 1);
        assert_eq!(exit_code(&failed(Some(300)).into()), 1);
        assert_eq!(exit_code(&LaunchError::Interrupted.into()), 130);
    }
}
