use std::{io, process::ExitStatus};

use log::{info, warn};
use tokio::{fs, signal};

use crate::{LaunchError, LaunchPlan, Result, process::Running};

/// The exit statuses of a completed job.
#[derive(Debug)]
pub struct LaunchReport {
    pub leader: ExitStatus,
    pub background: Vec<(String, ExitStatus)>,
}

/// Runs the processes of a `LaunchPlan` in order.
///
/// Any failing step aborts the job, killing the background processes still
/// running.
pub struct Launcher {
    plan: LaunchPlan,
}

impl Launcher {
    pub fn new(plan: LaunchPlan) -> Self {
        Self { plan }
    }

    /// Resets the directories, prepares the data, starts the parameter servers
    /// and the follower in the background and runs the leader to completion.
    ///
    /// # Returns
    /// The exit statuses of every process.
    ///
    /// # Errors
    /// Fails on the first process which can't be started or exits
    /// unsuccessfully, or when interrupted.
    pub async fn run(&self) -> Result<LaunchReport> {
        self.reset_dirs().await?;

        if let Some(data) = &self.plan.data {
            let mut step = Running::spawn("data", &self.plan, data)?;
            let status = interruptible(step.wait()).await?;
            step.check(status)?;
        }

        let mut background = Vec::with_capacity(self.plan.parameter_servers.len() + 1);
        let res = self.run_roles(&mut background).await;

        if res.is_err() {
            for process in &mut background {
                process.kill().await;
            }
        }

        let report = res?;
        self.reset_dirs().await?;
        info!("job finished");
        Ok(report)
    }

    async fn run_roles(&self, background: &mut Vec<Running>) -> Result<LaunchReport> {
        for (i, ps) in self.plan.parameter_servers.iter().enumerate() {
            background.push(Running::spawn(&format!("ps-{i}"), &self.plan, ps)?);
        }
        background.push(Running::spawn("follower", &self.plan, &self.plan.follower)?);

        let mut leader = Running::spawn("leader", &self.plan, &self.plan.leader)?;
        let waited = interruptible(leader.wait()).await;
        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                leader.kill().await;
                return Err(e);
            }
        };
        let leader = leader.check(status)?;

        let mut statuses = Vec::with_capacity(background.len());
        for process in background.iter_mut() {
            let status = interruptible(process.wait()).await?;
            statuses.push((process.name.clone(), process.check(status)?));
        }

        Ok(LaunchReport {
            leader,
            background: statuses,
        })
    }

    async fn reset_dirs(&self) -> Result<()> {
        for dir in &self.plan.reset_dirs {
            let path = self.plan.workdir.join(dir);
            info!("+ rm -rf {}", path.display());

            match fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}

/// Awaits `fut` unless the process receives ctrl-c first.
async fn interruptible<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        res = fut => res,
        res = signal::ctrl_c() => {
            res?;
            warn!("interrupted, stopping the job");
            Err(LaunchError::Interrupted)
        }
    }
}
