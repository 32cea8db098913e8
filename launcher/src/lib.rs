mod affinity;
mod error;
mod plan;
mod process;
mod run;

pub use affinity::CpuSet;
pub use error::{LaunchError, Result};
pub use plan::{CommandSpec, LaunchPlan};
pub use run::{LaunchReport, Launcher};
