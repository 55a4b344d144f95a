//! Cron-driven background jobs: baseline learning, model retraining and
//! periodic analysis sweeps.

pub mod cron;
pub mod engine;

use serde::Serialize;

pub use self::cron::Scheduler;
pub use self::engine::{run_scheduler_loop, run_sweep, SweepReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    Learning,
    Retrain,
    Sweep,
}

impl Job {
    pub fn as_str(self) -> &'static str {
        match self {
            Job::Learning => "learning",
            Job::Retrain => "retrain",
            Job::Sweep => "sweep",
        }
    }
}
