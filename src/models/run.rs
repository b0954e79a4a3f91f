use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::{CpuSample, Pid};
use crate::services::scheduler::DEFAULT_WORKERS;

/// How long the reap pool may keep running after the launch workers stop.
pub const DEFAULT_REAP_GRACE: Duration = Duration::from_secs(5);

/// Parameters of one load run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Program path followed by its arguments
    pub command: Vec<String>,
    /// Time between two spawns
    pub tick: Duration,
    /// Total length of the run
    pub duration: Duration,
    /// Observed processes
    pub pids: BTreeSet<Pid>,
    /// Size of the launch pool and of the reap pool
    pub workers: usize,
    /// Mark children so a re-invoked loadgen binary exits immediately
    pub self_spawn: bool,
    pub reap_grace: Duration,
}

impl RunConfig {
    pub fn new(
        command: Vec<String>,
        tick: Duration,
        duration: Duration,
        pids: impl IntoIterator<Item = Pid>,
    ) -> Self {
        Self {
            command,
            tick,
            duration,
            pids: pids.into_iter().collect(),
            workers: DEFAULT_WORKERS,
            self_spawn: false,
            reap_grace: DEFAULT_REAP_GRACE,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.first().map_or(true, |program| program.is_empty()) {
            return Err(ConfigError::EmptyCommand);
        }
        if self.pids.is_empty() {
            return Err(ConfigError::NoPids);
        }
        if self.tick.is_zero() {
            return Err(ConfigError::ZeroDelay);
        }
        if self.tick > self.duration / 10 {
            return Err(ConfigError::DelayTooLarge {
                delay: self.tick,
                duration: self.duration,
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }

    /// Number of spawns the run would produce if every tick was served.
    pub fn intended_ticks(&self) -> f64 {
        self.duration.as_secs_f64() / self.tick.as_secs_f64()
    }
}

/// Converts a user-supplied number of seconds into a [`Duration`].
pub fn parse_seconds(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidSeconds { name, value })
}

/// CPU consumed by one observed process over a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PidUsage {
    pub pid: Pid,
    pub name: String,
    /// User seconds consumed during the run
    pub user: f64,
    /// System seconds consumed during the run
    pub system: f64,
    pub user_percent: f64,
    pub system_percent: f64,
}

impl PidUsage {
    pub fn from_samples(
        pid: Pid,
        name: String,
        before: &CpuSample,
        after: &CpuSample,
        duration: Duration,
    ) -> Self {
        let delta = after.since(before);
        let secs = duration.as_secs_f64();

        Self {
            pid,
            name,
            user: delta.user,
            system: delta.system,
            user_percent: 100.0 * delta.user / secs,
            system_percent: 100.0 * delta.system / secs,
        }
    }

    pub fn total(&self) -> f64 {
        self.user + self.system
    }

    pub fn total_percent(&self) -> f64 {
        self.user_percent + self.system_percent
    }
}

/// Cross-PID totals of a run.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct UsageTotals {
    pub user: f64,
    pub system: f64,
    pub user_percent: f64,
    pub system_percent: f64,
}

impl UsageTotals {
    pub fn total(&self) -> f64 {
        self.user + self.system
    }

    pub fn total_percent(&self) -> f64 {
        self.user_percent + self.system_percent
    }
}

/// Outcome of one measurement run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Unix timestamp taken when the run finished
    pub timestamp: u64,
    #[serde(rename = "duration_secs", serialize_with = "serialize_secs")]
    pub duration: Duration,
    pub intended_ticks: f64,
    pub spawn_count: u64,
    /// Ticks discarded because every launch worker was busy
    pub dropped_ticks: u64,
    pub usages: Vec<PidUsage>,
}

impl RunResult {
    /// Sum over all observed processes, only when more than one was observed.
    pub fn sum(&self) -> Option<UsageTotals> {
        if self.usages.len() < 2 {
            return None;
        }

        Some(
            self.usages
                .iter()
                .fold(UsageTotals::default(), |acc, usage| UsageTotals {
                    user: acc.user + usage.user,
                    system: acc.system + usage.system,
                    user_percent: acc.user_percent + usage.user_percent,
                    system_percent: acc.system_percent + usage.system_percent,
                }),
        )
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
