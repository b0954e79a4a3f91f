use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::Pid;

/// Rejected run configuration. Always reported before any process is spawned.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no command specified")]
    EmptyCommand,

    #[error("no PIDs specified")]
    NoPids,

    #[error("delay cannot be 0")]
    ZeroDelay,

    #[error("{name} must be a finite, non-negative number of seconds (got {value})")]
    InvalidSeconds { name: &'static str, value: f64 },

    #[error("delay must be much smaller than duration (delay {delay:?} > duration {duration:?} / 10)")]
    DelayTooLarge { delay: Duration, duration: Duration },

    #[error("worker count must be at least 1")]
    NoWorkers,
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("could not read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[cfg(target_os = "linux")]
    #[error("wrong data in stat for PID {pid}: {reason}")]
    Malformed { pid: Pid, reason: String },

    #[cfg(windows)]
    #[error("OpenProcess: {pid}: {message}")]
    OpenProcess { pid: Pid, message: String },

    #[cfg(windows)]
    #[error("GetProcessTimes: {pid}: {message}")]
    ProcessTimes { pid: Pid, message: String },

    #[cfg(windows)]
    #[error("process name unavailable for {pid}: {message}")]
    Name { pid: Pid, message: String },
}

#[derive(Debug, Error)]
#[error("exec {program}")]
pub struct LaunchError {
    pub program: String,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("could not open report file {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("write report")]
    Write(#[from] io::Error),
}

/// Everything that can end a run early.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("read stats")]
    Sample(#[from] SampleError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}
