use clap::Parser;
use std::env;
use std::path::PathBuf;

use crate::models::{parse_seconds, Pid, RunConfig};
use crate::services::scheduler::DEFAULT_WORKERS;

/// EDR loadgen - spawns child processes at a fixed rate and measures the CPU cost of observer processes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CommandArgs {
    /// Command to run
    #[arg(short, long, env = "LOADGEN_COMMAND", default_value = "/bin/true")]
    pub command: String,

    /// Argument passed to the command, repeatable
    #[arg(short = 'a', long = "arg", allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Re-invoke this binary instead of --command; the children exit immediately
    #[arg(long, env = "LOADGEN_SELF_SPAWN")]
    pub self_spawn: bool,

    /// Delay between execs (in seconds)
    #[arg(short, long, env = "LOADGEN_DELAY", default_value_t = 0.1)]
    pub delay: f64,

    /// Total duration (in seconds)
    #[arg(short = 't', long, env = "LOADGEN_DURATION", default_value_t = 60.0)]
    pub duration: f64,

    /// Report file (CSV, appended to)
    #[arg(short, long, env = "LOADGEN_REPORT")]
    pub report: Option<PathBuf>,

    /// Concurrent launch workers, also used for the reap pool
    #[arg(short, long, env = "LOADGEN_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// How long to wait for children to be reaped after the run (in seconds)
    #[arg(long, default_value_t = 5.0)]
    pub reap_grace: f64,

    /// Print the run result as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// PIDs whose CPU usage is measured
    pub pids: Vec<Pid>,
}

impl CommandArgs {
    pub fn run_config(&self) -> anyhow::Result<RunConfig> {
        let command = if self.self_spawn {
            vec![env::current_exe()?.to_string_lossy().into_owned()]
        } else {
            let mut command = vec![self.command.clone()];
            command.extend(self.args.iter().cloned());
            command
        };

        let mut config = RunConfig::new(
            command,
            parse_seconds("delay", self.delay)?,
            parse_seconds("duration", self.duration)?,
            self.pids.iter().copied(),
        );
        config.workers = self.workers;
        config.self_spawn = self.self_spawn;
        config.reap_grace = parse_seconds("reap-grace", self.reap_grace)?;
        Ok(config)
    }
}
