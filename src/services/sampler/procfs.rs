//! Tick-based CPU accounting read from the proc filesystem, see proc(5).

use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::error::SampleError;
use crate::models::{CpuSample, Pid};
use crate::services::sampler::Sampler;

/// USER_HZ on every mainstream Linux configuration.
const FALLBACK_CLOCK_TICKS: u64 = 100;

// Positions in /proc/[pid]/stat, 1-based as documented in proc(5). Counting restarts
// after the `comm` field because it may itself contain spaces and parentheses.
const FIELD_STATE: usize = 3;
const FIELD_UTIME: usize = 14;
const FIELD_STIME: usize = 15;

static CLOCK_TICKS: OnceLock<u64> = OnceLock::new();

/// Scheduler clock ticks per second, queried once per process.
pub fn clock_ticks() -> u64 {
    *CLOCK_TICKS.get_or_init(|| {
        // SAFETY: sysconf has no preconditions, it only reads a system setting.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            ticks as u64
        } else {
            log::warn!("sysconf(_SC_CLK_TCK) failed, assuming {}", FALLBACK_CLOCK_TICKS);
            FALLBACK_CLOCK_TICKS
        }
    })
}

#[derive(Debug, Clone)]
pub struct ProcfsSampler {
    root: PathBuf,
    clock_ticks: u64,
}

impl ProcfsSampler {
    pub fn new() -> Self {
        Self::with_root("/proc", clock_ticks())
    }

    /// Reads process records below `root` instead of `/proc`.
    pub fn with_root(root: impl Into<PathBuf>, clock_ticks: u64) -> Self {
        Self {
            root: root.into(),
            clock_ticks,
        }
    }

    fn read(&self, pid: Pid, record: &str) -> Result<Vec<u8>, SampleError> {
        let path = self.root.join(pid.to_string()).join(record);
        fs::read(&path).map_err(|source| SampleError::Read { path, source })
    }
}

impl Default for ProcfsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for ProcfsSampler {
    fn sample(&self, pid: Pid) -> Result<CpuSample, SampleError> {
        let stat = self.read(pid, "stat")?;
        parse_stat(pid, &String::from_utf8_lossy(&stat), self.clock_ticks)
    }

    fn name(&self, pid: Pid) -> Result<String, SampleError> {
        let cmdline = self.read(pid, "cmdline")?;
        let name = String::from_utf8_lossy(&cmdline).replace('\0', " ");
        let name = name.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }

        // kernel threads have no argument list
        let comm = self.read(pid, "comm")?;
        Ok(format!("[{}]", String::from_utf8_lossy(&comm).trim()))
    }
}

fn parse_stat(pid: Pid, stat: &str, clock_ticks: u64) -> Result<CpuSample, SampleError> {
    let malformed = |reason: String| SampleError::Malformed { pid, reason };

    let after_comm = stat
        .rfind(')')
        .map(|end| &stat[end + 1..])
        .ok_or_else(|| malformed("no process name".to_string()))?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();

    let field = |position: usize, label: &str| -> Result<u64, SampleError> {
        let raw = fields
            .get(position - FIELD_STATE)
            .ok_or_else(|| malformed(format!("{} fields, {} missing", fields.len() + 2, label)))?;
        raw.parse::<u64>()
            .map_err(|e| malformed(format!("{} {:?}: {}", label, raw, e)))
    };

    let utime = field(FIELD_UTIME, "utime")?;
    let stime = field(FIELD_STIME, "stime")?;

    Ok(CpuSample::new(
        utime as f64 / clock_ticks as f64,
        stime as f64 / clock_ticks as f64,
    ))
}
