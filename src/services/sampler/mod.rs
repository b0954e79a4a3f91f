//! CPU accounting for observed processes.
//!
//! Each platform reads per-process CPU time its own way. The run controller only sees the
//! [`Sampler`] trait; [`PlatformSampler`] picks the implementation for the build target.

#[cfg(test)]
pub mod fake;
#[cfg(target_os = "linux")]
pub mod procfs;
#[cfg(windows)]
pub mod win32;

use std::collections::BTreeMap;

use crate::error::SampleError;
use crate::models::{CpuSample, Pid};

/// Placeholder name for processes whose name could not be resolved.
pub const UNKNOWN_NAME: &str = "<unknown>";

#[cfg(target_os = "linux")]
pub type PlatformSampler = procfs::ProcfsSampler;
#[cfg(windows)]
pub type PlatformSampler = win32::WindowsSampler;

#[cfg(not(any(target_os = "linux", windows)))]
compile_error!("CPU sampling is only implemented for Linux and Windows");

pub trait Sampler: Send + Sync {
    /// Cumulative CPU time of `pid` at this instant.
    fn sample(&self, pid: Pid) -> Result<CpuSample, SampleError>;

    /// Human readable name of `pid`.
    fn name(&self, pid: Pid) -> Result<String, SampleError>;

    /// Samples every PID in order. The first failure aborts the whole pass, a partial
    /// snapshot cannot be compared against another one.
    fn sample_all<'a, I>(&self, pids: I) -> Result<BTreeMap<Pid, CpuSample>, SampleError>
    where
        I: IntoIterator<Item = &'a Pid>,
        Self: Sized,
    {
        pids.into_iter()
            .map(|&pid| self.sample(pid).map(|sample| (pid, sample)))
            .collect()
    }

    /// Resolves names without ever failing; unresolvable PIDs get [`UNKNOWN_NAME`].
    fn resolve_names<'a, I>(&self, pids: I) -> BTreeMap<Pid, String>
    where
        I: IntoIterator<Item = &'a Pid>,
        Self: Sized,
    {
        pids.into_iter()
            .map(|&pid| {
                let name = self.name(pid).unwrap_or_else(|e| {
                    log::warn!("could not get name for {}: {}", pid, e);
                    UNKNOWN_NAME.to_string()
                });
                (pid, name)
            })
            .collect()
    }
}
