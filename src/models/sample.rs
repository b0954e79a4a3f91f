use serde::Serialize;

/// OS process identifier of an observed process.
pub type Pid = u32;

/// Cumulative CPU time a process has consumed since it started.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CpuSample {
    /// User-mode CPU time in seconds
    pub user: f64,
    /// Kernel-mode CPU time in seconds
    pub system: f64,
}

impl CpuSample {
    pub fn new(user: f64, system: f64) -> Self {
        Self { user, system }
    }

    /// CPU time consumed between `before` and this sample.
    pub fn since(&self, before: &CpuSample) -> CpuSample {
        CpuSample {
            user: self.user - before.user,
            system: self.system - before.system,
        }
    }

    pub fn total(&self) -> f64 {
        self.user + self.system
    }
}
