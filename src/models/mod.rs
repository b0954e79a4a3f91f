pub mod run;
pub mod sample;

pub use run::{parse_seconds, PidUsage, RunConfig, RunResult};
pub use sample::{CpuSample, Pid};
