//! In-memory sampler for tests.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::SampleError;
use crate::models::{CpuSample, Pid};
use crate::services::sampler::Sampler;

/// Serves scripted samples. Each PID walks through its list of samples, one per call,
/// and keeps returning the last one when the list runs out.
#[derive(Debug, Default)]
pub struct FakeSampler {
    processes: HashMap<Pid, (String, Vec<CpuSample>)>,
    /// PID to number of successful samples before the process counts as gone
    failures: HashMap<Pid, usize>,
    served: Mutex<HashMap<Pid, usize>>,
}

impl FakeSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process(self, pid: Pid, name: &str, sample: CpuSample) -> Self {
        self.with_samples(pid, name, vec![sample])
    }

    pub fn with_samples(mut self, pid: Pid, name: &str, samples: Vec<CpuSample>) -> Self {
        assert!(!samples.is_empty(), "fake process {} needs a sample", pid);
        self.processes.insert(pid, (name.to_string(), samples));
        self
    }

    /// Lets `pid` vanish after `samples` successful reads; its name stays resolvable.
    pub fn with_failure_after(mut self, pid: Pid, samples: usize) -> Self {
        self.failures.insert(pid, samples);
        self
    }

    /// Number of `sample` calls served so far, over all PIDs.
    pub fn calls(&self) -> usize {
        self.served.lock().unwrap().values().sum()
    }

    fn missing(pid: Pid) -> SampleError {
        SampleError::Read {
            path: PathBuf::from(format!("fake/{}", pid)),
            source: io::Error::from(io::ErrorKind::NotFound),
        }
    }
}

impl Sampler for FakeSampler {
    fn sample(&self, pid: Pid) -> Result<CpuSample, SampleError> {
        let (_, samples) = self.processes.get(&pid).ok_or_else(|| Self::missing(pid))?;

        let mut served = self.served.lock().unwrap();
        let index = served.entry(pid).or_insert(0);
        let call = *index;
        *index += 1;

        if self.failures.get(&pid).is_some_and(|limit| call >= *limit) {
            return Err(Self::missing(pid));
        }
        Ok(samples[call.min(samples.len() - 1)])
    }

    fn name(&self, pid: Pid) -> Result<String, SampleError> {
        self.processes
            .get(&pid)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| Self::missing(pid))
    }
}
