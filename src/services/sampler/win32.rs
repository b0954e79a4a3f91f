//! Handle-based CPU accounting through the Win32 process query API.

use windows::core::PWSTR;
use windows::Win32::Foundation::{CloseHandle, FILETIME, HANDLE};
use windows::Win32::System::Threading::{
    GetProcessTimes, OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
    PROCESS_QUERY_LIMITED_INFORMATION,
};

use crate::error::SampleError;
use crate::models::{CpuSample, Pid};
use crate::services::sampler::Sampler;

/// FILETIME counts 100-nanosecond intervals.
const FILETIME_TICKS_PER_SECOND: f64 = 10_000_000.0;

const MAX_IMAGE_PATH: usize = 32_768;

/// Query handle to a process, closed when dropped.
#[derive(Debug)]
struct ProcessHandle {
    handle: HANDLE,
}

impl ProcessHandle {
    fn open(pid: Pid) -> Result<Self, SampleError> {
        // SAFETY: No safety requirements, a failed open returns an error instead of a handle.
        let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) }
            .map_err(|e| SampleError::OpenProcess {
                pid,
                message: e.to_string(),
            })?;
        Ok(Self { handle })
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // SAFETY: The handle came from OpenProcess and is closed exactly once, here.
        if let Err(e) = unsafe { CloseHandle(self.handle) } {
            log::debug!("CloseHandle failed: {}", e);
        }
    }
}

fn filetime_seconds(time: &FILETIME) -> f64 {
    let ticks = (u64::from(time.dwHighDateTime) << 32) | u64::from(time.dwLowDateTime);
    ticks as f64 / FILETIME_TICKS_PER_SECOND
}

#[derive(Debug, Clone, Default)]
pub struct WindowsSampler;

impl WindowsSampler {
    pub fn new() -> Self {
        Self
    }
}

impl Sampler for WindowsSampler {
    fn sample(&self, pid: Pid) -> Result<CpuSample, SampleError> {
        let process = ProcessHandle::open(pid)?;

        let mut creation = FILETIME::default();
        let mut exit = FILETIME::default();
        let mut kernel = FILETIME::default();
        let mut user = FILETIME::default();

        // SAFETY: All out-pointers reference live locals and the handle is open.
        unsafe {
            GetProcessTimes(
                process.handle,
                &mut creation,
                &mut exit,
                &mut kernel,
                &mut user,
            )
        }
        .map_err(|e| SampleError::ProcessTimes {
            pid,
            message: e.to_string(),
        })?;

        Ok(CpuSample::new(
            filetime_seconds(&user),
            filetime_seconds(&kernel),
        ))
    }

    fn name(&self, pid: Pid) -> Result<String, SampleError> {
        let process = ProcessHandle::open(pid)?;

        let mut buffer = vec![0u16; MAX_IMAGE_PATH];
        let mut len = buffer.len() as u32;

        // SAFETY: `len` holds the buffer capacity in characters and is updated to the
        // written length on success.
        unsafe {
            QueryFullProcessImageNameW(
                process.handle,
                PROCESS_NAME_WIN32,
                PWSTR(buffer.as_mut_ptr()),
                &mut len,
            )
        }
        .map_err(|e| SampleError::Name {
            pid,
            message: e.to_string(),
        })?;

        buffer.truncate(len as usize);
        Ok(String::from_utf16_lossy(&buffer))
    }
}
