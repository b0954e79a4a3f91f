use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time;

use crate::error::RunError;
use crate::models::{PidUsage, RunConfig, RunResult};
use crate::services::reaper::ReapPool;
use crate::services::sampler::{Sampler, UNKNOWN_NAME};
use crate::services::scheduler::{SchedulerConfig, SpawnScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    SamplingBefore,
    Running,
    SamplingAfter,
    Reporting,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::SamplingBefore => "sampling(before)",
            RunPhase::Running => "running",
            RunPhase::SamplingAfter => "sampling(after)",
            RunPhase::Reporting => "reporting",
            RunPhase::Done => "done",
        };
        f.write_str(name)
    }
}

fn advance(phase: &mut RunPhase, next: RunPhase) {
    log::debug!("run phase: {} -> {}", phase, next);
    *phase = next;
}

/// Drives one measurement run: CPU snapshot of the observed PIDs, spawn load for the
/// configured duration, second snapshot, deltas.
pub struct RunController<S> {
    config: RunConfig,
    sampler: S,
    spawned: Arc<AtomicU64>,
}

impl<S: Sampler> RunController<S> {
    pub fn new(config: RunConfig, sampler: S) -> Self {
        Self {
            config,
            sampler,
            spawned: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Children launched so far. Only a lower bound while a run is in progress.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub async fn run(&self) -> Result<RunResult, RunError> {
        let config = &self.config;
        let mut phase = RunPhase::Idle;

        config.validate()?;
        let mut names = self.sampler.resolve_names(&config.pids);

        advance(&mut phase, RunPhase::SamplingBefore);
        let before = self.sampler.sample_all(&config.pids)?;

        advance(&mut phase, RunPhase::Running);
        let scheduler = SpawnScheduler::new(SchedulerConfig::from(config), Arc::clone(&self.spawned));
        let (mut running, handoff) = scheduler.start();
        let reapers = ReapPool::start(handoff, config.workers);
        log::info!(
            "exec '{}', every {:.04} seconds, duration: {:.04} seconds",
            config.command.join(" "),
            config.tick.as_secs_f64(),
            config.duration.as_secs_f64()
        );

        tokio::select! {
            _ = time::sleep(config.duration) => {}
            Some(err) = running.fatal_error() => {
                running.stop();
                return Err(err.into());
            }
        }

        advance(&mut phase, RunPhase::SamplingAfter);
        running.stop();
        let after = self.sampler.sample_all(&config.pids)?;

        advance(&mut phase, RunPhase::Reporting);
        let ticks = running.join().await?;
        let reaped = reapers.reaped_counter();
        if reapers.join(config.reap_grace).await {
            log::debug!("{} children reaped", reaped.load(Ordering::Relaxed));
        }
        if ticks.dropped > 0 {
            log::warn!("{} of {} ticks dropped, all launch workers busy", ticks.dropped, ticks.issued);
        }

        let usages = before
            .iter()
            .filter_map(|(&pid, before)| {
                let after = after.get(&pid)?;
                let name = names.remove(&pid).unwrap_or_else(|| UNKNOWN_NAME.to_string());
                Some(PidUsage::from_samples(pid, name, before, after, config.duration))
            })
            .collect();

        let result = RunResult {
            timestamp: unix_now(),
            duration: config.duration,
            intended_ticks: config.intended_ticks(),
            spawn_count: self.spawn_count(),
            dropped_ticks: ticks.dropped,
            usages,
        };

        advance(&mut phase, RunPhase::Done);
        Ok(result)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::{ConfigError, SampleError};
    use crate::models::CpuSample;
    use crate::services::sampler::fake::FakeSampler;
    use std::time::Duration;

    fn config(command: &str, tick_ms: u64, duration_ms: u64, pids: &[u32]) -> RunConfig {
        let mut config = RunConfig::new(
            vec![command.to_string()],
            Duration::from_millis(tick_ms),
            Duration::from_millis(duration_ms),
            pids.iter().copied(),
        );
        config.workers = 4;
        config
    }

    #[tokio::test]
    async fn test_zero_delay_rejected_before_sampling() {
        let sampler = FakeSampler::new().with_process(1, "agent", CpuSample::default());
        let controller = RunController::new(config("/bin/true", 0, 1000, &[1]), sampler);

        let err = controller.run().await.unwrap_err();
        assert!(matches!(err, RunError::Config(ConfigError::ZeroDelay)));
        assert_eq!(controller.spawn_count(), 0);
        assert_eq!(controller.sampler.calls(), 0);
    }

    #[tokio::test]
    async fn test_delay_too_large_rejected() {
        let sampler = FakeSampler::new().with_process(1, "agent", CpuSample::default());
        let controller = RunController::new(config("/bin/true", 200, 1000, &[1]), sampler);

        let err = controller.run().await.unwrap_err();
        assert!(matches!(err, RunError::Config(ConfigError::DelayTooLarge { .. })));
        assert_eq!(controller.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_pid_aborts_before_spawning() {
        let sampler = FakeSampler::new().with_process(1, "agent", CpuSample::default());
        let controller = RunController::new(config("/bin/true", 10, 1000, &[1, 424242]), sampler);

        let err = controller.run().await.unwrap_err();
        assert!(matches!(err, RunError::Sample(_)));
        assert_eq!(controller.spawn_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_launch_failure_aborts_run() {
        let sampler = FakeSampler::new().with_process(1, "agent", CpuSample::default());
        let controller = RunController::new(
            config("/nonexistent/edr-loadgen-missing", 10, 10_000, &[1]),
            sampler,
        );

        let started = std::time::Instant::now();
        let err = controller.run().await.unwrap_err();

        assert!(matches!(err, RunError::Launch(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_process_gone_after_run_fails_with_sample_error() {
        let sampler = FakeSampler::new()
            .with_process(1, "agent", CpuSample::new(1.0, 1.0))
            .with_failure_after(1, 1);
        let controller = RunController::new(config("/bin/true", 20, 300, &[1]), sampler);

        let err = controller.run().await.unwrap_err();

        assert!(matches!(err, RunError::Sample(SampleError::Read { .. })));
        assert!(controller.spawn_count() > 0);
        assert_eq!(controller.sampler.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_pids_with_sum() {
        let sampler = FakeSampler::new()
            .with_samples(10, "agent", vec![CpuSample::new(1.0, 1.0), CpuSample::new(1.25, 1.5)])
            .with_samples(20, "sensor", vec![CpuSample::new(0.0, 0.0), CpuSample::new(0.5, 0.25)]);
        let controller = RunController::new(config("/bin/true", 50, 1000, &[20, 10]), sampler);

        let result = controller.run().await.unwrap();

        assert_eq!(result.usages.len(), 2);
        let agent = &result.usages[0];
        assert_eq!((agent.pid, agent.name.as_str()), (10, "agent"));
        assert_eq!((agent.user, agent.system), (0.25, 0.5));
        assert_eq!((agent.user_percent, agent.system_percent), (25.0, 50.0));

        let sensor = &result.usages[1];
        assert_eq!((sensor.pid, sensor.name.as_str()), (20, "sensor"));

        let sum = result.sum().unwrap();
        assert_eq!(sum.total(), agent.total() + sensor.total());
        assert_eq!(sum.total_percent(), agent.total_percent() + sensor.total_percent());
        assert_eq!(result.intended_ticks, 20.0);
        assert_eq!(result.spawn_count, controller.spawn_count());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end_against_own_process() {
        use crate::services::sampler::PlatformSampler;

        let pid = std::process::id();
        let controller = RunController::new(config("/bin/true", 100, 1000, &[pid]), PlatformSampler::new());

        let result = controller.run().await.unwrap();

        assert!(result.spawn_count >= 1);
        assert!(result.spawn_count <= 11);
        assert_eq!(result.usages.len(), 1);
        assert_eq!(result.usages[0].pid, pid);
        assert!(result.usages[0].total() >= 0.0);
        assert!(result.sum().is_none());
    }
}
