use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::error::LaunchError;
use crate::models::RunConfig;

/// Default size of the launch pool and of the reap pool.
pub const DEFAULT_WORKERS: usize = 32;

/// Child handles that may wait for the reap pool before launching blocks.
pub const DEFAULT_HANDOFF_CAPACITY: usize = 100_000;

/// Set on every child in self-spawn mode; the binary exits right away when it sees it.
pub const CHILD_ENV_VAR: &str = "EDR_LOADGEN_CHILD";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub command: Vec<String>,
    pub tick: Duration,
    pub workers: usize,
    pub handoff_capacity: usize,
    pub self_spawn: bool,
}

impl From<&RunConfig> for SchedulerConfig {
    fn from(config: &RunConfig) -> Self {
        Self {
            command: config.command.clone(),
            tick: config.tick,
            workers: config.workers,
            handoff_capacity: DEFAULT_HANDOFF_CAPACITY,
            self_spawn: config.self_spawn,
        }
    }
}

/// Starts one child for a tick. Called on the blocking pool.
pub type Launcher = fn(&[String], bool) -> Result<Child, LaunchError>;

/// Tick accounting of a stopped scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickStats {
    pub issued: u64,
    /// Ticks that found every launch worker busy
    pub dropped: u64,
}

/// Launches the configured command once per tick.
///
/// A single ticker task feeds a pool of launch workers so that slow fork/exec calls never
/// hold back the clock. Every launched child is counted and handed to the reap pool.
pub struct SpawnScheduler {
    config: SchedulerConfig,
    counter: Arc<AtomicU64>,
    launcher: Launcher,
}

impl SpawnScheduler {
    pub fn new(config: SchedulerConfig, counter: Arc<AtomicU64>) -> Self {
        Self {
            config,
            counter,
            launcher: launch,
        }
    }

    #[cfg(test)]
    fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Starts ticking. Returns the running scheduler and the receiving end of the child
    /// handoff channel, which belongs to the reap pool.
    pub fn start(self) -> (RunningScheduler, mpsc::Receiver<Child>) {
        let SchedulerConfig {
            command,
            tick,
            workers,
            handoff_capacity,
            self_spawn,
        } = self.config;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let (handoff_tx, handoff_rx) = mpsc::channel(handoff_capacity);
        let (fatal_tx, fatal_rx) = mpsc::channel(1);

        let ticker = tokio::spawn(run_ticker(tick, tick_tx, stop_rx));

        let ticks = Arc::new(Mutex::new(tick_rx));
        let command: Arc<[String]> = command.into();
        let workers = (0..workers)
            .map(|id| {
                let worker = LaunchWorker {
                    id,
                    ticks: Arc::clone(&ticks),
                    command: Arc::clone(&command),
                    self_spawn,
                    launcher: self.launcher,
                    counter: Arc::clone(&self.counter),
                    handoff: handoff_tx.clone(),
                    fatal: fatal_tx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        let running = RunningScheduler {
            stop: Some(stop_tx),
            ticker,
            workers,
            fatal: fatal_rx,
        };
        (running, handoff_rx)
    }
}

pub struct RunningScheduler {
    stop: Option<oneshot::Sender<()>>,
    ticker: JoinHandle<TickStats>,
    workers: Vec<JoinHandle<()>>,
    fatal: mpsc::Receiver<LaunchError>,
}

impl RunningScheduler {
    /// Resolves with the first launch failure. Resolves with `None` once every launch
    /// worker has exited without one.
    pub async fn fatal_error(&mut self) -> Option<LaunchError> {
        self.fatal.recv().await
    }

    /// Stops the tick source. Launches already in flight still complete.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            // the ticker may already be gone after a closed tick channel
            let _ = stop.send(());
        }
    }

    /// Stops ticking and waits for every launch worker to drain, so the spawn counter is
    /// final afterwards. A launch failure that happened meanwhile is returned as error.
    pub async fn join(mut self) -> Result<TickStats, LaunchError> {
        self.stop();

        let stats = match self.ticker.await {
            Ok(stats) => stats,
            Err(e) => {
                log::error!("ticker task failed: {}", e);
                TickStats::default()
            }
        };
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                log::error!("launch worker failed: {}", e);
            }
        }

        match self.fatal.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(stats),
        }
    }
}

async fn run_ticker(
    period: Duration,
    ticks: mpsc::Sender<Instant>,
    mut stop: oneshot::Receiver<()>,
) -> TickStats {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut stats = TickStats::default();
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            at = interval.tick() => {
                stats.issued += 1;
                match ticks.try_send(at) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => stats.dropped += 1,
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }
    }

    log::debug!("ticker stopped: {} ticks, {} dropped", stats.issued, stats.dropped);
    stats
}

struct LaunchWorker {
    id: usize,
    ticks: Arc<Mutex<mpsc::Receiver<Instant>>>,
    command: Arc<[String]>,
    self_spawn: bool,
    launcher: Launcher,
    counter: Arc<AtomicU64>,
    handoff: mpsc::Sender<Child>,
    fatal: mpsc::Sender<LaunchError>,
}

impl LaunchWorker {
    async fn run(self) {
        loop {
            let tick = self.ticks.lock().await.recv().await;
            if tick.is_none() {
                break;
            }

            // fork/exec blocks, so it stays off the runtime threads
            let command = Arc::clone(&self.command);
            let (launcher, self_spawn) = (self.launcher, self.self_spawn);
            let launched = task::spawn_blocking(move || launcher(&command, self_spawn)).await;

            let child = match launched {
                Ok(Ok(child)) => child,
                Ok(Err(e)) => {
                    log::error!("{}", e);
                    let _ = self.fatal.try_send(e);
                    break;
                }
                Err(e) => {
                    log::error!("launch worker {}: launch task failed: {}", self.id, e);
                    break;
                }
            };
            self.counter.fetch_add(1, Ordering::Relaxed);

            if self.handoff.send(child).await.is_err() {
                log::warn!("launch worker {}: reap pool is gone, child left unreaped", self.id);
            }
        }
        log::trace!("launch worker {} finished", self.id);
    }
}

/// Starts one child with detached standard streams.
pub fn launch(command: &[String], self_spawn: bool) -> Result<Child, LaunchError> {
    let Some((program, args)) = command.split_first() else {
        return Err(LaunchError {
            program: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
        });
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if self_spawn {
        cmd.env(CHILD_ENV_VAR, "1");
    }

    cmd.spawn().map_err(|source| LaunchError {
        program: program.clone(),
        source,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::services::reaper::ReapPool;

    fn command(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn config(parts: &[&str], tick: Duration) -> SchedulerConfig {
        SchedulerConfig {
            command: command(parts),
            tick,
            workers: 4,
            handoff_capacity: 1024,
            self_spawn: false,
        }
    }

    #[tokio::test]
    async fn test_launch_missing_program_fails() {
        let err = launch(&command(&["/nonexistent/edr-loadgen-missing"]), false).unwrap_err();
        assert_eq!(err.program, "/nonexistent/edr-loadgen-missing");
        assert!(launch(&[], false).is_err());
    }

    #[tokio::test]
    async fn test_self_spawn_sets_child_marker() {
        let script = command(&["/bin/sh", "-c", "test \"$EDR_LOADGEN_CHILD\" = 1"]);

        let status = launch(&script, true).unwrap().wait().await.unwrap();
        assert!(status.success());

        let status = launch(&script, false).unwrap().wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_counter_matches_served_ticks() {
        let counter = Arc::new(AtomicU64::new(0));
        let scheduler =
            SpawnScheduler::new(config(&["/bin/true"], Duration::from_millis(20)), Arc::clone(&counter));

        let (running, handoff) = scheduler.start();
        let reapers = ReapPool::start(handoff, 4);

        time::sleep(Duration::from_millis(300)).await;
        let stats = running.join().await.unwrap();
        let spawned = counter.load(Ordering::Relaxed);

        assert!(stats.issued > 0);
        assert!(stats.issued <= 16);
        assert_eq!(spawned, stats.issued - stats.dropped);

        let reaped = reapers.reaped_counter();
        assert!(reapers.join(Duration::from_secs(5)).await);
        assert_eq!(reaped.load(Ordering::Relaxed), spawned);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_launch_failure_is_reported() {
        let counter = Arc::new(AtomicU64::new(0));
        let scheduler = SpawnScheduler::new(
            config(&["/nonexistent/edr-loadgen-missing"], Duration::from_millis(10)),
            Arc::clone(&counter),
        );

        let (mut running, _handoff) = scheduler.start();
        let err = running.fatal_error().await.unwrap();

        assert_eq!(err.program, "/nonexistent/edr-loadgen-missing");
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        running.stop();
    }

    fn slow_launch(command: &[String], self_spawn: bool) -> Result<Child, LaunchError> {
        std::thread::sleep(Duration::from_millis(100));
        launch(command, self_spawn)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_slow_launches_overlap_on_single_runtime_thread() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut cfg = config(&["/bin/true"], Duration::from_millis(10));
        cfg.workers = 8;
        let scheduler =
            SpawnScheduler::new(cfg, Arc::clone(&counter)).with_launcher(slow_launch);

        let (running, handoff) = scheduler.start();
        let reapers = ReapPool::start(handoff, 8);

        time::sleep(Duration::from_millis(500)).await;
        let stats = running.join().await.unwrap();
        let spawned = counter.load(Ordering::Relaxed);

        // one launch at a time would cap this at 5 within 500ms
        assert!(spawned >= 16, "only {} launches", spawned);
        assert!(stats.issued >= 30, "ticker starved: {} ticks", stats.issued);
        assert_eq!(spawned, stats.issued - stats.dropped);
        assert!(reapers.join(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_stop_before_first_tick_spawns_nothing() {
        let counter = Arc::new(AtomicU64::new(0));
        let scheduler =
            SpawnScheduler::new(config(&["/bin/true"], Duration::from_secs(60)), Arc::clone(&counter));

        let (running, _handoff) = scheduler.start();
        let stats = running.join().await.unwrap();

        assert_eq!(stats, TickStats::default());
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
