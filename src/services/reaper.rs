use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

/// Waits for spawned children so none of them is left as a zombie.
///
/// Any worker may reap any child. The pool winds down by itself once the handoff channel is
/// closed, which happens when the last launch worker exits, and drained.
pub struct ReapPool {
    workers: Vec<JoinHandle<()>>,
    reaped: Arc<AtomicU64>,
}

impl ReapPool {
    pub fn start(children: mpsc::Receiver<Child>, workers: usize) -> Self {
        let children = Arc::new(Mutex::new(children));
        let reaped = Arc::new(AtomicU64::new(0));

        let workers = (0..workers)
            .map(|_| tokio::spawn(reap(Arc::clone(&children), Arc::clone(&reaped))))
            .collect();

        Self { workers, reaped }
    }

    /// Number of children reaped so far, shared with the workers.
    pub fn reaped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.reaped)
    }

    /// Waits up to `grace` for every child to be reaped. Returns `false` when the grace
    /// period ran out; the remaining workers keep running until the runtime shuts down.
    pub async fn join(self, grace: Duration) -> bool {
        let workers = self.workers;
        let drained = async move {
            for worker in workers {
                if let Err(e) = worker.await {
                    log::error!("reap worker failed: {}", e);
                }
            }
        };

        match time::timeout(grace, drained).await {
            Ok(()) => true,
            Err(_) => {
                log::warn!(
                    "children still running after {:?}, {} reaped so far",
                    grace,
                    self.reaped.load(Ordering::Relaxed)
                );
                false
            }
        }
    }
}

async fn reap(children: Arc<Mutex<mpsc::Receiver<Child>>>, reaped: Arc<AtomicU64>) {
    loop {
        let Some(mut child) = children.lock().await.recv().await else {
            break;
        };

        // exit codes carry no information for load generation
        if let Err(e) = child.wait().await {
            log::debug!("wait for child {:?}: {}", child.id(), e);
        }
        reaped.fetch_add(1, Ordering::Relaxed);
    }
}
