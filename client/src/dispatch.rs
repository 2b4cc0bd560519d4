//! Bounded worker pool for listener invocation.
//!
//! Dispatcher and manager tasks hand listener calls to this pool so a slow
//! listener can never block inbound processing. When the queue is full the
//! job runs in the submitting task instead, which pushes back on the
//! producer rather than dropping the event.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queue capacity before submissions fall back to caller-runs.
const QUEUE_CAPACITY: usize = 256;

/// Listener worker pool.
pub(crate) struct DispatchPool {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchPool {
    /// Create a pool sized by CPU count, minimum 2, maximum 10 workers.
    pub(crate) fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .clamp(2, 10);
        Self::with_workers(workers)
    }

    pub(crate) fn with_workers(worker_count: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match job {
                        Some(job) => run_job(job),
                        None => break,
                    }
                }
                debug!("Dispatch worker {} exiting", id);
            }));
        }

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Submit a job. Runs inline when the queue is saturated (caller-runs)
    /// and is a no-op after shutdown.
    pub(crate) fn execute(&self, job: Job) {
        let tx = match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(tx) = tx else {
            debug!("Dispatch pool closed; dropping job");
            return;
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!("Dispatch queue saturated; running listener in caller");
                run_job(job);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Dispatch pool closed; dropping job");
            }
        }
    }

    /// Drain the queue and stop the workers, waiting up to `grace` before
    /// aborting stragglers.
    pub(crate) async fn shutdown(&self, grace: Duration) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        let drain = async {
            for worker in &workers {
                // Workers stop once the closed queue is drained; polling the
                // handles directly would consume them, so just wait.
                while !worker.is_finished() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Dispatch pool did not drain in {:?}; aborting workers", grace);
            for worker in &workers {
                worker.abort();
            }
        }
    }
}

fn run_job(job: Job) {
    run_listener(job);
}

/// Invoke a listener, containing any panic so it cannot take down the
/// calling task.
pub(crate) fn run_listener(f: impl FnOnce()) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic".to_string());
        error!("Listener panicked: {}", detail);
    }
}
