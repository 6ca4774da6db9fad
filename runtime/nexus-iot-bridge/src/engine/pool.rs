//! Worker pool.
//!
//! Blocking filesystem calls, queued work and socket drivers run on a
//! tokio runtime owned by the pool. Nothing spawned here touches script
//! state; results travel back to the loop thread as [`super::LoopEvent`]s.

use crate::config::RuntimeConfig;
use crate::error::{status, BridgeError, Result};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};

/// Counters shared with spawned jobs
#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    finished: AtomicU64,
}

/// Inner pool state
struct WorkPoolInner {
    /// Owned runtime, taken at shutdown
    runtime: Mutex<Option<Runtime>>,
    /// Handle used for spawning
    handle: Handle,
    /// Job accounting
    counters: Arc<PoolCounters>,
    /// Worker thread count
    threads: usize,
    /// Time to wait for busy workers at shutdown
    shutdown_timeout: Duration,
    /// Shutdown flag
    shutdown: RwLock<bool>,
}

/// Thread pool executing blocking and asynchronous OS work
pub struct WorkPool {
    inner: Arc<WorkPoolInner>,
}

impl WorkPool {
    /// Create a new worker pool
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let threads = config.thread_pool_size;

        info!(threads = threads, "Creating worker pool");

        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .max_blocking_threads(threads)
            .thread_name("nexus-iot-worker")
            .enable_all()
            .build()
            .map_err(|e| BridgeError::Pool(format!("failed to start workers: {}", e)))?;
        let handle = runtime.handle().clone();

        let inner = Arc::new(WorkPoolInner {
            runtime: Mutex::new(Some(runtime)),
            handle,
            counters: Arc::new(PoolCounters::default()),
            threads,
            shutdown_timeout: Duration::from_millis(config.pool_shutdown_timeout_ms),
            shutdown: RwLock::new(false),
        });

        Ok(Self { inner })
    }

    /// Run a future on the pool. Fails with `ECANCELED` after shutdown.
    pub fn spawn<F>(&self, future: F) -> std::result::Result<(), i32>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            warn!("Rejecting task submitted after pool shutdown");
            return Err(status::ECANCELED);
        }
        let counters = Arc::clone(&self.inner.counters);
        counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.handle.spawn(async move {
            future.await;
            counters.finished.fetch_add(1, Ordering::Relaxed);
        });
        Ok(())
    }

    /// Run a blocking closure on the pool. Fails with `ECANCELED` after shutdown.
    pub fn spawn_blocking<F>(&self, job: F) -> std::result::Result<(), i32>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shut_down() {
            warn!("Rejecting job submitted after pool shutdown");
            return Err(status::ECANCELED);
        }
        let counters = Arc::clone(&self.inner.counters);
        counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.handle.spawn_blocking(move || {
            job();
            counters.finished.fetch_add(1, Ordering::Relaxed);
        });
        Ok(())
    }

    /// Handle to the pool's runtime
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Worker thread count
    pub fn threads(&self) -> usize {
        self.inner.threads
    }

    /// Jobs submitted so far
    pub fn submitted_count(&self) -> u64 {
        self.inner.counters.submitted.load(Ordering::Relaxed)
    }

    /// Jobs that ran to completion
    pub fn finished_count(&self) -> u64 {
        self.inner.counters.finished.load(Ordering::Relaxed)
    }

    /// Whether shutdown has been requested
    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.read()
    }

    /// Stop accepting work and wait (bounded) for busy workers
    pub fn shutdown(&self) {
        {
            let mut flag = self.inner.shutdown.write();
            if *flag {
                return;
            }
            *flag = true;
        }

        info!("Shutting down worker pool");
        if let Some(runtime) = self.inner.runtime.lock().take() {
            runtime.shutdown_timeout(self.inner.shutdown_timeout);
        }
        debug!(
            submitted = self.submitted_count(),
            finished = self.finished_count(),
            "Worker pool shut down"
        );
    }
}

impl Clone for WorkPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for WorkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkPool")
            .field("threads", &self.inner.threads)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn create_pool() -> WorkPool {
        let config = RuntimeConfig::default().with_thread_pool_size(2);
        WorkPool::new(&config).unwrap()
    }

    #[test]
    fn test_pool_creation() {
        let pool = create_pool();
        assert_eq!(pool.threads(), 2);
        assert_eq!(pool.submitted_count(), 0);
        assert!(!pool.is_shut_down());
    }

    #[test]
    fn test_spawn_blocking_runs_job() {
        let pool = create_pool();
        let (tx, rx) = bounded(1);
        pool.spawn_blocking(move || {
            tx.send(21 * 2).unwrap();
        })
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        assert_eq!(pool.submitted_count(), 1);
    }

    #[test]
    fn test_spawn_future_runs() {
        let pool = create_pool();
        let (tx, rx) = bounded(1);
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            tx.send("done").unwrap();
        })
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "done");
    }

    #[test]
    fn test_shutdown_rejects_work() {
        let pool = create_pool();
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert_eq!(pool.spawn_blocking(|| {}), Err(status::ECANCELED));
        assert_eq!(pool.spawn(async {}), Err(status::ECANCELED));

        // second shutdown is a no-op
        pool.shutdown();
    }
}
