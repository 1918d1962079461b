use crate::core::{BatchError, Result};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Level, event};

/// Lifecycle of a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Nothing submitted yet.
    Idle,
    Running,
    /// Shut down; the next submission restarts it.
    Shutdown,
}

/// Bounded set of flush tasks.
///
/// At most `capacity` tasks talk to the gateway at once; more may be queued
/// behind the semaphore.
pub struct WorkerPool {
    capacity: usize,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .field("inflight", &self.inflight())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            state: Mutex::new(PoolState::Idle),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> PoolState {
        *self.lock_state()
    }

    /// Move to `Running`, restarting a pool that was shut down.
    pub fn ensure_running(&self) {
        let mut state = self.lock_state();
        match *state {
            PoolState::Running => {}
            PoolState::Idle => {
                event!(Level::DEBUG, capacity = self.capacity, "worker pool started");
                *state = PoolState::Running;
            }
            PoolState::Shutdown => {
                log::warn!("Batch worker pool was shut down; restarting it to flush new work");
                *state = PoolState::Running;
            }
        }
    }

    /// Run `task` once a slot is free.
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.ensure_running();
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        });

        let mut tasks = self.lock_tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Tasks submitted and not finished yet.
    pub fn inflight(&self) -> usize {
        self.lock_tasks()
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Wait for every submitted task, including ones submitted while waiting.
    pub async fn join_all(&self) -> Result<()> {
        let mut failures = Vec::new();
        loop {
            let tasks = std::mem::take(&mut *self.lock_tasks());
            if tasks.is_empty() {
                break;
            }
            for joined in futures::future::join_all(tasks).await {
                if let Err(err) = joined {
                    event!(Level::ERROR, error = %err, "flush task failed");
                    failures.push(err.to_string());
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BatchError::ExecutionError(format!(
                "flush task join: {}",
                failures.join("; ")
            )))
        }
    }

    /// Wait for in-flight work and mark the pool shut down.
    pub async fn shutdown(&self) -> Result<()> {
        let joined = self.join_all().await;
        *self.lock_state() = PoolState::Shutdown;
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn lifecycle_idle_running_shutdown_running() {
        let pool = WorkerPool::new(2);
        assert_eq!(pool.state(), PoolState::Idle);

        pool.submit(async {});
        assert_eq!(pool.state(), PoolState::Running);

        pool.shutdown().await.unwrap();
        assert_eq!(pool.state(), PoolState::Shutdown);
        assert_eq!(pool.inflight(), 0);

        pool.submit(async {});
        assert_eq!(pool.state(), PoolState::Running);
        pool.join_all().await.unwrap();
    }

    #[tokio::test]
    async fn never_runs_more_than_capacity() {
        let pool = WorkerPool::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..12 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        pool.join_all().await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_task_surfaces_on_join() {
        let pool = WorkerPool::new(1);
        pool.submit(async { panic!("boom") });
        let err = pool.join_all().await.unwrap_err();
        assert!(matches!(err, BatchError::ExecutionError(_)));
    }
}
