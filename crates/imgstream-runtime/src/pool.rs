use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::AbortHandle;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,
    #[error("failed to start worker runtime: {0}")]
    Start(#[from] std::io::Error),
}

/// Snapshot of a task group as seen by the orchestrator.
#[derive(Debug)]
pub enum TaskPoll<T, E> {
    Pending,
    Ready(T),
    Failed(E),
    /// The group ended without reporting (aborted, panicked, or already drained).
    Lost,
}

/// Handle to one submitted task group.
///
/// Polling never blocks. Once a handle has returned anything other than `Pending` it is
/// spent and further polls report `Lost`.
#[derive(Debug)]
pub struct TaskHandle<T, E> {
    id: u64,
    rx: oneshot::Receiver<Result<T, E>>,
    abort: AbortHandle,
    submitted_at: Instant,
}

impl<T, E> TaskHandle<T, E> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    pub fn poll(&mut self) -> TaskPoll<T, E> {
        match self.rx.try_recv() {
            Ok(Ok(value)) => TaskPoll::Ready(value),
            Ok(Err(err)) => TaskPoll::Failed(err),
            Err(TryRecvError::Empty) => TaskPoll::Pending,
            Err(TryRecvError::Closed) => TaskPoll::Lost,
        }
    }

    /// Best-effort cancellation; the group may already have finished.
    pub fn abort(&self) {
        self.abort.abort();
    }
}

/// Wakes the orchestrator whenever a task group ends, including by panic or abort.
struct NotifyOnDrop(Arc<Notify>);

impl Drop for NotifyOnDrop {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

/// Fixed-size pool running task groups off the orchestrator thread.
///
/// At most `size` groups run at once; extra submissions queue on a semaphore inside the
/// pool, so `submit` itself never blocks. Results travel back through per-handle oneshot
/// channels and are only ever read by the submitter.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    permits: Arc<Semaphore>,
    completed: Arc<Notify>,
    size: usize,
    next_id: u64,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self, PoolError> {
        let size = size.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(size)
            .thread_name("imgstream-worker")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            permits: Arc::new(Semaphore::new(size)),
            completed: Arc::new(Notify::new()),
            size,
            next_id: 0,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.runtime.is_none()
    }

    pub fn submit<T, E, F>(&mut self, group: F) -> Result<TaskHandle<T, E>, PoolError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let runtime = self.runtime.as_ref().ok_or(PoolError::Closed)?;
        let (tx, rx) = oneshot::channel();
        let permits = self.permits.clone();
        let done = NotifyOnDrop(self.completed.clone());

        let join = runtime.spawn(async move {
            let _done = done;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let out = group.await;
            let _ = tx.send(out);
        });

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        Ok(TaskHandle {
            id,
            rx,
            abort: join.abort_handle(),
            submitted_at: Instant::now(),
        })
    }

    /// Suspends the caller until some task group ends or `timeout` elapses.
    ///
    /// Returns `true` when woken by a completion. Must be called from outside any async
    /// runtime (the orchestrator is a plain thread).
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        let Some(runtime) = self.runtime.as_ref() else {
            return false;
        };
        let completed = self.completed.clone();
        runtime.block_on(async move {
            tokio::time::timeout(timeout, completed.notified())
                .await
                .is_ok()
        })
    }

    /// Stops accepting work and drops every queued or running group without waiting.
    ///
    /// Outstanding handles subsequently poll as `Lost`. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.permits.close();
            runtime.shutdown_background();
            tracing::debug!(
                target: "imgstream_pipeline",
                event = "pool_shutdown",
                pool_size = self.size as u64,
                "worker pool shut down"
            );
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
