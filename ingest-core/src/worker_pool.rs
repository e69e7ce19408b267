use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::error;

use crate::error::IngestError;
use crate::metric_consts::WORKER_CRASHED;

/// Bounded-concurrency dispatcher. There is no real per-thread worker state
/// to shard across here (no plugin VM instance to pin to a worker), so the
/// pool is realized as a semaphore-gated task spawner: `WORKER_CONCURRENCY *
/// TASKS_PER_WORKER` permits model the aggregate in-flight budget the
/// worker/tasks-per-worker pair describes, and tokio's scheduler does the
/// actual load balancing a least-loaded-worker pick would have done by hand.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(worker_concurrency: usize, tasks_per_worker: usize) -> Self {
        let permits = worker_concurrency.saturating_mul(tasks_per_worker).max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Runs `task` once a permit is free, queueing FIFO under backpressure.
    /// A panic inside `task` is reported as [IngestError::Fatal] tagged
    /// `WorkerCrashed`, mirroring a worker-thread crash in the threaded
    /// model: the task fails, the pool itself keeps serving new work.
    pub async fn run_task<F, T>(&self, task: F) -> Result<T, IngestError>
    where
        F: Future<Output = Result<T, IngestError>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore is never closed");

        let handle: JoinHandle<Result<T, IngestError>> = tokio::spawn(async move {
            let _permit = permit;
            task.await
        });

        match handle.await {
            Ok(result) => result,
            Err(join_error) => {
                metrics::counter!(WORKER_CRASHED).increment(1);
                error!(error = %join_error, "worker task panicked");
                Err(IngestError::Fatal(format!("WorkerCrashed: {join_error}")))
            }
        }
    }

    /// Waits for every permit to free up, i.e. every in-flight task to
    /// finish. New tasks submitted after this call still race in, since the
    /// semaphore is never closed; callers stop submitting first.
    pub async fn drain(&self, total_permits: usize) {
        let _ = self.semaphore.acquire_many(total_permits as u32).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_task_returns_the_inner_result() {
        let pool = WorkerPool::new(2, 2);
        let result = pool.run_task(async { Ok::<_, IngestError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn a_panicking_task_surfaces_as_fatal_without_poisoning_the_pool() {
        let pool = WorkerPool::new(1, 1);
        let crashed: Result<(), IngestError> = pool
            .run_task(async {
                panic!("boom");
                #[allow(unreachable_code)]
                Ok(())
            })
            .await;
        assert!(crashed.is_err());

        let survives = pool.run_task(async { Ok::<_, IngestError>(()) }).await;
        assert!(survives.is_ok());
    }
}
