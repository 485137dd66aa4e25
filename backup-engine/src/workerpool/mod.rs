//! Bounded fan-out/fan-in worker pool.
//!
//! A producer pushes items into the input queue, `workers` tasks pull from it
//! and run the task function, and a consumer drains the output queue. Results
//! come back in completion order. The output queue is closed by a supervisor
//! once every worker has returned; that close is the only end-of-work signal.

pub mod retry;

pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub workers: usize,
    /// Capacity of both the input and the output queue.
    pub capacity: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 8,
            capacity: 10,
        }
    }
}

/// Running pool. Drop the input sender to let the workers drain and exit.
pub struct WorkerPool<I, O> {
    jobs: mpsc::Sender<I>,
    results: PoolResults<O>,
}

/// Consumer side of a pool.
pub struct PoolResults<O> {
    rx: mpsc::Receiver<O>,
    supervisor: JoinHandle<usize>,
}

impl<I, O> WorkerPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn start<F, Fut>(options: PoolOptions, cancel: CancellationToken, task: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        let workers = options.workers.max(1);
        let capacity = options.capacity.max(1);

        let (jobs_tx, jobs_rx) = mpsc::channel::<I>(capacity);
        let (results_tx, results_rx) = mpsc::channel::<O>(capacity);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let task = Arc::new(task);

        let mut set = JoinSet::new();
        for id in 0..workers {
            set.spawn(worker_loop(
                id,
                Arc::clone(&jobs_rx),
                results_tx.clone(),
                Arc::clone(&task),
                cancel.clone(),
            ));
        }
        drop(jobs_rx);

        let supervisor = tokio::spawn(async move {
            let mut processed = 0usize;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(count) => processed += count,
                    Err(e) => error!("Worker task failed: {}", e),
                }
            }
            drop(results_tx);
            processed
        });

        debug!("Worker pool started: {} workers, queue capacity {}", workers, capacity);

        Self {
            jobs: jobs_tx,
            results: PoolResults {
                rx: results_rx,
                supervisor,
            },
        }
    }

    /// Split into the producer handle and the consumer side.
    pub fn into_parts(self) -> (mpsc::Sender<I>, PoolResults<O>) {
        (self.jobs, self.results)
    }
}

impl<O> PoolResults<O> {
    /// Next finished item; `None` once every worker has exited.
    pub async fn next(&mut self) -> Option<O> {
        self.rx.recv().await
    }

    /// Wait for the supervisor and return how many items the workers ran.
    pub async fn finish(self) -> usize {
        drop(self.rx);
        match self.supervisor.await {
            Ok(processed) => processed,
            Err(e) => {
                error!("Pool supervisor failed: {}", e);
                0
            }
        }
    }
}

async fn worker_loop<I, O, F, Fut>(
    id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<I>>>,
    results: mpsc::Sender<O>,
    task: Arc<F>,
    cancel: CancellationToken,
) -> usize
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = O>,
{
    let mut processed = 0usize;
    loop {
        let next = {
            let mut rx = jobs.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = rx.recv() => item,
            }
        };
        let Some(item) = next else { break };

        let output = task(item).await;
        processed += 1;
        if results.send(output).await.is_err() {
            // consumer is gone
            break;
        }
    }
    debug!("Worker {} exiting after {} items", id, processed);
    processed
}
