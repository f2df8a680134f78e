// Run workers
// A fixed pool of tasks drains the run queue and drives each run to a terminal state.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::run::RunId;
use crate::types::{AppError, AppResult};

/// Producer side of the run queue. Cheap to clone.
#[derive(Clone)]
pub struct RunQueue {
    engine: Arc<Engine>,
    tx: mpsc::Sender<RunId>,
}

impl RunQueue {
    /// Mark the run queued and hand it to the next free worker.
    pub async fn enqueue(&self, run_id: RunId) -> AppResult<()> {
        self.engine.mark_queued(run_id).await?;
        self.tx
            .send(run_id)
            .await
            .map_err(|_| AppError::Internal("run queue is closed".to_string()))?;
        debug!(run_id = %run_id, "Run enqueued");
        Ok(())
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `worker_count` workers (at least one) sharing a queue of `capacity`.
    pub fn start(engine: Arc<Engine>, worker_count: usize, capacity: usize) -> (RunQueue, WorkerPool) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();

        let handles = (0..worker_count.max(1))
            .map(|worker| tokio::spawn(work(worker, engine.clone(), rx.clone(), shutdown.clone())))
            .collect::<Vec<_>>();
        info!(workers = handles.len(), "Run workers started");

        (RunQueue { engine, tx }, WorkerPool { handles, shutdown })
    }

    /// Stop taking new runs and wait for in-flight ones to return.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Run worker panicked");
            }
        }
        info!("Run workers stopped");
    }
}

async fn work(
    worker: usize,
    engine: Arc<Engine>,
    rx: Arc<Mutex<mpsc::Receiver<RunId>>>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => None,
            next = async { rx.lock().await.recv().await } => next,
        };
        let Some(run_id) = next else {
            break;
        };

        debug!(worker, run_id = %run_id, "Worker picked up run");
        match engine.advance(run_id).await {
            Ok(snapshot) => debug!(worker, run_id = %run_id, status = %snapshot.status, "Worker finished run"),
            Err(e) => warn!(worker, run_id = %run_id, error = %e, "Worker could not advance run"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::intent::{Intent, Route};
    use crate::run::RunStatus;
    use std::time::Duration;

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::builder(Config::default()).build())
    }

    async fn wait_terminal(engine: &Engine, run_id: RunId) -> RunStatus {
        for _ in 0..200 {
            let status = engine.get_state(run_id).await.unwrap().status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} never finished", run_id);
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let engine = engine();
        let (queue, pool) = WorkerPool::start(engine.clone(), 2, 8);

        let mut ids = Vec::new();
        for indication in ["IBD", "Psoriasis", "Asthma"] {
            let intent = Intent::new(Route::MarketBack).with_field("indication", indication);
            let run_id = engine.create_run(intent).await.unwrap();
            queue.enqueue(run_id).await.unwrap();
            ids.push(run_id);
        }

        for run_id in ids {
            assert_eq!(wait_terminal(&engine, run_id).await, RunStatus::Completed);
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_run_is_not_enqueued() {
        let engine = engine();
        let (queue, pool) = WorkerPool::start(engine.clone(), 1, 1);

        let intent = Intent::new(Route::MarketBack).with_field("indication", "IBD");
        let run_id = engine.create_run(intent).await.unwrap();
        engine.cancel(run_id).await.unwrap();

        assert!(matches!(queue.enqueue(run_id).await, Err(AppError::InvalidTransition { .. })));
        assert!(matches!(queue.enqueue(RunId::new()).await, Err(AppError::RunNotFound(_))));
        pool.shutdown().await;
    }
}
