//! In-process worker pool (the `thread` backend).
//!
//! A fixed set of worker tasks drains a bounded FIFO queue of sessions.
//! The queue holds `maxthreads * 10` entries; when it is full, `add_task`
//! waits, which stalls the accept loops and sheds load onto the MTA's own
//! retry logic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::session::SessionHandler;
use crate::stats::StatsKeeper;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ThreadPool {
    min_workers: usize,
    max_workers: usize,
    queue_size: usize,
    queue: mpsc::Sender<SessionHandler>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn start(min_workers: usize, max_workers: usize, stats: Arc<StatsKeeper>) -> Self {
        let max_workers = max_workers.max(1);
        let queue_size = max_workers * 10;
        tracing::info!(min_workers, max_workers, queue_size, "starting thread pool");

        let (tx, rx) = mpsc::channel::<SessionHandler>(queue_size);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(max_workers);
        for id in 0..max_workers {
            let rx = Arc::clone(&rx);
            let stats = Arc::clone(&stats);
            workers.push(tokio::spawn(async move {
                loop {
                    // Lock only to dequeue; sessions run unlocked.
                    let session = { rx.lock().await.recv().await };
                    match session {
                        Some(session) => {
                            let outcome = session.handle().await;
                            stats.record(&outcome);
                        }
                        None => {
                            tracing::debug!(worker = id, "queue closed, worker exiting");
                            break;
                        }
                    }
                }
            }));
        }

        ThreadPool {
            min_workers,
            max_workers,
            queue_size,
            queue: tx,
            workers,
        }
    }

    /// Enqueue a session; waits while the queue is full. If the pool is
    /// already shutting down the session runs inline so the client still
    /// gets an answer.
    pub async fn add_task(&self, session: SessionHandler) {
        if let Err(rejected) = self.queue.send(session).await {
            tracing::warn!("thread pool queue closed, running session inline");
            rejected.0.handle().await;
        }
    }

    pub fn min_threads(&self) -> usize {
        self.min_workers
    }

    pub fn max_threads(&self) -> usize {
        self.max_workers
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Stop accepting work, let the workers drain the queue, and join them
    /// with a bounded timeout.
    pub async fn shutdown(self) {
        tracing::info!("shutting down thread pool");
        drop(self.queue);
        for worker in self.workers {
            match tokio::time::timeout(JOIN_TIMEOUT, worker).await {
                Ok(_) => {}
                Err(_) => tracing::warn!("worker did not finish within join timeout"),
            }
        }
        tracing::debug!("thread pool shut down");
    }
}
