//! Background processing queue and worker pool
//!
//! The webhook fast path never runs the heavy pipeline: it persists the
//! session row and enqueues a task here. A bounded channel provides
//! backpressure (a full queue leaves the session `pending` and surfaces the
//! depth through health output); a pool of workers drains it in parallel,
//! one sequential pipeline per file, each bounded by a per-file timeout.

use crate::clinical::session_processor::TherapySessionProcessor;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// One unit of background work: everything a worker needs to process a
/// single uploaded recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingTask {
    pub session_code: String,
    pub bucket: String,
    pub object_path: String,
}

// ============================================================================
// Queue handle
// ============================================================================

#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<ProcessingTask>,
    depth: Arc<AtomicUsize>,
}

impl TaskQueue {
    /// Build a bounded queue; the receiver half goes to the worker pool.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProcessingTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                depth: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Non-blocking enqueue. Returns false when the queue is full: the
    /// session row stays `pending` and operators see the depth in health.
    pub fn try_enqueue(&self, task: ProcessingTask) -> bool {
        match self.tx.try_send(task) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(session_code = %task.session_code, "background queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                error!(session_code = %task.session_code, "background queue closed");
                false
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn depth_counter(&self) -> Arc<AtomicUsize> {
        self.depth.clone()
    }
}

// ============================================================================
// Worker pool
// ============================================================================

/// Spawn `worker_count` workers draining the queue. Each task runs under
/// `task_timeout`; on expiry the session is marked failed with a timeout
/// error and the worker moves on.
pub fn spawn_workers(
    queue: &TaskQueue,
    rx: mpsc::Receiver<ProcessingTask>,
    worker_count: usize,
    task_timeout: Duration,
    processor: Arc<TherapySessionProcessor>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(AsyncMutex::new(rx));
    let depth = queue.depth_counter();
    let mut handles = Vec::with_capacity(worker_count.max(1));

    for worker_id in 0..worker_count.max(1) {
        let rx = rx.clone();
        let depth = depth.clone();
        let processor = processor.clone();

        handles.push(tokio::spawn(async move {
            info!(worker_id, "background worker started");
            loop {
                let task = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(task) = task else {
                    info!(worker_id, "queue closed, worker exiting");
                    break;
                };
                depth.fetch_sub(1, Ordering::Relaxed);

                let code = task.session_code.clone();
                match tokio::time::timeout(task_timeout, processor.process_task(&task)).await {
                    Ok(Ok(())) => {
                        info!(worker_id, session_code = %code, "session processed");
                    }
                    Ok(Err(e)) => {
                        error!(worker_id, session_code = %code, "processing failed: {e}");
                    }
                    Err(_) => {
                        error!(worker_id, session_code = %code, "processing timed out");
                        processor
                            .mark_timeout(&task, task_timeout.as_secs())
                            .await;
                    }
                }
            }
        }));
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(code: &str) -> ProcessingTask {
        ProcessingTask {
            session_code: code.into(),
            bucket: "c3d-examples".into(),
            object_path: format!("P001/{code}.c3d"),
        }
    }

    #[tokio::test]
    async fn enqueue_tracks_depth() {
        let (queue, mut rx) = TaskQueue::new(4);
        assert!(queue.try_enqueue(task("P001S001")));
        assert!(queue.try_enqueue(task("P001S002")));
        assert_eq!(queue.depth(), 2);
        assert_eq!(rx.recv().await.unwrap().session_code, "P001S001");
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let (queue, _rx) = TaskQueue::new(1);
        assert!(queue.try_enqueue(task("P001S001")));
        assert!(!queue.try_enqueue(task("P001S002")));
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn closed_queue_rejects() {
        let (queue, rx) = TaskQueue::new(1);
        drop(rx);
        assert!(!queue.try_enqueue(task("P001S001")));
    }
}
