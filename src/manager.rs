//! Task manager and keyed work queues
//!
//! Every long-running component is a named task under one [`TaskManager`];
//! cancelling its token stops them all. Reconcilers consume keys from a
//! [`WorkQueue`], which serializes work per key, collapses keys already
//! waiting and retries failures following [`Error::action`].

use crate::error::{Error, ErrorAction, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Task Manager
// =============================================================================

/// Owns the process's long-running tasks and their shared cancellation
pub struct TaskManager {
    cancel: CancellationToken,
    tasks: JoinSet<(String, Result<()>)>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Token cancelled when the manager shuts down
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `task` until it returns or the manager shuts down
    pub fn spawn<F>(&mut self, name: &str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.to_string();
        debug!("Starting task {}", name);
        self.tasks.spawn(async move { (name, task.await) });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for `shutdown` or the first task failure, then cancel the rest
    /// and join them. Returns the first failure.
    pub async fn run_until<S>(mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let mut first_error = None;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping {} tasks", self.tasks.len());
                    break;
                }
                joined = self.tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(())))) => debug!("Task {} finished", name),
                    Some(Ok((name, Err(e)))) => {
                        error!("Task {} failed: {}", name, e);
                        first_error = Some(e);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("Task panicked: {}", e);
                        first_error = Some(Error::Internal(format!("task panicked: {}", e)));
                        break;
                    }
                },
            }
        }

        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Err(e))) => {
                    warn!("Task {} failed during shutdown: {}", name, e);
                    first_error.get_or_insert(e);
                }
                Ok((name, Ok(()))) => debug!("Task {} stopped", name),
                Err(e) => warn!("Task panicked during shutdown: {}", e),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Work Queue
// =============================================================================

/// Outcome of one successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Done,
    After(Duration),
}

/// Cloneable producer side of a [`WorkQueue`]
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl QueueHandle {
    /// Queue `key` unless it is already waiting to be processed
    pub fn enqueue(&self, key: impl Into<String>) {
        let key = key.into();
        if !self.pending.lock().insert(key.clone()) {
            debug!("{} already queued", key);
            return;
        }
        if let Err(mpsc::error::SendError(key)) = self.tx.send(key) {
            self.pending.lock().remove(&key);
            debug!("Work queue closed, dropping {}", key);
        }
    }

    /// Keys waiting to be processed
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn dequeued(&self, key: &str) {
        self.pending.lock().remove(key);
    }

    fn enqueue_after(&self, key: String, delay: Duration) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.enqueue(key);
        });
    }
}

/// Keys processed one at a time, with per-key exponential backoff
pub struct WorkQueue {
    name: String,
    handle: QueueHandle,
    rx: mpsc::UnboundedReceiver<String>,
    backoffs: HashMap<String, ExponentialBackoff>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            handle: QueueHandle {
                tx,
                pending: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
            backoffs: HashMap::new(),
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Delay before retrying `key` after `err`, `None` to drop it
    fn retry_delay(&mut self, key: &str, err: &Error) -> Option<Duration> {
        match err.action() {
            ErrorAction::NoRequeue => {
                self.backoffs.remove(key);
                None
            }
            ErrorAction::RequeueAfter(delay) => Some(delay),
            ErrorAction::RequeueWithBackoff => {
                let backoff = self.backoffs.entry(key.to_string()).or_insert_with(|| {
                    ExponentialBackoff {
                        initial_interval: Duration::from_millis(500),
                        max_interval: Duration::from_secs(300),
                        max_elapsed_time: None,
                        ..Default::default()
                    }
                });
                backoff.next_backoff()
            }
        }
    }

    /// Process keys with `reconcile` until `cancel` fires
    pub async fn run<F, Fut>(mut self, cancel: CancellationToken, mut reconcile: F) -> Result<()>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<Requeue>>,
    {
        info!("Starting work queue {}", self.name);
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => break,
                key = self.rx.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            // Changes arriving from here on need another pass
            self.handle.dequeued(&key);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = reconcile(key.clone()) => outcome,
            };
            match outcome {
                Ok(Requeue::Done) => {
                    self.backoffs.remove(&key);
                }
                Ok(Requeue::After(delay)) => {
                    self.backoffs.remove(&key);
                    self.handle.enqueue_after(key, delay);
                }
                Err(e) => match self.retry_delay(&key, &e) {
                    Some(delay) => {
                        warn!("{}: reconcile of {} failed, retrying in {:?}: {}", self.name, key, delay, e);
                        self.handle.enqueue_after(key, delay);
                    }
                    None => warn!("{}: reconcile of {} failed: {}", self.name, key, e),
                },
            }
        }
        info!("Stopped work queue {}", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manager_stops_on_shutdown() {
        let mut manager = TaskManager::new();
        let token = manager.token();
        manager.spawn("waiter", async move {
            token.cancelled().await;
            Ok(())
        });
        assert_eq!(manager.len(), 1);
        manager.run_until(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_reports_first_failure() {
        let mut manager = TaskManager::new();
        let token = manager.token();
        manager.spawn("failing", async { Err(Error::Internal("boom".into())) });
        manager.spawn("waiter", async move {
            token.cancelled().await;
            Ok(())
        });
        let result = manager.run_until(std::future::pending()).await;
        assert!(matches!(result, Err(Error::Internal(msg)) if msg == "boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_queue_retries_transient_failures() {
        let queue = WorkQueue::new("test");
        let handle = queue.handle();
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        handle.enqueue("pv-1");
        handle.enqueue("pv-2");

        let task = {
            let seen = seen.clone();
            let cancel = cancel.clone();
            tokio::spawn(queue.run(cancel, move |key| {
                let seen = seen.clone();
                async move {
                    let attempt = {
                        let mut seen = seen.lock();
                        seen.push(key.clone());
                        seen.iter().filter(|k| **k == key).count()
                    };
                    match key.as_str() {
                        "pv-1" if attempt < 3 => Err(Error::Conflict {
                            kind: "PersistentVolume".into(),
                            name: key,
                        }),
                        "pv-2" => Err(Error::InvalidArgument("bad".into())),
                        _ => Ok(Requeue::Done),
                    }
                }
            }))
        };

        tokio::time::sleep(Duration::from_secs(60)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.iter().filter(|k| *k == "pv-1").count(), 3);
        assert_eq!(seen.iter().filter(|k| *k == "pv-2").count(), 1);
    }

    #[tokio::test]
    async fn test_work_queue_collapses_waiting_duplicates() {
        let queue = WorkQueue::new("test");
        let handle = queue.handle();
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..5 {
            handle.enqueue("pv-1");
        }
        handle.enqueue("pv-2");
        handle.enqueue("pv-1");
        assert_eq!(handle.pending(), 2);

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let task = {
            let seen = seen.clone();
            tokio::spawn(queue.run(cancel.clone(), move |key| {
                let seen = seen.clone();
                let done_tx = done_tx.clone();
                async move {
                    seen.lock().push(key);
                    let _ = done_tx.send(());
                    Ok(Requeue::Done)
                }
            }))
        };

        done_rx.recv().await.unwrap();
        done_rx.recv().await.unwrap();
        assert_eq!(handle.pending(), 0);

        // Once dequeued, the key can be queued again
        handle.enqueue("pv-1");
        done_rx.recv().await.unwrap();

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(*seen.lock(), vec!["pv-1", "pv-2", "pv-1"]);
    }
}
