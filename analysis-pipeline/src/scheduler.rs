use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::{sync::Mutex, task::JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Phase,
    Timeout,
}

/// Identifies one pending delayed execution. A job owns at most one handle
/// per kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub job_id: String,
    pub kind: HandleKind,
}

impl HandleKey {
    pub fn phase(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind: HandleKind::Phase,
        }
    }

    pub fn timeout(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind: HandleKind::Timeout,
        }
    }
}

/// Runs futures after a delay and lets callers cancel them while they are
/// still waiting.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Schedules `task` to run after `delay`. A pending task under the same
    /// key is aborted and replaced.
    async fn schedule(&self, key: HandleKey, delay: Duration, task: BoxFuture<'static, ()>);

    /// Cancels a task that has not fired yet. Returns `false` when nothing
    /// was pending under `key`.
    async fn cancel(&self, key: &HandleKey) -> bool;

    /// Cancels every pending task and returns how many were aborted.
    async fn cancel_all(&self) -> usize;

    async fn is_pending(&self, key: &HandleKey) -> bool;
}

struct ScheduledTask {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Clone, Default)]
pub struct TokioScheduler {
    tasks: Arc<Mutex<HashMap<HandleKey, ScheduledTask>>>,
    next_generation: Arc<AtomicU64>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn schedule(&self, key: HandleKey, delay: Duration, task: BoxFuture<'static, ()>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.tasks);
        let task_key = key.clone();

        let mut tasks = self.tasks.lock().await;
        if let Some(prior) = tasks.remove(&key) {
            prior.handle.abort();
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                // A fired task unregisters itself first, so a later cancel
                // can never abort work that is already running.
                let mut tasks = registry.lock().await;
                match tasks.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        tasks.remove(&task_key);
                    }
                    _ => return,
                }
            }
            task.await;
        });

        tasks.insert(key, ScheduledTask { generation, handle });
    }

    async fn cancel(&self, key: &HandleKey) -> bool {
        match self.tasks.lock().await.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    async fn cancel_all(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let count = tasks.len();
        for (_, entry) in tasks.drain() {
            entry.handle.abort();
        }
        count
    }

    async fn is_pending(&self, key: &HandleKey) -> bool {
        self.tasks.lock().await.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn send(tx: &mpsc::UnboundedSender<&'static str>, label: &'static str) -> BoxFuture<'static, ()> {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(label);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay_and_unregisters() {
        let scheduler = TokioScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key = HandleKey::phase("job-1");

        scheduler
            .schedule(key.clone(), Duration::from_millis(100), send(&tx, "fired"))
            .await;
        assert!(scheduler.is_pending(&key).await);

        assert_eq!(rx.recv().await, Some("fired"));
        assert!(!scheduler.is_pending(&key).await);
        assert!(!scheduler.cancel(&key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_pending_task() {
        let scheduler = TokioScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key = HandleKey::phase("job-1");

        scheduler
            .schedule(key.clone(), Duration::from_millis(100), send(&tx, "first"))
            .await;
        scheduler
            .schedule(key.clone(), Duration::from_millis(200), send(&tx, "second"))
            .await;

        assert_eq!(rx.recv().await, Some("second"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_never_runs() {
        let scheduler = TokioScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key = HandleKey::timeout("job-1");

        scheduler
            .schedule(key.clone(), Duration::from_millis(100), send(&tx, "fired"))
            .await;
        assert!(scheduler.cancel(&key).await);
        assert!(!scheduler.cancel(&key).await);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn phase_and_timeout_handles_are_independent() {
        let scheduler = TokioScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        scheduler
            .schedule(
                HandleKey::phase("job-1"),
                Duration::from_millis(100),
                send(&tx, "phase"),
            )
            .await;
        scheduler
            .schedule(
                HandleKey::timeout("job-1"),
                Duration::from_millis(200),
                send(&tx, "timeout"),
            )
            .await;

        assert!(scheduler.cancel(&HandleKey::phase("job-1")).await);
        assert!(scheduler.is_pending(&HandleKey::timeout("job-1")).await);
        assert_eq!(rx.recv().await, Some("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_aborts_everything() {
        let scheduler = TokioScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for id in ["a", "b", "c"] {
            scheduler
                .schedule(HandleKey::phase(id), Duration::from_secs(5), send(&tx, "fired"))
                .await;
        }

        assert_eq!(scheduler.cancel_all().await, 3);
        assert_eq!(scheduler.cancel_all().await, 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
