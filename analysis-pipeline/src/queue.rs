use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::AnalysisTuning,
    error::JobError,
    job::{AnalysisConfig, Job, JobStatus},
    pipeline::{self, PhaseOutcome},
    scheduler::{HandleKey, Scheduler, TokioScheduler},
    services::AnalysisServices,
    store::JobStore,
};

/// Asynchronous queue of session analysis jobs.
///
/// Cloning is cheap and every clone drives the same store and scheduler.
#[derive(Clone)]
pub struct AnalysisQueue {
    inner: Arc<QueueInner>,
}

pub(crate) struct QueueInner {
    pub(crate) store: JobStore,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) services: AnalysisServices,
    pub(crate) tuning: AnalysisTuning,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AnalysisQueue {
    pub fn new(services: AnalysisServices, tuning: AnalysisTuning) -> Self {
        Self::with_scheduler(services, tuning, Arc::new(TokioScheduler::new()))
    }

    pub fn with_scheduler(
        services: AnalysisServices,
        tuning: AnalysisTuning,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store: JobStore::new(),
                scheduler,
                services,
                tuning,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn tuning(&self) -> &AnalysisTuning {
        &self.inner.tuning
    }

    /// Validates `config`, creates a fresh sampling job and enqueues it.
    pub async fn submit(&self, config: AnalysisConfig) -> Result<Job, JobError> {
        config.validate()?;
        let job = Job::new(config);
        self.enqueue(job.clone()).await?;
        self.get_job(&job.id).await
    }

    /// Inserts `job` and schedules its first phase execution together with
    /// the absolute timeout covering all phases.
    pub async fn enqueue(&self, job: Job) -> Result<(), JobError> {
        let job_id = job.id.clone();
        let analysis_id = job.analysis_id.clone();
        self.inner.store.insert(job).await?;

        let tuning = &self.inner.tuning;
        self.inner
            .schedule_timeout(&job_id, tuning.job_timeout())
            .await;
        self.inner
            .schedule_phase(&job_id, tuning.phase_delay())
            .await;

        // A cancel that landed between insert and scheduling found no
        // handles to clear.
        if self
            .inner
            .store
            .get(&job_id)
            .await
            .is_some_and(|job| job.is_terminal())
        {
            self.inner.clear_handles(&job_id).await;
            debug!(%job_id, "job finished before its handles were armed");
            return Ok(());
        }

        info!(%job_id, %analysis_id, "analysis job enqueued");
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, JobError> {
        self.inner
            .store
            .get(job_id)
            .await
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))
    }

    pub async fn update_job(&self, job_id: &str, job: Job) -> Result<Job, JobError> {
        self.inner.store.update(job_id, job).await
    }

    /// Cancels a job that has not completed.
    ///
    /// Returns `false` for unknown or completed jobs. Cancelling an already
    /// failed job returns `true` and leaves the record as it was.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let Some(job) = self.inner.store.get(job_id).await else {
            return false;
        };

        match job.status {
            JobStatus::Completed => false,
            JobStatus::Failed => {
                self.inner.clear_handles(job_id).await;
                true
            }
            JobStatus::Queued | JobStatus::Running => {
                match self.inner.fail_job(job_id, &JobError::Cancelled).await {
                    Some(_) => {
                        info!(%job_id, "analysis job cancelled");
                        true
                    }
                    // Lost the race against the job finishing on its own.
                    None => self
                        .inner
                        .store
                        .get(job_id)
                        .await
                        .is_some_and(|job| job.status == JobStatus::Failed),
                }
            }
        }
    }

    pub async fn sweep_expired(&self) -> Vec<String> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Evicts terminal jobs older than the retention window as seen from
    /// `now`.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<String> {
        self.inner.sweep(now).await
    }

    /// Starts the periodic cleanup task. Calling it again restarts the task.
    pub async fn start_cleanup_sweeper(&self) {
        let interval = self.inner.tuning.cleanup_interval();
        let handle = tokio::spawn(run_sweeper(Arc::downgrade(&self.inner), interval));

        if let Some(previous) = self.inner.sweeper.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Stops the sweeper and cancels every pending phase and timeout.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.sweeper.lock().await.take() {
            handle.abort();
        }
        let cancelled = self.inner.scheduler.cancel_all().await;
        info!(cancelled, "analysis queue shut down");
    }

    #[cfg(test)]
    pub(crate) async fn has_pending_phase(&self, job_id: &str) -> bool {
        self.inner
            .scheduler
            .is_pending(&HandleKey::phase(job_id))
            .await
    }

    #[cfg(test)]
    pub(crate) async fn has_pending_timeout(&self, job_id: &str) -> bool {
        self.inner
            .scheduler
            .is_pending(&HandleKey::timeout(job_id))
            .await
    }

    #[cfg(test)]
    pub(crate) async fn job_count(&self) -> usize {
        self.inner.store.len().await
    }

    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> Weak<QueueInner> {
        Arc::downgrade(&self.inner)
    }
}

impl QueueInner {
    pub(crate) async fn schedule_phase(self: &Arc<Self>, job_id: &str, delay: Duration) {
        let task = phase_task(Arc::downgrade(self), job_id.to_string());
        self.scheduler
            .schedule(HandleKey::phase(job_id), delay, task)
            .await;
    }

    async fn schedule_timeout(self: &Arc<Self>, job_id: &str, timeout: Duration) {
        let queue = Arc::downgrade(self);
        let id = job_id.to_string();
        let secs = reported_secs(timeout);
        let task: BoxFuture<'static, ()> = Box::pin(async move {
            if let Some(inner) = queue.upgrade() {
                inner.expire(&id, secs).await;
            }
        });
        self.scheduler
            .schedule(HandleKey::timeout(job_id), timeout, task)
            .await;
    }

    pub(crate) async fn clear_handles(&self, job_id: &str) {
        self.scheduler.cancel(&HandleKey::phase(job_id)).await;
        self.scheduler.cancel(&HandleKey::timeout(job_id)).await;
    }

    /// Moves a still active job to `failed` with `err` as its message and
    /// drops its pending handles. Returns `None` when the job was already
    /// terminal or no longer exists.
    pub(crate) async fn fail_job(&self, job_id: &str, err: &JobError) -> Option<Job> {
        let message = err.to_string();
        let failed = match self
            .store
            .update_active(job_id, |job| job.mark_failed(message, Utc::now()))
            .await
        {
            Ok(failed) => failed,
            Err(update_err) => {
                warn!(%job_id, error = %update_err, "could not record job failure");
                None
            }
        };

        self.clear_handles(job_id).await;
        failed
    }

    async fn expire(&self, job_id: &str, secs: u64) {
        if self.fail_job(job_id, &JobError::Timeout(secs)).await.is_some() {
            warn!(%job_id, timeout_secs = secs, "analysis job timed out");
        }
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let removed = self
            .store
            .remove_expired(now, self.tuning.retention())
            .await;
        for job_id in &removed {
            self.clear_handles(job_id).await;
        }
        if !removed.is_empty() {
            debug!(evicted = removed.len(), "swept expired analysis jobs");
        }
        removed
    }
}

/// Whole seconds shown in the timeout message, rounded up so a sub-second
/// timeout never reads as zero.
fn reported_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs();
    if timeout.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

/// Pending tasks only hold a weak reference, so dropping the last queue
/// handle releases it even while timers are still armed.
fn phase_task(queue: Weak<QueueInner>, job_id: String) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Some(inner) = queue.upgrade() else {
            return;
        };
        if pipeline::dispatch(&inner, &job_id).await == PhaseOutcome::Advance {
            inner
                .schedule_phase(&job_id, inner.tuning.phase_delay())
                .await;
        }
    })
}

async fn run_sweeper(queue: Weak<QueueInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = queue.upgrade() else {
            break;
        };
        inner.sweep(Utc::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        BatchAnalysis, BatchAnalyzer, BatchRequest, DiscoveryProgressSender, ResultStore,
        SessionDiscovery, SummaryGenerator,
    };
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;
    use common::{
        error::AppError,
        storage::types::session_analysis::{AnalysisOutcome, SessionAnalysis, SessionTranscript},
    };

    struct Idle;

    #[async_trait]
    impl SessionDiscovery for Idle {
        async fn discover(
            &self,
            _config: &AnalysisConfig,
            _progress: DiscoveryProgressSender,
        ) -> Result<Vec<SessionTranscript>, AppError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl BatchAnalyzer for Idle {
        async fn analyze(&self, _request: BatchRequest) -> Result<BatchAnalysis, AppError> {
            Ok(BatchAnalysis::default())
        }
    }

    #[async_trait]
    impl SummaryGenerator for Idle {
        async fn summarize(&self, _results: &[SessionAnalysis]) -> Result<String, AppError> {
            Ok(String::new())
        }
    }

    #[async_trait]
    impl ResultStore for Idle {
        async fn store(&self, _id: &str, _outcome: &AnalysisOutcome) -> Result<(), AppError> {
            Ok(())
        }
    }

    /// Holds the first `schedule` call until the gate is opened.
    struct GatedScheduler {
        inner: TokioScheduler,
        gate: Arc<Notify>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl Scheduler for GatedScheduler {
        async fn schedule(&self, key: HandleKey, delay: Duration, task: BoxFuture<'static, ()>) {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.gate.notified().await;
            }
            self.inner.schedule(key, delay, task).await;
        }

        async fn cancel(&self, key: &HandleKey) -> bool {
            self.inner.cancel(key).await
        }

        async fn cancel_all(&self) -> usize {
            self.inner.cancel_all().await
        }

        async fn is_pending(&self, key: &HandleKey) -> bool {
            self.inner.is_pending(key).await
        }
    }

    fn queue_with(scheduler: Arc<dyn Scheduler>) -> AnalysisQueue {
        let idle = Arc::new(Idle);
        AnalysisQueue::with_scheduler(
            AnalysisServices::new(
                Arc::<Idle>::clone(&idle),
                Arc::<Idle>::clone(&idle),
                Arc::<Idle>::clone(&idle),
                idle,
            ),
            AnalysisTuning::default(),
            scheduler,
        )
    }

    fn queue() -> AnalysisQueue {
        queue_with(Arc::new(TokioScheduler::new()))
    }

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            start_date: NaiveDate::from_ymd_opt(2024, 5, 1).expect("valid date"),
            end_date: NaiveDate::from_ymd_opt(2024, 5, 7).expect("valid date"),
            session_count: 3,
            model_id: "gpt-4o-mini".into(),
            api_key: "sk-test".into(),
            additional_context: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_schedules_phase_and_timeout() {
        let queue = queue();
        let job = Job::new(config());

        queue.enqueue(job.clone()).await.expect("enqueue");

        assert!(queue.has_pending_phase(&job.id).await);
        assert!(queue.has_pending_timeout(&job.id).await);
        assert_eq!(
            queue.enqueue(job.clone()).await,
            Err(JobError::DuplicateJob(job.id.clone()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn submit_rejects_invalid_config() {
        let queue = queue();
        let mut invalid = config();
        invalid.session_count = 0;

        assert!(matches!(
            queue.submit(invalid).await,
            Err(JobError::InvalidConfiguration(_))
        ));
        assert_eq!(queue.job_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn get_job_reports_unknown_ids() {
        let queue = queue();

        assert_eq!(
            queue.get_job("missing").await,
            Err(JobError::JobNotFound("missing".into()))
        );
        assert!(!queue.cancel_job("missing").await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_clears_handles() {
        let queue = queue();
        let job = queue.submit(config()).await.expect("submit");

        assert!(queue.cancel_job(&job.id).await);

        assert!(!queue.has_pending_phase(&job.id).await);
        assert!(!queue.has_pending_timeout(&job.id).await);
        let cancelled = queue.get_job(&job.id).await.expect("job");
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert!(cancelled.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_work() {
        let queue = queue();
        let job = queue.submit(config()).await.expect("submit");
        queue.start_cleanup_sweeper().await;

        queue.shutdown().await;

        assert!(!queue.has_pending_phase(&job.id).await);
        assert!(!queue.has_pending_timeout(&job.id).await);
        tokio::time::sleep(Duration::from_secs(5)).await;
        let job = queue.get_job(&job.id).await.expect("job");
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_enqueue_leaves_no_handles() {
        let gate = Arc::new(Notify::new());
        let queue = queue_with(Arc::new(GatedScheduler {
            inner: TokioScheduler::new(),
            gate: Arc::clone(&gate),
            armed: AtomicBool::new(true),
        }));
        let job = Job::new(config());

        let enqueuing = {
            let queue = queue.clone();
            let job = job.clone();
            tokio::spawn(async move { queue.enqueue(job).await })
        };
        while queue.get_job(&job.id).await.is_err() {
            tokio::task::yield_now().await;
        }

        assert!(queue.cancel_job(&job.id).await);
        gate.notify_one();
        enqueuing.await.expect("join").expect("enqueue");

        assert!(!queue.has_pending_phase(&job.id).await);
        assert!(!queue.has_pending_timeout(&job.id).await);
        let cancelled = queue.get_job(&job.id).await.expect("job");
        assert_eq!(cancelled.status, JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_tasks_do_not_keep_queue_alive() {
        let queue = queue();
        let job = queue.submit(config()).await.expect("submit");
        assert!(queue.has_pending_timeout(&job.id).await);

        let weak = queue.downgrade();
        drop(queue);
        assert!(weak.upgrade().is_none());

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn reported_secs_round_up_partial_seconds() {
        assert_eq!(reported_secs(Duration::from_secs(600)), 600);
        assert_eq!(reported_secs(Duration::from_millis(1_500)), 2);
        assert_eq!(reported_secs(Duration::from_millis(200)), 1);
        assert_eq!(reported_secs(Duration::ZERO), 0);
    }
}
