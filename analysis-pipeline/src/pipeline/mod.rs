mod analyzing;
mod context;
mod sampling;
mod summary;

use chrono::Utc;
use tracing::{debug, info};

use crate::{job::JobPhase, queue::QueueInner};

use self::context::PhaseContext;

/// What the scheduler should do after one phase execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhaseOutcome {
    /// The job moved to its next phase, which still has to run.
    Advance,
    /// The job is terminal, or its result was discarded.
    Finished,
}

/// Runs the current phase of `job_id` once.
#[tracing::instrument(skip_all, fields(job_id = %job_id))]
pub(crate) async fn dispatch(inner: &QueueInner, job_id: &str) -> PhaseOutcome {
    let Some(job) = inner.store.get(job_id).await else {
        debug!("job no longer exists, nothing to run");
        return PhaseOutcome::Finished;
    };
    if job.is_terminal() {
        debug!(status = job.status.as_str(), "job already finished");
        return PhaseOutcome::Finished;
    }

    let job = match inner
        .store
        .update_active(job_id, |job| job.mark_running(Utc::now()))
        .await
    {
        Ok(Some(job)) => job,
        Ok(None) => return PhaseOutcome::Finished,
        Err(err) => {
            inner.fail_job(job_id, &err).await;
            return PhaseOutcome::Finished;
        }
    };

    let phase = job.phase;
    info!(
        analysis_id = %job.analysis_id,
        phase = phase.as_str(),
        "running analysis phase"
    );

    let mut ctx = PhaseContext::new(inner, job);
    let result = match phase {
        JobPhase::Sampling => sampling::run(&mut ctx).await,
        JobPhase::Analyzing => analyzing::run(&mut ctx).await,
        JobPhase::GeneratingSummary => summary::resume(&mut ctx).await,
    };

    match result {
        Ok(outcome) => outcome,
        Err(err) => {
            ctx.abort(&err);
            inner.fail_job(job_id, &err).await;
            PhaseOutcome::Finished
        }
    }
}
