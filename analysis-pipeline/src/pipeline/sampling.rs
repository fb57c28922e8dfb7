use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::{error::JobError, services::DiscoveryProgress};

use super::{context::PhaseContext, PhaseOutcome};

/// Discovers the sessions to analyse and moves the job into `analyzing`.
pub(super) async fn run(ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome, JobError> {
    let config = ctx
        .job
        .config
        .clone()
        .ok_or(JobError::ConfigurationMissing)?;

    if !ctx
        .apply(|job| {
            job.record_discovery("Discovering sessions".into(), 0);
            Ok(())
        })
        .await?
    {
        return Ok(ctx.discarded());
    }

    let discovery_service = Arc::clone(&ctx.inner.services.discovery);
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<DiscoveryProgress>();
    let mut discovery = discovery_service.discover(&config, progress_tx);

    let result = loop {
        tokio::select! {
            biased;
            Some(progress) = progress_rx.recv() => {
                if !record(ctx, progress).await? {
                    return Ok(ctx.discarded());
                }
            }
            result = &mut discovery => break result,
        }
    };

    while let Ok(progress) = progress_rx.try_recv() {
        if !record(ctx, progress).await? {
            return Ok(ctx.discarded());
        }
    }

    let sessions = result.map_err(|err| JobError::CollaboratorFailure(err.to_string()))?;
    let session_count = sessions.len();
    let total_batches = ctx.inner.tuning.batch_count(session_count);

    if !ctx
        .apply(|job| job.begin_analysis(sessions, total_batches))
        .await?
    {
        return Ok(ctx.discarded());
    }

    info!(
        job_id = %ctx.job_id,
        analysis_id = %ctx.analysis_id,
        sessions = session_count,
        total_batches,
        "session discovery finished"
    );

    Ok(PhaseOutcome::Advance)
}

async fn record(ctx: &mut PhaseContext<'_>, progress: DiscoveryProgress) -> Result<bool, JobError> {
    ctx.apply(|job| {
        job.record_discovery(progress.step, progress.sessions_found);
        Ok(())
    })
    .await
}
