use std::sync::Arc;

use chrono::Utc;
use common::storage::types::session_analysis::{AnalysisOutcome, TokenUsage};
use tracing::{info, warn};

use crate::{config::AnalysisTuning, error::JobError};

use super::{context::PhaseContext, PhaseOutcome};

/// Picks up a job that was already moved into `generating_summary`.
pub(super) async fn resume(ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome, JobError> {
    let outcome = ctx
        .job
        .outcome()
        .cloned()
        .ok_or_else(|| JobError::DataMissing("analysis results".into()))?;
    finish(ctx, outcome).await
}

/// Generates the summary, completes the job and hands the outcome to the
/// result store. Neither a failed summary nor a failed store fails the job.
pub(super) async fn finish(
    ctx: &mut PhaseContext<'_>,
    mut outcome: AnalysisOutcome,
) -> Result<PhaseOutcome, JobError> {
    if outcome.results.is_empty() {
        info!(job_id = %ctx.job_id, "no sessions analysed, skipping summary");
    } else {
        let summarizer = Arc::clone(&ctx.inner.services.summarizer);
        match summarizer.summarize(&outcome.results).await {
            Ok(summary) => {
                let usage = estimate_summary_usage(&summary, &ctx.inner.tuning);
                outcome.token_usage.add(&usage);
                outcome.summary = Some(summary);
            }
            Err(err) => {
                warn!(
                    job_id = %ctx.job_id,
                    analysis_id = %ctx.analysis_id,
                    error = %err,
                    "summary generation failed, completing without summary"
                );
            }
        }
    }

    let completed = outcome.clone();
    if !ctx
        .apply(|job| job.complete(completed, Utc::now()))
        .await?
    {
        return Ok(ctx.discarded());
    }
    ctx.inner.clear_handles(&ctx.job_id).await;

    info!(
        job_id = %ctx.job_id,
        analysis_id = %ctx.analysis_id,
        sessions_processed = outcome.results.len(),
        tokens_used = outcome.token_usage.total_tokens,
        estimated_cost = outcome.token_usage.cost,
        "analysis job completed"
    );

    let results = Arc::clone(&ctx.inner.services.results);
    if let Err(err) = results.store(&ctx.analysis_id, &outcome).await {
        warn!(
            job_id = %ctx.job_id,
            analysis_id = %ctx.analysis_id,
            error = %err,
            "failed to store analysis results"
        );
    }

    Ok(PhaseOutcome::Finished)
}

/// Rough token and cost estimate for a generated summary, based on its
/// length in characters.
#[allow(clippy::cast_precision_loss)]
fn estimate_summary_usage(summary: &str, tuning: &AnalysisTuning) -> TokenUsage {
    let chars = summary.chars().count();
    let tokens = u64::try_from(chars / tuning.summary_chars_per_token.max(1)).unwrap_or(u64::MAX);
    TokenUsage {
        prompt_tokens: 0,
        completion_tokens: tokens,
        total_tokens: tokens,
        cost: tokens as f64 / 1000.0 * tuning.summary_cost_per_1k_tokens,
    }
}
