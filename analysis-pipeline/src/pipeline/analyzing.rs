use std::sync::Arc;

use common::storage::types::session_analysis::{AnalysisOutcome, SessionTranscript};
use tracing::{debug, info, warn};

use crate::{
    error::JobError,
    job::SessionData,
    services::{BatchAnalysis, BatchRequest},
};

use super::{context::PhaseContext, summary, PhaseOutcome};

/// Running totals across batches. Classifications only ever grow.
#[derive(Debug, Default)]
struct BatchAccumulator {
    outcome: AnalysisOutcome,
}

impl BatchAccumulator {
    fn absorb(&mut self, batch: BatchAnalysis) {
        self.outcome.results.extend(batch.sessions);
        self.outcome.classifications.merge(batch.classifications);
        self.outcome.token_usage.add(&batch.token_usage);
    }

    fn into_outcome(self) -> AnalysisOutcome {
        self.outcome
    }
}

pub(super) async fn run(ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome, JobError> {
    let config = ctx
        .job
        .config
        .clone()
        .ok_or_else(|| JobError::DataMissing("analysis configuration".into()))?;
    let sessions: Vec<SessionTranscript> = match &ctx.job.session_data {
        Some(SessionData::Transcripts(sessions)) => sessions.clone(),
        _ => return Err(JobError::DataMissing("session transcripts".into())),
    };

    let tuning = ctx.inner.tuning.clone();
    let analyzer = Arc::clone(&ctx.inner.services.analyzer);
    let batches: Vec<&[SessionTranscript]> =
        sessions.chunks(tuning.effective_batch_size()).collect();
    let total_batches = batches.len();
    let mut acc = BatchAccumulator::default();

    for (index, batch) in batches.iter().enumerate() {
        let batch_number = index.saturating_add(1);
        if !ctx
            .apply(|job| job.record_batch_started(batch_number, total_batches))
            .await?
        {
            return Ok(ctx.discarded());
        }

        let request = BatchRequest {
            sessions: batch.to_vec(),
            classifications: acc.outcome.classifications.clone(),
            model_id: config.model_id.clone(),
            api_key: config.api_key.clone(),
            additional_context: config.additional_context.clone(),
        };

        match analyzer.analyze(request).await {
            Ok(analysis) => {
                acc.absorb(analysis);
                let processed = acc.outcome.results.len();
                let usage = acc.outcome.token_usage;
                if !ctx
                    .apply(|job| job.record_batch_totals(processed, &usage))
                    .await?
                {
                    return Ok(ctx.discarded());
                }
                debug!(
                    job_id = %ctx.job_id,
                    batch = batch_number,
                    total_batches,
                    sessions_processed = processed,
                    tokens_used = usage.total_tokens,
                    "batch analysed"
                );
            }
            Err(err) => {
                warn!(
                    job_id = %ctx.job_id,
                    analysis_id = %ctx.analysis_id,
                    batch = batch_number,
                    total_batches,
                    error = %err,
                    "batch analysis failed, continuing with next batch"
                );
            }
        }

        if batch_number < total_batches {
            tokio::time::sleep(tuning.inter_batch_delay()).await;
        }
    }

    let outcome = acc.into_outcome();
    let (intents, transfer_reasons, drop_offs) = outcome.classifications.sizes();
    info!(
        job_id = %ctx.job_id,
        analysis_id = %ctx.analysis_id,
        total_batches,
        sessions_processed = outcome.results.len(),
        intents,
        transfer_reasons,
        drop_offs,
        "batch analysis finished"
    );

    let snapshot = outcome.clone();
    if !ctx
        .apply(|job| job.begin_summary(total_batches, snapshot))
        .await?
    {
        return Ok(ctx.discarded());
    }

    summary::finish(ctx, outcome).await
}
