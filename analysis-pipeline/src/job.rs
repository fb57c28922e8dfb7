use chrono::{DateTime, NaiveDate, Utc};
use common::storage::types::session_analysis::{
    AnalysisOutcome, SessionTranscript, TokenUsage,
};
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use uuid::Uuid;

use crate::error::JobError;

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Sampling,
    Analyzing,
    GeneratingSummary,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Sampling => "sampling",
            JobPhase::Analyzing => "analyzing",
            JobPhase::GeneratingSummary => "generating_summary",
        }
    }
}

/// Marker for the current phase as shown to pollers.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    InProgress,
    Complete,
    Error,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SamplingProgress {
    pub sessions_found: usize,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchProgress {
    pub batches_completed: usize,
    pub total_batches: usize,
    pub sessions_processed: usize,
    pub tokens_used: u64,
    pub estimated_cost: f64,
}

/// Phase specific counters. Each variant only carries what is meaningful for
/// that phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "phase", content = "counters", rename_all = "snake_case")]
pub enum PhaseProgress {
    Sampling(SamplingProgress),
    Analyzing(BatchProgress),
    GeneratingSummary(BatchProgress),
}

impl PhaseProgress {
    pub fn sessions_found(&self) -> Option<usize> {
        match self {
            PhaseProgress::Sampling(progress) => Some(progress.sessions_found),
            _ => None,
        }
    }

    pub fn batches(&self) -> Option<&BatchProgress> {
        match self {
            PhaseProgress::Analyzing(progress) | PhaseProgress::GeneratingSummary(progress) => {
                Some(progress)
            }
            PhaseProgress::Sampling(_) => None,
        }
    }

    fn batches_mut(&mut self) -> Option<&mut BatchProgress> {
        match self {
            PhaseProgress::Analyzing(progress) | PhaseProgress::GeneratingSummary(progress) => {
                Some(progress)
            }
            PhaseProgress::Sampling(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    pub current_step: String,
    pub last_updated: DateTime<Utc>,
    pub error: Option<String>,
    pub background_job_status: JobStatus,
    pub state: PhaseState,
    pub detail: PhaseProgress,
}

impl JobProgress {
    fn queued(now: DateTime<Utc>) -> Self {
        Self {
            current_step: "Queued".to_string(),
            last_updated: now,
            error: None,
            background_job_status: JobStatus::Queued,
            state: PhaseState::InProgress,
            detail: PhaseProgress::Sampling(SamplingProgress::default()),
        }
    }
}

/// Caller supplied parameters of one analysis request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub session_count: usize,
    pub model_id: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    #[serde(default)]
    pub additional_context: Option<String>,
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), JobError> {
        if self.start_date > self.end_date {
            return Err(JobError::InvalidConfiguration(
                "start date must not be after end date".into(),
            ));
        }
        if self.session_count == 0 {
            return Err(JobError::InvalidConfiguration(
                "session count must be greater than zero".into(),
            ));
        }
        if self.model_id.trim().is_empty() {
            return Err(JobError::InvalidConfiguration("model id is required".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SessionData {
    Transcripts(Vec<SessionTranscript>),
    Report(AnalysisOutcome),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub analysis_id: String,
    pub status: JobStatus,
    pub phase: JobPhase,
    pub progress: JobProgress,
    pub config: Option<AnalysisConfig>,
    pub session_data: Option<SessionData>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum JobTransition {
    Start,
    Complete,
    Fail,
}

impl JobTransition {
    fn as_str(self) -> &'static str {
        match self {
            JobTransition::Start => "start",
            JobTransition::Complete => "complete",
            JobTransition::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PhaseTransition {
    BeginAnalysis,
    BeginSummary,
}

impl PhaseTransition {
    fn as_str(self) -> &'static str {
        match self {
            PhaseTransition::BeginAnalysis => "begin_analysis",
            PhaseTransition::BeginSummary => "begin_summary",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobLifecycleMachine,
        initial: Queued,
        states: [Queued, Running, Completed, Failed],
        events {
            start {
                transition: { from: Queued, to: Running }
            }
            complete {
                transition: { from: Running, to: Completed }
            }
            fail {
                transition: { from: Queued, to: Failed }
                transition: { from: Running, to: Failed }
            }
        }
    }

    pub(super) fn queued() -> JobLifecycleMachine<(), Queued> {
        JobLifecycleMachine::new(())
    }

    pub(super) fn running() -> JobLifecycleMachine<(), Running> {
        queued()
            .start()
            .expect("start transition from Queued should exist")
    }
}

mod phases {
    use super::state_machine;

    state_machine! {
        name: PhaseMachine,
        initial: Sampling,
        states: [Sampling, Analyzing, GeneratingSummary],
        events {
            begin_analysis {
                transition: { from: Sampling, to: Analyzing }
            }
            begin_summary {
                transition: { from: Analyzing, to: GeneratingSummary }
            }
        }
    }

    pub(super) fn sampling() -> PhaseMachine<(), Sampling> {
        PhaseMachine::new(())
    }

    pub(super) fn analyzing() -> PhaseMachine<(), Analyzing> {
        sampling()
            .begin_analysis()
            .expect("begin_analysis transition from Sampling should exist")
    }
}

fn invalid_transition(from: &str, event: &str) -> JobError {
    JobError::InvalidTransition {
        from: from.to_string(),
        event: event.to_string(),
    }
}

fn compute_next_status(status: JobStatus, event: JobTransition) -> Result<JobStatus, JobError> {
    use lifecycle::*;
    let reject = || invalid_transition(status.as_str(), event.as_str());
    match (status, event) {
        (JobStatus::Queued, JobTransition::Start) => {
            queued().start().map(|_| JobStatus::Running).map_err(|_| reject())
        }
        (JobStatus::Running, JobTransition::Complete) => running()
            .complete()
            .map(|_| JobStatus::Completed)
            .map_err(|_| reject()),
        (JobStatus::Queued, JobTransition::Fail) => {
            queued().fail().map(|_| JobStatus::Failed).map_err(|_| reject())
        }
        (JobStatus::Running, JobTransition::Fail) => {
            running().fail().map(|_| JobStatus::Failed).map_err(|_| reject())
        }
        _ => Err(invalid_transition(status.as_str(), event.as_str())),
    }
}

fn compute_next_phase(phase: JobPhase, event: PhaseTransition) -> Result<JobPhase, JobError> {
    use phases::*;
    let reject = || invalid_transition(phase.as_str(), event.as_str());
    match (phase, event) {
        (JobPhase::Sampling, PhaseTransition::BeginAnalysis) => sampling()
            .begin_analysis()
            .map(|_| JobPhase::Analyzing)
            .map_err(|_| reject()),
        (JobPhase::Analyzing, PhaseTransition::BeginSummary) => analyzing()
            .begin_summary()
            .map(|_| JobPhase::GeneratingSummary)
            .map_err(|_| reject()),
        _ => Err(invalid_transition(phase.as_str(), event.as_str())),
    }
}

impl Job {
    /// A fresh sampling job with newly generated job and analysis ids.
    pub fn new(config: AnalysisConfig) -> Self {
        Self::with_ids(
            Uuid::new_v4().to_string(),
            Uuid::new_v4().to_string(),
            Some(config),
        )
    }

    pub fn with_ids(id: String, analysis_id: String, config: Option<AnalysisConfig>) -> Self {
        let now = Utc::now();
        Self {
            id,
            analysis_id,
            status: JobStatus::Queued,
            phase: JobPhase::Sampling,
            progress: JobProgress::queued(now),
            config,
            session_data: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn batch_progress(&self) -> Option<&BatchProgress> {
        self.progress.detail.batches()
    }

    pub fn outcome(&self) -> Option<&AnalysisOutcome> {
        match &self.session_data {
            Some(SessionData::Report(outcome)) => Some(outcome),
            _ => None,
        }
    }

    /// Checks that `next` is a legal replacement for this record: terminal
    /// records are frozen, status and phase only move forward.
    pub fn validate_successor(&self, next: &Job) -> Result<(), JobError> {
        if self.is_terminal() {
            return Err(JobError::JobTerminal(self.id.clone()));
        }

        if next.status != self.status {
            let event = match next.status {
                JobStatus::Running => JobTransition::Start,
                JobStatus::Completed => JobTransition::Complete,
                JobStatus::Failed => JobTransition::Fail,
                JobStatus::Queued => {
                    return Err(invalid_transition(self.status.as_str(), "requeue"))
                }
            };
            compute_next_status(self.status, event)?;
        }

        if next.phase != self.phase {
            let event = match next.phase {
                JobPhase::Analyzing => PhaseTransition::BeginAnalysis,
                JobPhase::GeneratingSummary => PhaseTransition::BeginSummary,
                JobPhase::Sampling => {
                    return Err(invalid_transition(self.phase.as_str(), "restart_sampling"))
                }
            };
            compute_next_phase(self.phase, event)?;
        }

        Ok(())
    }

    pub(crate) fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        if self.status == JobStatus::Running {
            return Ok(());
        }
        self.status = compute_next_status(self.status, JobTransition::Start)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub(crate) fn record_discovery(&mut self, step: String, sessions_found: usize) {
        self.progress.current_step = step;
        if let PhaseProgress::Sampling(progress) = &mut self.progress.detail {
            progress.sessions_found = sessions_found;
        }
    }

    pub(crate) fn begin_analysis(
        &mut self,
        sessions: Vec<SessionTranscript>,
        total_batches: usize,
    ) -> Result<(), JobError> {
        self.phase = compute_next_phase(self.phase, PhaseTransition::BeginAnalysis)?;
        self.progress.current_step = format!(
            "Found {} sessions, {total_batches} batches queued for analysis",
            sessions.len()
        );
        self.progress.state = PhaseState::InProgress;
        self.progress.detail = PhaseProgress::Analyzing(BatchProgress {
            total_batches,
            ..BatchProgress::default()
        });
        self.session_data = Some(SessionData::Transcripts(sessions));
        Ok(())
    }

    pub(crate) fn record_batch_started(
        &mut self,
        batch_number: usize,
        total_batches: usize,
    ) -> Result<(), JobError> {
        self.progress.current_step = format!("Analyzing batch {batch_number} of {total_batches}");
        let progress = self.batches_mut()?;
        progress.batches_completed = batch_number.saturating_sub(1);
        progress.total_batches = total_batches;
        Ok(())
    }

    pub(crate) fn record_batch_totals(
        &mut self,
        sessions_processed: usize,
        usage: &TokenUsage,
    ) -> Result<(), JobError> {
        let progress = self.batches_mut()?;
        progress.sessions_processed = sessions_processed;
        progress.tokens_used = usage.total_tokens;
        progress.estimated_cost = usage.cost;
        Ok(())
    }

    pub(crate) fn begin_summary(
        &mut self,
        total_batches: usize,
        outcome: AnalysisOutcome,
    ) -> Result<(), JobError> {
        self.phase = compute_next_phase(self.phase, PhaseTransition::BeginSummary)?;
        let mut progress = self.batches_mut()?.clone();
        progress.batches_completed = total_batches;
        progress.sessions_processed = outcome.results.len();
        progress.tokens_used = outcome.token_usage.total_tokens;
        progress.estimated_cost = outcome.token_usage.cost;
        self.progress.detail = PhaseProgress::GeneratingSummary(progress);
        self.progress.current_step = "Generating summary".to_string();
        self.session_data = Some(SessionData::Report(outcome));
        Ok(())
    }

    pub(crate) fn complete(
        &mut self,
        outcome: AnalysisOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        self.status = compute_next_status(self.status, JobTransition::Complete)?;
        let progress = self.batches_mut()?;
        progress.sessions_processed = outcome.results.len();
        progress.tokens_used = outcome.token_usage.total_tokens;
        progress.estimated_cost = outcome.token_usage.cost;
        self.progress.current_step = "Analysis complete".to_string();
        self.progress.state = PhaseState::Complete;
        self.session_data = Some(SessionData::Report(outcome));
        self.completed_at = Some(now);
        Ok(())
    }

    pub(crate) fn mark_failed(&mut self, message: String, now: DateTime<Utc>) -> Result<(), JobError> {
        self.status = compute_next_status(self.status, JobTransition::Fail)?;
        self.progress.current_step = "Failed".to_string();
        self.progress.state = PhaseState::Error;
        self.progress.error = Some(message.clone());
        self.error = Some(message);
        self.completed_at = Some(now);
        Ok(())
    }

    fn batches_mut(&mut self) -> Result<&mut BatchProgress, JobError> {
        let phase = self.phase;
        self.progress.detail.batches_mut().ok_or_else(|| {
            JobError::DataMissing(format!(
                "batch progress is not tracked during {}",
                phase.as_str()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date"),
            end_date: NaiveDate::from_ymd_opt(2024, 1, 31).expect("valid date"),
            session_count: 12,
            model_id: "gpt-4o-mini".into(),
            api_key: "sk-test".into(),
            additional_context: None,
        }
    }

    #[test]
    fn new_job_defaults() {
        let job = Job::new(config());

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.phase, JobPhase::Sampling);
        assert_eq!(job.progress.detail.sessions_found(), Some(0));
        assert_eq!(job.progress.state, PhaseState::InProgress);
        assert_ne!(job.id, job.analysis_id);
        assert!(job.completed_at.is_none());
        assert!(job.error.is_none());
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        assert_eq!(
            compute_next_status(JobStatus::Queued, JobTransition::Start),
            Ok(JobStatus::Running)
        );
        assert_eq!(
            compute_next_status(JobStatus::Running, JobTransition::Complete),
            Ok(JobStatus::Completed)
        );
        assert_eq!(
            compute_next_status(JobStatus::Queued, JobTransition::Fail),
            Ok(JobStatus::Failed)
        );
        assert!(compute_next_status(JobStatus::Queued, JobTransition::Complete).is_err());
        assert!(compute_next_status(JobStatus::Completed, JobTransition::Fail).is_err());
        assert!(compute_next_status(JobStatus::Failed, JobTransition::Start).is_err());
    }

    #[test]
    fn phases_only_move_forward() {
        assert_eq!(
            compute_next_phase(JobPhase::Sampling, PhaseTransition::BeginAnalysis),
            Ok(JobPhase::Analyzing)
        );
        assert_eq!(
            compute_next_phase(JobPhase::Analyzing, PhaseTransition::BeginSummary),
            Ok(JobPhase::GeneratingSummary)
        );
        assert!(compute_next_phase(JobPhase::Sampling, PhaseTransition::BeginSummary).is_err());
        assert!(
            compute_next_phase(JobPhase::GeneratingSummary, PhaseTransition::BeginAnalysis)
                .is_err()
        );
    }

    #[test]
    fn successor_validation_rejects_regressions() {
        let mut current = Job::new(config());
        current.mark_running(Utc::now()).expect("start");
        current
            .begin_analysis(Vec::new(), 0)
            .expect("begin analysis");

        let mut regressed = current.clone();
        regressed.phase = JobPhase::Sampling;
        assert!(current.validate_successor(&regressed).is_err());

        let mut requeued = current.clone();
        requeued.status = JobStatus::Queued;
        assert!(current.validate_successor(&requeued).is_err());

        let mut advanced = current.clone();
        advanced
            .begin_summary(0, AnalysisOutcome::default())
            .expect("begin summary");
        assert!(current.validate_successor(&advanced).is_ok());
    }

    #[test]
    fn terminal_jobs_are_frozen() {
        let mut job = Job::new(config());
        job.mark_failed("boom".into(), Utc::now()).expect("fail");

        let next = job.clone();
        assert_eq!(
            job.validate_successor(&next),
            Err(JobError::JobTerminal(job.id.clone()))
        );
        assert_eq!(job.progress.state, PhaseState::Error);
        assert_eq!(job.progress.error.as_deref(), Some("boom"));
    }

    #[test]
    fn batch_progress_tracks_attempts() {
        let mut job = Job::new(config());
        job.mark_running(Utc::now()).expect("start");
        job.begin_analysis(Vec::new(), 3).expect("begin analysis");

        job.record_batch_started(2, 3).expect("batch started");
        let progress = job.batch_progress().expect("batch progress");
        assert_eq!(progress.batches_completed, 1);
        assert_eq!(progress.total_batches, 3);

        job.begin_summary(3, AnalysisOutcome::default())
            .expect("begin summary");
        assert_eq!(job.batch_progress().map(|p| p.batches_completed), Some(3));
    }

    #[test]
    fn config_validation() {
        assert!(config().validate().is_ok());

        let mut inverted = config();
        inverted.start_date = NaiveDate::from_ymd_opt(2024, 2, 1).expect("valid date");
        assert!(matches!(
            inverted.validate(),
            Err(JobError::InvalidConfiguration(_))
        ));

        let mut empty = config();
        empty.session_count = 0;
        assert!(empty.validate().is_err());
    }

    #[test]
    fn api_key_is_not_serialized() {
        let json = serde_json::to_string(&Job::new(config())).expect("serialize job");
        assert!(!json.contains("sk-test"));
        assert!(json.contains("\"phase\":\"sampling\""));
    }
}
