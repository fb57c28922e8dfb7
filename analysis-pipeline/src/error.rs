use thiserror::Error;

/// Failures of the job queue itself. The display string of a variant is what
/// pollers see in `job.error` once a job fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job not found: {0}")]
    JobNotFound(String),
    #[error("Job already exists: {0}")]
    DuplicateJob(String),
    #[error("Job is already finished: {0}")]
    JobTerminal(String),
    #[error("Invalid analysis configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Analysis configuration is missing")]
    ConfigurationMissing,
    #[error("Required job data is missing: {0}")]
    DataMissing(String),
    #[error("{0}")]
    CollaboratorFailure(String),
    #[error("Job timed out after {0} seconds")]
    Timeout(u64),
    #[error("Job cancelled by user")]
    Cancelled,
    #[error("Invalid job transition: {from} -> {event}")]
    InvalidTransition { from: String, event: String },
}
