#![allow(clippy::missing_docs_in_private_items, clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod job;
mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod services;
pub mod store;

pub use self::config::AnalysisTuning;
pub use error::JobError;
pub use job::{
    AnalysisConfig, BatchProgress, Job, JobPhase, JobProgress, JobStatus, PhaseProgress,
    PhaseState, SamplingProgress, SessionData,
};
pub use queue::AnalysisQueue;
pub use scheduler::{HandleKey, HandleKind, Scheduler, TokioScheduler};
pub use services::{
    AnalysisServices, BatchAnalysis, BatchAnalyzer, BatchRequest, DiscoveryProgress,
    DiscoveryProgressSender, OpenAiSummaryGenerator, ResultStore, SessionDiscovery,
    SummaryGenerator, SurrealResultStore,
};
