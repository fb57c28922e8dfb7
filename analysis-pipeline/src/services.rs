use std::{collections::BTreeMap, fmt::Write as _, sync::Arc};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            analysis_report::AnalysisReport,
            session_analysis::{
                AnalysisOutcome, ClassificationSet, SessionAnalysis, SessionOutcome,
                SessionTranscript, TokenUsage,
            },
        },
    },
    utils::config::AppConfig,
};
use tokio::sync::mpsc;

/// Incremental report emitted while sessions are being discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryProgress {
    pub step: String,
    pub sessions_found: usize,
}

pub type DiscoveryProgressSender = mpsc::UnboundedSender<DiscoveryProgress>;

/// Everything the analyzer needs for one batch. The classifications are the
/// labels accumulated so far, handed over so the analyzer can reuse them.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub sessions: Vec<SessionTranscript>,
    pub classifications: ClassificationSet,
    pub model_id: String,
    pub api_key: String,
    pub additional_context: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchAnalysis {
    pub sessions: Vec<SessionAnalysis>,
    pub classifications: ClassificationSet,
    pub token_usage: TokenUsage,
}

#[async_trait]
pub trait SessionDiscovery: Send + Sync {
    async fn discover(
        &self,
        config: &crate::job::AnalysisConfig,
        progress: DiscoveryProgressSender,
    ) -> Result<Vec<SessionTranscript>, AppError>;
}

#[async_trait]
pub trait BatchAnalyzer: Send + Sync {
    async fn analyze(&self, request: BatchRequest) -> Result<BatchAnalysis, AppError>;
}

#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    async fn summarize(&self, results: &[SessionAnalysis]) -> Result<String, AppError>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn store(&self, analysis_id: &str, outcome: &AnalysisOutcome) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct AnalysisServices {
    pub discovery: Arc<dyn SessionDiscovery>,
    pub analyzer: Arc<dyn BatchAnalyzer>,
    pub summarizer: Arc<dyn SummaryGenerator>,
    pub results: Arc<dyn ResultStore>,
}

impl AnalysisServices {
    pub fn new(
        discovery: Arc<dyn SessionDiscovery>,
        analyzer: Arc<dyn BatchAnalyzer>,
        summarizer: Arc<dyn SummaryGenerator>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            discovery,
            analyzer,
            summarizer,
            results,
        }
    }

    /// Wires the caller's discovery and analyzer with the OpenAI summary
    /// generator and the SurrealDB result store.
    pub async fn with_defaults(
        discovery: Arc<dyn SessionDiscovery>,
        analyzer: Arc<dyn BatchAnalyzer>,
        db: Arc<SurrealDbClient>,
        config: &AppConfig,
    ) -> Result<Self, AppError> {
        let client = Arc::new(Client::with_config(
            OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.openai_base_url),
        ));

        let results = SurrealResultStore::new(db).await?;

        Ok(Self::new(
            discovery,
            analyzer,
            Arc::new(OpenAiSummaryGenerator::new(
                client,
                config.summary_model.clone(),
            )),
            Arc::new(results),
        ))
    }
}

pub static SUMMARY_SYSTEM_MESSAGE: &str = "You are reviewing analysed chatbot conversations. \
Given aggregated counts of user intents, outcomes, transfer reasons and drop-off locations, \
write a short plain-text report for the bot owner. Lead with the most common intents, point out \
where users are transferred to a human or drop off, and suggest concrete improvements. \
Do not invent numbers that are not in the input.";

pub struct OpenAiSummaryGenerator {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAiSummaryGenerator {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl SummaryGenerator for OpenAiSummaryGenerator {
    async fn summarize(&self, results: &[SessionAnalysis]) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(SUMMARY_SYSTEM_MESSAGE).into(),
                ChatCompletionRequestUserMessage::from(build_summary_prompt(results)).into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or(AppError::LLMParsing(
                "No content found in LLM response".into(),
            ))
    }
}

/// Condenses the per-session results into label counts for the summary
/// prompt.
pub fn build_summary_prompt(results: &[SessionAnalysis]) -> String {
    let mut intents: BTreeMap<&str, usize> = BTreeMap::new();
    let mut transfer_reasons: BTreeMap<&str, usize> = BTreeMap::new();
    let mut drop_offs: BTreeMap<&str, usize> = BTreeMap::new();
    let mut contained = 0_usize;
    let mut transferred = 0_usize;

    for result in results {
        *intents.entry(result.general_intent.as_str()).or_default() += 1;
        match result.outcome {
            SessionOutcome::Contained => contained += 1,
            SessionOutcome::Transfer => transferred += 1,
        }
        if let Some(reason) = result.transfer_reason.as_deref() {
            *transfer_reasons.entry(reason).or_default() += 1;
        }
        if let Some(location) = result.drop_off_location.as_deref() {
            *drop_offs.entry(location).or_default() += 1;
        }
    }

    let mut prompt = format!(
        "Sessions analysed: {}\nContained: {contained}\nTransferred: {transferred}\n",
        results.len()
    );
    append_counts(&mut prompt, "General intents", &intents);
    append_counts(&mut prompt, "Transfer reasons", &transfer_reasons);
    append_counts(&mut prompt, "Drop-off locations", &drop_offs);
    prompt
}

fn append_counts(prompt: &mut String, title: &str, counts: &BTreeMap<&str, usize>) {
    if counts.is_empty() {
        return;
    }
    let mut sorted: Vec<(&str, usize)> = counts.iter().map(|(label, n)| (*label, *n)).collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let _ = writeln!(prompt, "\n{title}:");
    for (label, count) in sorted {
        let _ = writeln!(prompt, "- {label}: {count}");
    }
}

pub struct SurrealResultStore {
    db: Arc<SurrealDbClient>,
}

impl SurrealResultStore {
    /// Ensures the report indexes exist before any report is written.
    pub async fn new(db: Arc<SurrealDbClient>) -> Result<Self, AppError> {
        db.build_indexes().await?;
        Ok(Self { db })
    }
}

#[async_trait]
impl ResultStore for SurrealResultStore {
    async fn store(&self, analysis_id: &str, outcome: &AnalysisOutcome) -> Result<(), AppError> {
        AnalysisReport::store(analysis_id, outcome.clone(), &self.db).await?;
        Ok(())
    }
}
