use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::session_analysis::{
    AnalysisOutcome, ClassificationSet, SessionAnalysis, TokenUsage,
};

stored_object!(AnalysisReport, "analysis_report", {
    analysis_id: String,
    results: Vec<SessionAnalysis>,
    classifications: ClassificationSet,
    summary: Option<String>,
    token_usage: TokenUsage
});

impl AnalysisReport {
    /// Reports are keyed by their analysis id, one report per analysis.
    pub fn new(analysis_id: &str, outcome: AnalysisOutcome) -> Self {
        let now = Utc::now();
        Self {
            id: analysis_id.to_string(),
            created_at: now,
            updated_at: now,
            analysis_id: analysis_id.to_string(),
            results: outcome.results,
            classifications: outcome.classifications,
            summary: outcome.summary,
            token_usage: outcome.token_usage,
        }
    }

    pub async fn store(
        analysis_id: &str,
        outcome: AnalysisOutcome,
        db: &SurrealDbClient,
    ) -> Result<AnalysisReport, AppError> {
        let report = Self::new(analysis_id, outcome);
        db.store_item(report)
            .await?
            .ok_or_else(|| AppError::InternalError("analysis report was not stored".into()))
    }

    pub async fn get_by_analysis_id(
        analysis_id: &str,
        db: &SurrealDbClient,
    ) -> Result<AnalysisReport, AppError> {
        db.get_item::<AnalysisReport>(analysis_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("analysis report {analysis_id}")))
    }

    pub fn into_outcome(self) -> AnalysisOutcome {
        AnalysisOutcome {
            results: self.results,
            classifications: self.classifications,
            summary: self.summary,
            token_usage: self.token_usage,
        }
    }
}
