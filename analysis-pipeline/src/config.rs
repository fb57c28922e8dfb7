use std::time::Duration;

use common::utils::config::AppConfig;

#[derive(Debug, Clone)]
pub struct AnalysisTuning {
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub phase_delay_ms: u64,
    pub job_timeout_secs: u64,
    pub retention_secs: u64,
    pub cleanup_interval_secs: u64,
    pub summary_cost_per_1k_tokens: f64,
    pub summary_chars_per_token: usize,
}

impl Default for AnalysisTuning {
    fn default() -> Self {
        Self {
            batch_size: 5,
            inter_batch_delay_ms: 2_000,
            phase_delay_ms: 100,
            job_timeout_secs: 10 * 60,
            retention_secs: 60 * 60,
            cleanup_interval_secs: 5 * 60,
            summary_cost_per_1k_tokens: 0.002,
            summary_chars_per_token: 4,
        }
    }
}

impl From<&AppConfig> for AnalysisTuning {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_size: config.analysis_batch_size,
            inter_batch_delay_ms: config.analysis_batch_delay_ms,
            phase_delay_ms: config.analysis_phase_delay_ms,
            job_timeout_secs: config.analysis_job_timeout_secs,
            retention_secs: config.analysis_retention_secs,
            cleanup_interval_secs: config.analysis_cleanup_interval_secs,
            summary_cost_per_1k_tokens: config.summary_cost_per_1k_tokens,
            summary_chars_per_token: config.summary_chars_per_token,
        }
    }
}

impl AnalysisTuning {
    /// Batch size clamped to at least one session.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn phase_delay(&self) -> Duration {
        Duration::from_millis(self.phase_delay_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::from_std(Duration::from_secs(self.retention_secs))
            .unwrap_or_else(|_| chrono::Duration::days(365))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// Number of batches needed for `session_count` sessions.
    pub fn batch_count(&self, session_count: usize) -> usize {
        session_count.div_ceil(self.effective_batch_size())
    }
}
