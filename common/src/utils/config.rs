use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_summary_model")]
    pub summary_model: String,
    #[serde(default = "default_batch_size")]
    pub analysis_batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub analysis_batch_delay_ms: u64,
    #[serde(default = "default_phase_delay_ms")]
    pub analysis_phase_delay_ms: u64,
    #[serde(default = "default_job_timeout_secs")]
    pub analysis_job_timeout_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub analysis_retention_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub analysis_cleanup_interval_secs: u64,
    #[serde(default = "default_summary_cost_per_1k_tokens")]
    pub summary_cost_per_1k_tokens: f64,
    #[serde(default = "default_summary_chars_per_token")]
    pub summary_chars_per_token: usize,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_summary_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_delay_ms() -> u64 {
    2_000
}

fn default_phase_delay_ms() -> u64 {
    100
}

fn default_job_timeout_secs() -> u64 {
    10 * 60
}

fn default_retention_secs() -> u64 {
    60 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

fn default_summary_cost_per_1k_tokens() -> f64 {
    0.002
}

fn default_summary_chars_per_token() -> usize {
    4
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    const MINIMAL: &str = r#"
        openai_api_key = "sk-test"
        surrealdb_address = "mem://"
        surrealdb_username = "root"
        surrealdb_password = "root"
        surrealdb_namespace = "ns"
        surrealdb_database = "db"
    "#;

    #[test]
    fn analysis_settings_fall_back_to_defaults() {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(MINIMAL, FileFormat::Toml))
            .build()
            .expect("build config")
            .try_deserialize()
            .expect("deserialize config");

        assert_eq!(config.openai_base_url, "https://api.openai.com/v1");
        assert_eq!(config.analysis_batch_size, 5);
        assert_eq!(config.analysis_job_timeout_secs, 600);
        assert_eq!(config.analysis_retention_secs, 3_600);
        assert_eq!(config.summary_chars_per_token, 4);
    }

    #[test]
    fn analysis_settings_can_be_overridden() {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(MINIMAL, FileFormat::Toml))
            .set_override("analysis_batch_size", 10_i64)
            .expect("override batch size")
            .set_override("analysis_job_timeout_secs", 30_i64)
            .expect("override timeout")
            .build()
            .expect("build config")
            .try_deserialize()
            .expect("deserialize config");

        assert_eq!(config.analysis_batch_size, 10);
        assert_eq!(config.analysis_job_timeout_secs, 30);
    }
}
