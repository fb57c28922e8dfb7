use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of a chatbot conversation as delivered by the transcript source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptTurn {
    pub speaker: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTranscript {
    pub session_id: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub turns: Vec<TranscriptTurn>,
}

impl SessionTranscript {
    pub fn new(session_id: impl Into<String>, turns: Vec<TranscriptTurn>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: None,
            turns,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Contained,
    Transfer,
}

/// Facts extracted for a single session by the batch analyzer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionAnalysis {
    pub session_id: String,
    pub general_intent: String,
    pub outcome: SessionOutcome,
    #[serde(default)]
    pub transfer_reason: Option<String>,
    #[serde(default)]
    pub drop_off_location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Distinct labels discovered so far, per category.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassificationSet {
    pub general_intents: BTreeSet<String>,
    pub transfer_reasons: BTreeSet<String>,
    pub drop_off_locations: BTreeSet<String>,
}

impl ClassificationSet {
    /// Union-merges `other` into `self`. Labels are never removed.
    pub fn merge(&mut self, other: ClassificationSet) {
        self.general_intents.extend(other.general_intents);
        self.transfer_reasons.extend(other.transfer_reasons);
        self.drop_off_locations.extend(other.drop_off_locations);
    }

    /// Sizes as `(general_intents, transfer_reasons, drop_off_locations)`.
    pub fn sizes(&self) -> (usize, usize, usize) {
        (
            self.general_intents.len(),
            self.transfer_reasons.len(),
            self.drop_off_locations.len(),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.cost += other.cost;
    }
}

/// Everything produced by one analysis: per-session facts, the label sets,
/// the optional narrative summary and what it cost.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisOutcome {
    pub results: Vec<SessionAnalysis>,
    pub classifications: ClassificationSet,
    #[serde(default)]
    pub summary: Option<String>,
    pub token_usage: TokenUsage,
}
