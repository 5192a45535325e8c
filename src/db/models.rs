use super::filter::SqlValue;
use super::schema::Entry;
use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use std::collections::HashMap;
use uuid::Uuid;

/// One piece of a prompt/response exchange within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct PromptMemoryEntry {
    pub id: String,
    pub role: String,
    pub conversation_id: String,
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub labels: Json<HashMap<String, String>>,
    pub prompt_metadata: Option<String>,
    /// Semi-structured identity of the orchestrator that produced the piece.
    pub orchestrator_identifier: Option<String>,
    pub original_value: String,
    pub converted_value: String,
}

impl PromptMemoryEntry {
    pub fn new(
        role: impl Into<String>,
        conversation_id: impl Into<String>,
        sequence: i64,
        value: impl Into<String>,
    ) -> Self {
        let value = value.into();
        Self {
            id: Uuid::new_v4().to_string(),
            role: role.into(),
            conversation_id: conversation_id.into(),
            sequence,
            timestamp: Utc::now(),
            labels: Json(HashMap::new()),
            prompt_metadata: None,
            orchestrator_identifier: None,
            original_value: value.clone(),
            converted_value: value,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.0.insert(key.into(), value.into());
        self
    }

    pub fn with_orchestrator(mut self, identifier: &HashMap<String, String>) -> Self {
        self.orchestrator_identifier = serde_json::to_string(identifier).ok();
        self
    }

    pub fn with_converted_value(mut self, value: impl Into<String>) -> Self {
        self.converted_value = value.into();
        self
    }
}

impl Entry for PromptMemoryEntry {
    const TABLE: &'static str = "prompt_memory_entries";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "role",
        "conversation_id",
        "sequence",
        "timestamp",
        "labels",
        "prompt_metadata",
        "orchestrator_identifier",
        "original_value",
        "converted_value",
    ];
    const DDL: &'static str = r#"
CREATE TABLE IF NOT EXISTS prompt_memory_entries (
    id TEXT PRIMARY KEY NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('system', 'user', 'assistant')),
    conversation_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    labels TEXT NOT NULL DEFAULT '{}', -- JSON object
    prompt_metadata TEXT NULL,
    orchestrator_identifier TEXT NULL, -- JSON object, not validated
    original_value TEXT NOT NULL,
    converted_value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_prompt_memory_entries_conversation
    ON prompt_memory_entries(conversation_id)
"#;

    fn values(&self) -> StoreResult<Vec<SqlValue>> {
        Ok(vec![
            self.id.as_str().into(),
            self.role.as_str().into(),
            self.conversation_id.as_str().into(),
            self.sequence.into(),
            self.timestamp.into(),
            SqlValue::json(&self.labels.0)?,
            self.prompt_metadata.clone().into(),
            self.orchestrator_identifier.clone().into(),
            self.original_value.as_str().into(),
            self.converted_value.as_str().into(),
        ])
    }
}

/// A scorer's verdict on one prompt piece.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct ScoreEntry {
    pub id: String,
    pub score_value: String,
    pub score_value_description: Option<String>,
    pub score_type: String,
    pub score_category: Option<String>,
    pub score_rationale: Option<String>,
    pub score_metadata: Option<String>,
    pub scorer_class_identifier: Json<HashMap<String, String>>,
    pub prompt_request_response_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ScoreEntry {
    pub const TRUE_FALSE: &'static str = "true_false";
    pub const FLOAT_SCALE: &'static str = "float_scale";

    pub fn new(
        prompt_request_response_id: impl Into<String>,
        score_type: impl Into<String>,
        score_value: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            score_value: score_value.into(),
            score_value_description: None,
            score_type: score_type.into(),
            score_category: None,
            score_rationale: None,
            score_metadata: None,
            scorer_class_identifier: Json(HashMap::new()),
            prompt_request_response_id: prompt_request_response_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.score_rationale = Some(rationale.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.score_category = Some(category.into());
        self
    }

    pub fn with_scorer(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.scorer_class_identifier
            .0
            .insert(key.into(), value.into());
        self
    }
}

impl Entry for ScoreEntry {
    const TABLE: &'static str = "score_entries";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "score_value",
        "score_value_description",
        "score_type",
        "score_category",
        "score_rationale",
        "score_metadata",
        "scorer_class_identifier",
        "prompt_request_response_id",
        "timestamp",
    ];
    const DDL: &'static str = r#"
CREATE TABLE IF NOT EXISTS score_entries (
    id TEXT PRIMARY KEY NOT NULL,
    score_value TEXT NOT NULL,
    score_value_description TEXT NULL,
    score_type TEXT NOT NULL CHECK (score_type IN ('true_false', 'float_scale')),
    score_category TEXT NULL,
    score_rationale TEXT NULL,
    score_metadata TEXT NULL,
    scorer_class_identifier TEXT NOT NULL DEFAULT '{}', -- JSON object
    prompt_request_response_id TEXT NOT NULL
        REFERENCES prompt_memory_entries(id),
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_score_entries_prompt
    ON score_entries(prompt_request_response_id)
"#;

    fn values(&self) -> StoreResult<Vec<SqlValue>> {
        Ok(vec![
            self.id.as_str().into(),
            self.score_value.as_str().into(),
            self.score_value_description.clone().into(),
            self.score_type.as_str().into(),
            self.score_category.clone().into(),
            self.score_rationale.clone().into(),
            self.score_metadata.clone().into(),
            SqlValue::json(&self.scorer_class_identifier.0)?,
            self.prompt_request_response_id.as_str().into(),
            self.timestamp.into(),
        ])
    }
}

/// Embedding vector computed for a prompt piece; shares the piece's id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct EmbeddingData {
    pub id: String,
    pub embedding: Json<Vec<f32>>,
    pub embedding_type_name: String,
}

impl EmbeddingData {
    pub fn new(
        prompt_id: impl Into<String>,
        embedding: Vec<f32>,
        embedding_type_name: impl Into<String>,
    ) -> Self {
        Self {
            id: prompt_id.into(),
            embedding: Json(embedding),
            embedding_type_name: embedding_type_name.into(),
        }
    }
}

impl Entry for EmbeddingData {
    const TABLE: &'static str = "embeddings";
    const COLUMNS: &'static [&'static str] = &["id", "embedding", "embedding_type_name"];
    const DDL: &'static str = r#"
CREATE TABLE IF NOT EXISTS embeddings (
    id TEXT PRIMARY KEY NOT NULL REFERENCES prompt_memory_entries(id),
    embedding TEXT NOT NULL, -- JSON array of floats
    embedding_type_name TEXT NOT NULL
)
"#;

    fn values(&self) -> StoreResult<Vec<SqlValue>> {
        // JSON has no NaN or infinity; serde_json would store them as null.
        if let Some(pos) = self.embedding.0.iter().position(|v| !v.is_finite()) {
            return Err(StoreError::InvalidEntry {
                table: Self::TABLE,
                reason: format!(
                    "embedding component {pos} is {}",
                    self.embedding.0[pos]
                ),
            });
        }
        Ok(vec![
            self.id.as_str().into(),
            SqlValue::json(&self.embedding.0)?,
            self.embedding_type_name.as_str().into(),
        ])
    }
}
