use crate::db::filter::Predicate;
use crate::db::models::{EmbeddingData, PromptMemoryEntry, ScoreEntry};
use crate::db::store::MemoryStore;
use crate::error::StoreResult;
use tracing::debug;

/// Conversation-level operations, each a single insert or filtered query.
impl MemoryStore {
    pub async fn add_request_pieces(&self, pieces: &[PromptMemoryEntry]) -> StoreResult<()> {
        self.insert_many(pieces).await
    }

    pub async fn add_scores(&self, scores: &[ScoreEntry]) -> StoreResult<()> {
        self.insert_many(scores).await
    }

    pub async fn add_embeddings(&self, embeddings: &[EmbeddingData]) -> StoreResult<()> {
        self.insert_many(embeddings).await
    }

    pub async fn get_all_prompt_pieces(&self) -> StoreResult<Vec<PromptMemoryEntry>> {
        self.query(None).await
    }

    pub async fn get_all_embeddings(&self) -> StoreResult<Vec<EmbeddingData>> {
        self.query(None).await
    }

    pub async fn get_prompt_pieces_by_ids(
        &self,
        prompt_ids: &[String],
    ) -> StoreResult<Vec<PromptMemoryEntry>> {
        self.query(Some(&Predicate::is_in("id", prompt_ids)))
            .await
    }

    pub async fn get_prompt_pieces_by_conversation(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Vec<PromptMemoryEntry>> {
        self.query(Some(&Predicate::eq("conversation_id", conversation_id)))
            .await
    }

    /// Pieces whose orchestrator identifier is a JSON object with `id == orchestrator_id`.
    pub async fn get_prompt_pieces_by_orchestrator(
        &self,
        orchestrator_id: &str,
    ) -> StoreResult<Vec<PromptMemoryEntry>> {
        let pieces = self
            .query(Some(&Predicate::json_path_eq(
                "orchestrator_identifier",
                "$.id",
                orchestrator_id,
            )))
            .await?;
        debug!(orchestrator_id, count = pieces.len(), "pieces by orchestrator");
        Ok(pieces)
    }

    pub async fn get_scores_by_prompt_ids(
        &self,
        prompt_request_response_ids: &[String],
    ) -> StoreResult<Vec<ScoreEntry>> {
        self.query(Some(&Predicate::is_in(
            "prompt_request_response_id",
            prompt_request_response_ids,
        )))
        .await
    }
}
