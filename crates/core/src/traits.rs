use crate::error::StoreError;
use crate::models::{Chunk, RetrievedChunk};
use async_trait::async_trait;

/// Durable home of chunk records: text, embedding and metadata keyed by the
/// parent document identifier.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Creates the backing table/collection if needed.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Replaces every chunk of `document_id` with `chunks` in one unit of work.
    /// Writers of the same identifier are serialized; the last one wins.
    async fn replace_document(&self, document_id: &str, chunks: &[Chunk])
        -> Result<usize, StoreError>;

    /// Removes every chunk of `document_id`, returning how many were removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError>;

    /// Distinct document identifiers with at least one live chunk, sorted.
    /// A store that has never been written to yields an empty list.
    async fn document_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Chunk identifiers of one document ordered by chunk index.
    async fn chunk_ids(&self, document_id: &str) -> Result<Vec<String>, StoreError>;

    /// Dimension of the vectors already stored, if any.
    async fn stored_dimensions(&self) -> Result<Option<usize>, StoreError>;

    /// Top-`top_k` chunks by descending cosine similarity to `query_vector`.
    async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError>;

    async fn close(&self) {}
}
