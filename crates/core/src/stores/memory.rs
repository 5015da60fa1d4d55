//! In-process [`ChunkStore`] using cosine similarity over a document-keyed map.
//!
//! Chunks are grouped by their parent document identifier, so replacing or
//! deleting a document touches exactly its own chunk set. All operations go
//! through one `tokio::sync::RwLock`, which also serializes writers of the
//! same identifier.

use crate::error::StoreError;
use crate::models::{Chunk, RetrievedChunk};
use crate::traits::ChunkStore;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug)]
pub struct InMemoryStore {
    dimensions: usize,
    documents: RwLock<BTreeMap<String, Vec<Chunk>>>,
}

impl InMemoryStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            documents: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub async fn chunk_count(&self) -> usize {
        self.documents.read().await.values().map(Vec::len).sum()
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn replace_document(
        &self,
        document_id: &str,
        chunks: &[Chunk],
    ) -> Result<usize, StoreError> {
        if let Some(bad) = chunks.iter().find(|chunk| chunk.embedding.len() != self.dimensions) {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: bad.embedding.len(),
            });
        }

        let mut documents = self.documents.write().await;
        documents.remove(document_id);
        if !chunks.is_empty() {
            documents.insert(document_id.to_string(), chunks.to_vec());
        }
        Ok(chunks.len())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError> {
        let mut documents = self.documents.write().await;
        Ok(documents.remove(document_id).map(|chunks| chunks.len()).unwrap_or(0))
    }

    async fn document_ids(&self) -> Result<Vec<String>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents.keys().cloned().collect())
    }

    async fn chunk_ids(&self, document_id: &str) -> Result<Vec<String>, StoreError> {
        let documents = self.documents.read().await;
        let mut chunks = documents.get(document_id).cloned().unwrap_or_default();
        chunks.sort_by_key(|chunk| chunk.chunk_index);
        Ok(chunks.into_iter().map(|chunk| chunk.chunk_id).collect())
    }

    async fn stored_dimensions(&self) -> Result<Option<usize>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .values()
            .flatten()
            .next()
            .map(|chunk| chunk.embedding.len()))
    }

    async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError> {
        if query_vector.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: query_vector.len(),
            });
        }

        let documents = self.documents.read().await;
        let mut scored: Vec<RetrievedChunk> = documents
            .values()
            .flatten()
            .map(|chunk| RetrievedChunk {
                score: cosine_similarity(&chunk.embedding, query_vector),
                chunk: chunk.clone(),
            })
            .collect();

        scored.sort_by(|left, right| right.score.total_cmp(&left.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}
