use crate::error::RegistryError;
use crate::traits::ChunkStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug)]
struct CachedListing {
    fetched_at: Instant,
    documents: Vec<String>,
}

/// Which documents are in the store, and removal of a whole document.
///
/// Listings may be up to `ttl` stale; [`DocumentRegistry::invalidate`] drops
/// the cached listing after a write.
pub struct DocumentRegistry {
    store: Arc<dyn ChunkStore>,
    ttl: Duration,
    cache: Mutex<Option<CachedListing>>,
}

impl DocumentRegistry {
    pub fn new(store: Arc<dyn ChunkStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub async fn list_documents(&self) -> Result<Vec<String>, RegistryError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.documents.clone());
            }
        }

        let mut documents = self.store.document_ids().await?;
        documents.sort_unstable();
        documents.dedup();
        debug!(count = documents.len(), "refreshed document listing");

        *cache = Some(CachedListing {
            fetched_at: Instant::now(),
            documents: documents.clone(),
        });
        Ok(documents)
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<usize, RegistryError> {
        let removed = self.store.delete_document(document_id).await?;
        if removed == 0 {
            return Err(RegistryError::NotFound(document_id.to_string()));
        }

        self.invalidate().await;
        info!(document_id, chunk_count = removed, "deleted document");
        Ok(removed)
    }

    pub async fn chunk_ids(&self, document_id: &str) -> Result<Vec<String>, RegistryError> {
        let ids = self.store.chunk_ids(document_id).await?;
        if ids.is_empty() {
            return Err(RegistryError::NotFound(document_id.to_string()));
        }
        Ok(ids)
    }

    pub async fn invalidate(&self) {
        self.cache.lock().await.take();
    }
}
