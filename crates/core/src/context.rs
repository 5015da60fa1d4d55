//! Process-wide application context.
//!
//! Built once at startup in a fixed order (config, store, schema, embedder,
//! language model, pipelines) and passed by reference to every handler.
//! [`AppContext::shutdown`] releases the store's connections.

use crate::config::AppConfig;
use crate::embeddings::{Embedder, OllamaEmbedder};
use crate::engine::AnswerEngine;
use crate::error::{ConfigError, ContextError, IngestError, RegistryError};
use crate::ingest::{IngestionPipeline, IngestionReport};
use crate::llm::{LanguageModel, OllamaChatModel};
use crate::registry::DocumentRegistry;
use crate::session::ChatSession;
use crate::stores::PgVectorStore;
use crate::traits::ChunkStore;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct AppContext {
    store: Arc<dyn ChunkStore>,
    pipeline: IngestionPipeline,
    registry: DocumentRegistry,
    engine: AnswerEngine,
    greeting: String,
    citation_heading: String,
}

impl AppContext {
    pub async fn connect(config: AppConfig) -> Result<Self, ContextError> {
        let store = PgVectorStore::connect(&config.store, config.ingestion.embedding_dimensions).await?;
        store.ensure_schema().await?;
        info!(table = %store.table(), "vector store ready");

        let embedder = OllamaEmbedder::new(
            &config.models.ollama_url,
            &config.models.embed_model,
            config.ingestion.embedding_dimensions,
            config.models.request_timeout,
        )
        .map_err(|error| ContextError::Client(format!("embedding client: {error}")))?;

        let model = OllamaChatModel::new(&config.models.ollama_url, &config.models.llm_model)
            .map_err(|error| ContextError::Client(format!("language model client: {error}")))?;

        info!(
            llm_model = %model.model(),
            embed_model = %embedder.model(),
            ollama_url = %config.models.ollama_url,
            "models configured"
        );

        Self::assemble(config, Arc::new(store), Arc::new(embedder), Arc::new(model))
    }

    /// Wires already-constructed collaborators together.
    pub fn assemble(
        config: AppConfig,
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
    ) -> Result<Self, ContextError> {
        let pipeline = IngestionPipeline::new(embedder.clone(), store.clone(), &config.ingestion)
            .map_err(|error| ConfigError::Invalid {
                key: "RAG_CHUNK_SIZE".to_string(),
                reason: error.to_string(),
            })?;
        let registry = DocumentRegistry::new(store.clone(), config.listing_ttl);
        let engine = AnswerEngine::new(embedder, store.clone(), model, config.retrieval);

        Ok(Self {
            store,
            pipeline,
            registry,
            engine,
            greeting: config.greeting,
            citation_heading: config.citation_heading,
        })
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &AnswerEngine {
        &self.engine
    }

    pub fn new_session(&self) -> ChatSession {
        ChatSession::with_greeting(&self.greeting).with_citation_heading(&self.citation_heading)
    }

    pub async fn ingest_directory(&self, folder: &Path) -> Result<IngestionReport, IngestError> {
        let report = self.pipeline.ingest_directory(folder).await?;
        self.registry.invalidate().await;
        Ok(report)
    }

    pub async fn upload(&self, name: &str, bytes: &[u8]) -> Result<usize, IngestError> {
        let written = self.pipeline.ingest_upload(name, bytes).await?;
        self.registry.invalidate().await;
        Ok(written)
    }

    pub async fn list_documents(&self) -> Result<Vec<String>, RegistryError> {
        self.registry.list_documents().await
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<usize, RegistryError> {
        self.registry.delete_document(document_id).await
    }

    pub async fn shutdown(self) {
        self.store.close().await;
        info!("application context shut down");
    }
}
