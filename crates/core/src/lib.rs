pub mod chunking;
pub mod citations;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod registry;
pub mod session;
pub mod stores;
pub mod traits;

pub use chunking::{build_chunks, reassemble, split_with_overlap, ChunkingConfig};
pub use citations::{collect_citations, format_citations, DEFAULT_CITATION_HEADING};
pub use config::{AppConfig, ModelConfig, StoreConfig};
pub use context::AppContext;
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, OllamaEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use engine::{assemble_context, Answer, AnswerEngine, AnswerEvent, AnswerStream};
pub use error::{
    ConfigError, ContextError, EmbeddingError, GenerationError, IngestError, RegistryError,
    RetrievalError, SessionError, StoreError,
};
pub use ingest::{
    discover_documents, document_from_upload, IngestionPipeline, IngestionReport, SkippedFile,
};
pub use llm::{ChatMessage, FragmentStream, LanguageModel, OllamaChatModel};
pub use models::{
    ChatRole, ChatTurn, Chunk, Document, IngestionOptions, Metadata, RetrievalOptions,
    RetrievedChunk, FILE_NAME_KEY,
};
pub use registry::DocumentRegistry;
pub use session::{ChatSession, SessionState};
pub use stores::{InMemoryStore, PgVectorStore};
pub use traits::ChunkStore;
