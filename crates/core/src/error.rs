use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(String),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("invalid response from {backend}: {details}")]
    Backend { backend: String, details: String },

    #[error("invalid table name: {0}")]
    InvalidTableName(String),

    #[error("embedding dimension {actual} does not match store dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_) => StoreError::Connection(error.to_string()),
            other => StoreError::Backend {
                backend: "pgvector".to_string(),
                details: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("malformed stream line: {0}")]
    MalformedStream(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path does not exist: {0}")]
    MissingPath(String),

    #[error("path is not a directory: {0}")]
    NotADirectory(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("unsupported file type: {0} (expected txt or md)")]
    UnsupportedFileType(String),

    #[error("file is not valid utf-8: {0}")]
    InvalidEncoding(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("embedding failed for document {document_id}: {details}")]
    Embedding { document_id: String, details: String },

    #[error("embedding dimension {actual} does not match configured dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("question is empty")]
    EmptyQuestion,

    #[error("question embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("query vector dimension {actual} does not match stored dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("answer generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("answer generation timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("an answer is already being generated for this session")]
    Busy,

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to build model client: {0}")]
    Client(String),
}

impl StoreError {
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_connection_errors() {
        let error = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(error.is_connection());
    }

    #[test]
    fn row_errors_are_backend_errors() {
        let error = StoreError::from(sqlx::Error::RowNotFound);
        assert!(!error.is_connection());
        assert!(error.to_string().contains("pgvector"));
    }
}
