use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Metadata key holding the originating document identifier.
pub const FILE_NAME_KEY: &str = "file_name";

pub const CHUNK_INDEX_KEY: &str = "chunk_index";

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

impl Document {
    /// Builds a document whose identifier is also recorded under [`FILE_NAME_KEY`].
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let id = id.into();
        let mut metadata = Metadata::new();
        metadata.insert(FILE_NAME_KEY.to_string(), id.clone());
        Self {
            id,
            text: text.into(),
            metadata,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: u64,
    pub text: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

impl Chunk {
    /// The identifier a citation should show for this chunk.
    pub fn source_name(&self) -> &str {
        self.metadata
            .get(FILE_NAME_KEY)
            .map(String::as_str)
            .unwrap_or(&self.document_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_dimensions: usize,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 20,
            embedding_dimensions: crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an intelligent assistant. Your task is to answer \
the user's questions using the provided context. If the context does not contain the answer, \
say so plainly.";

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub similarity_cutoff: Option<f32>,
    pub context_max_chars: usize,
    pub system_prompt: String,
    pub generation_timeout: Duration,
    pub embedding_dimensions: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: 2,
            similarity_cutoff: None,
            context_max_chars: 6_000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            generation_timeout: Duration::from_secs(120),
            embedding_dimensions: crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_records_identifier_as_file_name() {
        let document = Document::new("notes.txt", "hello");
        assert_eq!(
            document.metadata.get(FILE_NAME_KEY).map(String::as_str),
            Some("notes.txt")
        );
    }

    #[test]
    fn source_name_falls_back_to_document_id() {
        let chunk = Chunk {
            chunk_id: "c".to_string(),
            document_id: "doc-1".to_string(),
            chunk_index: 0,
            text: String::new(),
            metadata: Metadata::new(),
            embedding: Vec::new(),
        };
        assert_eq!(chunk.source_name(), "doc-1");
    }
}
