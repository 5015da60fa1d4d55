use crate::error::IngestError;
use crate::models::{Chunk, Document, IngestionOptions, CHUNK_INDEX_KEY};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, IngestError> {
        if chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap ({chunk_overlap}) must be less than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    fn step(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }
}

impl TryFrom<&IngestionOptions> for ChunkingConfig {
    type Error = IngestError;

    fn try_from(value: &IngestionOptions) -> Result<Self, Self::Error> {
        Self::new(value.chunk_size, value.chunk_overlap)
    }
}

/// Splits `text` into windows of `chunk_size` characters where each window
/// after the first starts with the last `chunk_overlap` characters of the
/// previous one. Only the final window may be shorter.
pub fn split_with_overlap(text: &str, config: ChunkingConfig) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + config.chunk_size).min(chars.len());
        pieces.push(chars[start..end].iter().collect::<String>());
        if end == chars.len() {
            break;
        }
        start += config.step();
    }

    pieces
}

/// Inverse of [`split_with_overlap`].
pub fn reassemble(pieces: &[String], config: ChunkingConfig) -> String {
    let mut text = String::new();
    for (index, piece) in pieces.iter().enumerate() {
        if index == 0 {
            text.push_str(piece);
        } else {
            text.extend(piece.chars().skip(config.chunk_overlap));
        }
    }
    text
}

pub fn build_chunks(document: &Document, config: ChunkingConfig) -> Vec<Chunk> {
    split_with_overlap(&document.text, config)
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            let chunk_index = index as u64;
            let mut metadata = document.metadata.clone();
            metadata.insert(CHUNK_INDEX_KEY.to_string(), chunk_index.to_string());

            Chunk {
                chunk_id: make_chunk_id(&document.id, chunk_index, &text),
                document_id: document.id.clone(),
                chunk_index,
                text,
                metadata,
                embedding: Vec::new(),
            }
        })
        .collect()
}

fn make_chunk_id(document_id: &str, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
