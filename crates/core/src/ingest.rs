use crate::chunking::{build_chunks, ChunkingConfig};
use crate::embeddings::Embedder;
use crate::error::IngestError;
use crate::models::{Document, IngestionOptions, FILE_NAME_KEY};
use crate::traits::ChunkStore;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["txt", "md", "markdown"];

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
}

/// Supported files under `folder`, sorted. An unreadable `folder` is an
/// error; unreadable entries below it are returned as skipped.
pub fn discover_documents(folder: &Path) -> Result<(Vec<PathBuf>, Vec<SkippedFile>), IngestError> {
    let mut files = Vec::new();
    let mut skipped = Vec::new();

    for item in WalkDir::new(folder) {
        let entry = match item {
            Ok(entry) => entry,
            Err(error) => {
                let path = error.path().unwrap_or(folder).to_path_buf();
                if error.depth() == 0 || path == folder {
                    let reason = error.to_string();
                    let io = error
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other(reason));
                    return Err(IngestError::Io(io));
                }
                warn!(path = %path.display(), reason = %error, "unreadable entry");
                skipped.push(SkippedFile {
                    path,
                    reason: error.to_string(),
                });
                continue;
            }
        };
        if entry.file_type().is_file() && is_supported(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    Ok((files, skipped))
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Builds a [`Document`] from raw upload content; the name is the identifier.
pub fn document_from_upload(name: &str, bytes: &[u8]) -> Result<Document, IngestError> {
    let file_name = Path::new(name)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| IngestError::MissingFileName(name.to_string()))?;

    if !is_supported(Path::new(file_name)) {
        return Err(IngestError::UnsupportedFileType(file_name.to_string()));
    }

    let text = std::str::from_utf8(bytes)
        .map_err(|_| IngestError::InvalidEncoding(file_name.to_string()))?;

    let file_type = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_lowercase();

    Ok(Document::new(file_name, text)
        .with_metadata("file_type", file_type)
        .with_metadata("file_size", bytes.len().to_string())
        .with_metadata("checksum", digest_bytes(bytes))
        .with_metadata("ingested_at", Utc::now().to_rfc3339()))
}

pub fn load_document(path: &Path) -> Result<Document, IngestError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;
    let bytes = fs::read(path)?;

    Ok(document_from_upload(name, &bytes)?
        .with_metadata("file_path", path.to_string_lossy().to_string()))
}

#[derive(Debug)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IngestionReport {
    pub documents: usize,
    pub chunks: usize,
    pub skipped: Vec<SkippedFile>,
}

/// Chunk, embed and store documents. A document's chunk set is written
/// all-or-nothing: every chunk is embedded before anything reaches the store.
pub struct IngestionPipeline {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn ChunkStore>,
    chunking: ChunkingConfig,
    dimensions: usize,
}

impl IngestionPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn ChunkStore>,
        options: &IngestionOptions,
    ) -> Result<Self, IngestError> {
        Ok(Self {
            embedder,
            store,
            chunking: ChunkingConfig::try_from(options)?,
            dimensions: options.embedding_dimensions,
        })
    }

    pub fn chunking(&self) -> ChunkingConfig {
        self.chunking
    }

    pub async fn ingest(&self, document: &Document) -> Result<usize, IngestError> {
        let mut document = document.clone();
        document
            .metadata
            .insert(FILE_NAME_KEY.to_string(), document.id.clone());

        let mut chunks = build_chunks(&document, self.chunking);
        if chunks.is_empty() {
            // An emptied document still replaces whatever was stored under its id.
            self.store.replace_document(&document.id, &[]).await?;
            info!(document_id = %document.id, chunk_count = 0, "document has no text, previous chunks cleared");
            return Ok(0);
        }

        for chunk in &mut chunks {
            let embedding = self
                .embedder
                .embed(&chunk.text)
                .await
                .map_err(|error| IngestError::Embedding {
                    document_id: document.id.clone(),
                    details: format!("chunk {}: {error}", chunk.chunk_index),
                })?;

            if embedding.len() != self.dimensions {
                return Err(IngestError::DimensionMismatch {
                    expected: self.dimensions,
                    actual: embedding.len(),
                });
            }
            chunk.embedding = embedding;
        }

        let written = self.store.replace_document(&document.id, &chunks).await?;
        info!(document_id = %document.id, chunk_count = written, "ingested document");
        Ok(written)
    }

    pub async fn ingest_upload(&self, name: &str, bytes: &[u8]) -> Result<usize, IngestError> {
        let document = document_from_upload(name, bytes)?;
        self.ingest(&document).await
    }

    /// Ingests every supported file under `folder`. Files that cannot be read
    /// or embedded are skipped and reported; an unreachable store aborts.
    pub async fn ingest_directory(&self, folder: &Path) -> Result<IngestionReport, IngestError> {
        if !folder.exists() {
            return Err(IngestError::MissingPath(folder.display().to_string()));
        }
        if !folder.is_dir() {
            return Err(IngestError::NotADirectory(folder.display().to_string()));
        }

        let (files, unreadable) = discover_documents(folder)?;
        info!(folder = %folder.display(), file_count = files.len(), "discovered documents");

        let mut report = IngestionReport {
            skipped: unreadable,
            ..IngestionReport::default()
        };
        let mut seen = HashSet::new();

        for path in files {
            let outcome = match load_document(&path) {
                Ok(document) => {
                    if !seen.insert(document.id.clone()) {
                        warn!(
                            document_id = %document.id,
                            path = %path.display(),
                            "duplicate file name, later file replaces the earlier one"
                        );
                    }
                    self.ingest(&document).await
                }
                Err(error) => Err(error),
            };

            match outcome {
                Ok(0) => {}
                Ok(chunks) => {
                    report.documents += 1;
                    report.chunks += chunks;
                }
                Err(IngestError::Store(error)) if error.is_connection() => {
                    return Err(IngestError::Store(error));
                }
                Err(error) => {
                    warn!(path = %path.display(), reason = %error, "skipped file");
                    report.skipped.push(SkippedFile {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::EmbeddingError;
    use crate::stores::InMemoryStore;
    use async_trait::async_trait;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    const DIMS: usize = 64;

    fn pipeline(store: Arc<InMemoryStore>, chunk_size: usize, overlap: usize) -> IngestionPipeline {
        let options = IngestionOptions {
            chunk_size,
            chunk_overlap: overlap,
            embedding_dimensions: DIMS,
        };
        IngestionPipeline::new(Arc::new(CharacterNgramEmbedder::new(DIMS)), store, &options)
            .unwrap()
    }

    struct FailingOnSecondChunk;

    #[async_trait]
    impl Embedder for FailingOnSecondChunk {
        fn dimensions(&self) -> usize {
            DIMS
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.starts_with("efgh") {
                return Err(EmbeddingError::BackendResponse {
                    backend: "test".to_string(),
                    details: "model crashed".to_string(),
                });
            }
            Ok(CharacterNgramEmbedder::new(DIMS).embed_sync(text))
        }
    }

    #[test]
    fn discover_documents_is_recursive_and_filtered() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.txt")).and_then(|mut file| file.write_all(b"alpha"))?;
        File::create(nested.join("b.MD")).and_then(|mut file| file.write_all(b"beta"))?;
        File::create(base.join("c.pdf")).and_then(|mut file| file.write_all(b"%PDF"))?;

        let (files, skipped) = discover_documents(base)?;
        assert_eq!(files.len(), 2);
        assert!(skipped.is_empty());
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() {
        assert_eq!(digest_bytes(b"abc"), digest_bytes(b"abc"));
        assert_ne!(digest_bytes(b"abc"), digest_bytes(b"abd"));
    }

    #[test]
    fn uploads_use_name_as_identifier() {
        let document = document_from_upload("notes.txt", b"hello").unwrap();
        assert_eq!(document.id, "notes.txt");
        assert_eq!(document.metadata.get(FILE_NAME_KEY).map(String::as_str), Some("notes.txt"));
        assert_eq!(document.metadata.get("file_type").map(String::as_str), Some("txt"));
    }

    #[test]
    fn uploads_reject_unsupported_or_binary_content() {
        assert!(matches!(
            document_from_upload("report.pdf", b"%PDF"),
            Err(IngestError::UnsupportedFileType(_))
        ));
        assert!(matches!(
            document_from_upload("notes.txt", &[0xff, 0xfe, 0x00]),
            Err(IngestError::InvalidEncoding(_))
        ));
    }

    #[tokio::test]
    async fn ingest_writes_every_chunk() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let pipeline = pipeline(store.clone(), 4, 1);

        let written = pipeline
            .ingest(&Document::new("letters.txt", "abcdefghij"))
            .await
            .unwrap();

        assert_eq!(written, 3);
        assert_eq!(store.chunk_count().await, 3);
    }

    #[tokio::test]
    async fn embedding_failure_writes_nothing() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let options = IngestionOptions {
            chunk_size: 4,
            chunk_overlap: 0,
            embedding_dimensions: DIMS,
        };
        let pipeline =
            IngestionPipeline::new(Arc::new(FailingOnSecondChunk), store.clone(), &options)
                .unwrap();

        let result = pipeline
            .ingest(&Document::new("letters.txt", "abcdefghijkl"))
            .await;

        assert!(matches!(result, Err(IngestError::Embedding { .. })));
        assert_eq!(store.chunk_count().await, 0);
        assert!(store.document_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reingesting_replaces_previous_chunks() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let pipeline = pipeline(store.clone(), 4, 1);

        pipeline
            .ingest(&Document::new("doc.txt", "abcdefghijklmnop"))
            .await
            .unwrap();
        pipeline.ingest(&Document::new("doc.txt", "abc")).await.unwrap();

        assert_eq!(store.chunk_count().await, 1);
    }

    #[tokio::test]
    async fn emptied_document_clears_previous_chunks() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let pipeline = pipeline(store.clone(), 16, 4);

        let first = pipeline
            .ingest(&Document::new("doc.txt", "old secret content here"))
            .await
            .unwrap();
        assert!(first > 1);

        let second = pipeline.ingest(&Document::new("doc.txt", "   ")).await.unwrap();

        assert_eq!(second, 0);
        assert_eq!(store.chunk_count().await, 0);
        assert!(store.document_ids().await.unwrap().is_empty());
        assert!(store.chunk_ids("doc.txt").await.unwrap().is_empty());
    }

    #[cfg(unix)]
    fn lock(path: &Path) -> std::io::Result<bool> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o000))?;
        // Privileged users read through mode 000; the check is meaningless then.
        Ok(fs::read_dir(path).is_err())
    }

    #[cfg(unix)]
    fn unlock(path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_directory_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let locked = dir.path().join("locked");
        fs::create_dir(&locked)?;
        fs::write(locked.join("one.txt"), "hidden")?;

        let enforced = lock(&locked)?;
        let store = Arc::new(InMemoryStore::new(DIMS));
        let result = pipeline(store, 512, 20).ingest_directory(&locked).await;
        unlock(&locked)?;

        if enforced {
            assert!(matches!(result, Err(IngestError::Io(_))));
        }
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_subdirectory_is_reported_as_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("one.txt"), "The capital of Bulgaria is Sofia.")?;
        let locked = dir.path().join("private");
        fs::create_dir(&locked)?;
        fs::write(locked.join("two.txt"), "hidden")?;

        let enforced = lock(&locked)?;
        let store = Arc::new(InMemoryStore::new(DIMS));
        let report = pipeline(store, 512, 20).ingest_directory(dir.path()).await;
        unlock(&locked)?;

        let report = report?;
        if enforced {
            assert_eq!(report.documents, 1);
            assert_eq!(report.skipped.len(), 1);
            assert_eq!(report.skipped[0].path, locked);
        } else {
            assert_eq!(report.documents, 2);
        }
        Ok(())
    }

    #[tokio::test]
    async fn directory_ingestion_reports_counts_and_skips() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("one.txt"), "The capital of Bulgaria is Sofia.")?;
        fs::write(dir.path().join("two.md"), "# Notes\n\nRivers and mountains.")?;
        fs::write(dir.path().join("broken.txt"), [0xffu8, 0xfe])?;
        fs::write(dir.path().join("empty.md"), "   ")?;

        let store = Arc::new(InMemoryStore::new(DIMS));
        let report = pipeline(store.clone(), 512, 20)
            .ingest_directory(dir.path())
            .await?;

        assert_eq!(report.documents, 2);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(
            store.document_ids().await?,
            vec!["one.txt".to_string(), "two.md".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let result = pipeline(store, 512, 20)
            .ingest_directory(Path::new("/definitely/not/here"))
            .await;
        assert!(matches!(result, Err(IngestError::MissingPath(_))));
    }

    #[tokio::test]
    async fn file_path_is_not_a_directory() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file = dir.path().join("one.txt");
        fs::write(&file, "text")?;

        let store = Arc::new(InMemoryStore::new(DIMS));
        let result = pipeline(store, 512, 20).ingest_directory(&file).await;
        assert!(matches!(result, Err(IngestError::NotADirectory(_))));
        Ok(())
    }
}
