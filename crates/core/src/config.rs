//! Environment-provided configuration.
//!
//! The datastore settings are mandatory and are validated once at startup;
//! everything else has a default.

use crate::embeddings::{DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_EMBEDDING_MODEL};
use crate::citations::DEFAULT_CITATION_HEADING;
use crate::error::ConfigError;
use crate::llm::{DEFAULT_LLM_MODEL, DEFAULT_OLLAMA_URL};
use crate::models::{IngestionOptions, RetrievalOptions};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_TABLE_NAME: &str = "agentic_rag_documents";

pub const DEFAULT_LISTING_TTL: Duration = Duration::from_secs(10);

#[derive(Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub table_name: String,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("table_name", &self.table_name)
            .finish()
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ConfigError::Missing(key.to_string()))
        };

        let host = required("DB_HOST")?;
        let port = parse_value::<u16>("DB_PORT", &required("DB_PORT")?)?;
        let user = required("DB_USER")?;
        let password = required("DB_PASSWORD")?;
        let database = required("DB_NAME")?;
        let table_name = lookup("RAG_TABLE_NAME").unwrap_or_else(|| DEFAULT_TABLE_NAME.to_string());

        Ok(Self {
            host,
            port,
            user,
            password,
            database,
            table_name,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub ollama_url: Url,
    pub llm_model: String,
    pub embed_model: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub models: ModelConfig,
    pub ingestion: IngestionOptions,
    pub retrieval: RetrievalOptions,
    pub listing_ttl: Duration,
    pub greeting: String,
    pub citation_heading: String,
}

pub const DEFAULT_GREETING: &str =
    "Hello! I'm ready to answer questions based on the documents in my knowledge base.";

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let store = StoreConfig::from_lookup(&lookup)?;

        let optional = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let raw_url = optional("OLLAMA_URL").unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        let ollama_url = parse_base_url("OLLAMA_URL", &raw_url)?;

        let timeout_secs = optional("LLM_TIMEOUT_SECS")
            .map(|value| parse_value::<u64>("LLM_TIMEOUT_SECS", &value))
            .transpose()?
            .unwrap_or(120);
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "LLM_TIMEOUT_SECS".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        let request_timeout = Duration::from_secs(timeout_secs);

        let dimensions = optional("EMBED_DIM")
            .map(|value| parse_value::<usize>("EMBED_DIM", &value))
            .transpose()?
            .unwrap_or(DEFAULT_EMBEDDING_DIMENSIONS);
        if dimensions == 0 {
            return Err(ConfigError::Invalid {
                key: "EMBED_DIM".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        let mut ingestion = IngestionOptions {
            embedding_dimensions: dimensions,
            ..IngestionOptions::default()
        };
        if let Some(value) = optional("RAG_CHUNK_SIZE") {
            ingestion.chunk_size = parse_value("RAG_CHUNK_SIZE", &value)?;
        }
        if let Some(value) = optional("RAG_CHUNK_OVERLAP") {
            ingestion.chunk_overlap = parse_value("RAG_CHUNK_OVERLAP", &value)?;
        }
        if ingestion.chunk_size == 0 || ingestion.chunk_overlap >= ingestion.chunk_size {
            return Err(ConfigError::Invalid {
                key: "RAG_CHUNK_OVERLAP".to_string(),
                reason: format!(
                    "overlap {} must be smaller than chunk size {}",
                    ingestion.chunk_overlap, ingestion.chunk_size
                ),
            });
        }

        let mut retrieval = RetrievalOptions {
            embedding_dimensions: dimensions,
            generation_timeout: request_timeout,
            ..RetrievalOptions::default()
        };
        if let Some(value) = optional("RAG_TOP_K") {
            retrieval.top_k = parse_value("RAG_TOP_K", &value)?;
            if retrieval.top_k == 0 {
                return Err(ConfigError::Invalid {
                    key: "RAG_TOP_K".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if let Some(value) = optional("RAG_SIMILARITY_CUTOFF") {
            let cutoff: f32 = parse_value("RAG_SIMILARITY_CUTOFF", &value)?;
            if !(-1.0..=1.0).contains(&cutoff) {
                return Err(ConfigError::Invalid {
                    key: "RAG_SIMILARITY_CUTOFF".to_string(),
                    reason: format!("{cutoff} is outside the cosine range [-1, 1]"),
                });
            }
            retrieval.similarity_cutoff = Some(cutoff);
        }
        if let Some(value) = optional("RAG_SYSTEM_PROMPT") {
            retrieval.system_prompt = value;
        }

        Ok(Self {
            store,
            models: ModelConfig {
                ollama_url,
                llm_model: optional("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
                embed_model: optional("EMBED_MODEL")
                    .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
                request_timeout,
            },
            ingestion,
            retrieval,
            listing_ttl: DEFAULT_LISTING_TTL,
            greeting: optional("RAG_GREETING").unwrap_or_else(|| DEFAULT_GREETING.to_string()),
            citation_heading: optional("RAG_CITATION_HEADING")
                .unwrap_or_else(|| DEFAULT_CITATION_HEADING.to_string()),
        })
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("{raw:?}: {error}"),
    })
}

/// Parses a base URL and guarantees a trailing slash so relative joins keep its path.
fn parse_base_url(key: &str, raw: &str) -> Result<Url, ConfigError> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|error| ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("{raw:?}: {error}"),
    })
}
