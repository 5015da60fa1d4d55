//! PostgreSQL + pgvector [`ChunkStore`].
//!
//! One table holds every chunk:
//! `id`, `chunk_id`, `document_id`, `chunk_index`, `text`, `metadata_` (jsonb)
//! and `embedding` (`vector(N)`). Document writes and deletes run in a single
//! transaction guarded by a transaction-scoped advisory lock on the document
//! identifier, so concurrent writers of one identifier are serialized.

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::models::{Chunk, Metadata, RetrievedChunk, FILE_NAME_KEY};
use crate::traits::ChunkStore;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, error, info};

const UNDEFINED_TABLE: &str = "42P01";

pub struct PgVectorStore {
    pool: PgPool,
    table: String,
    dimensions: usize,
}

impl PgVectorStore {
    pub async fn connect(config: &StoreConfig, dimensions: usize) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|error| {
                error!(host = %config.host, port = config.port, error = %error, "database connection failed");
                StoreError::Connection(error.to_string())
            })?;

        info!(host = %config.host, database = %config.database, "connected to postgres");
        Self::from_pool(pool, &config.table_name, dimensions)
    }

    /// Wraps an existing pool. `table_name` gets the `data_` prefix.
    pub fn from_pool(pool: PgPool, table_name: &str, dimensions: usize) -> Result<Self, StoreError> {
        Ok(Self {
            pool,
            table: table_identifier(table_name)?,
            dimensions,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn check_dimensions(&self, actual: usize) -> Result<(), StoreError> {
        if actual != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                actual,
            });
        }
        Ok(())
    }
}

pub fn table_identifier(table_name: &str) -> Result<String, StoreError> {
    let pattern = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,57}$")
        .map_err(|error| StoreError::InvalidTableName(error.to_string()))?;
    if !pattern.is_match(table_name) {
        return Err(StoreError::InvalidTableName(table_name.to_string()));
    }
    Ok(format!("data_{}", table_name.to_lowercase()))
}

fn is_undefined_table(error: &sqlx::Error) -> bool {
    let code = error.as_database_error().and_then(|database| database.code());
    is_undefined_table_code(code.as_deref())
}

fn is_undefined_table_code(code: Option<&str>) -> bool {
    code == Some(UNDEFINED_TABLE)
}

/// pgvector accepts vectors in their text form: `[1,2,3]`.
fn vector_literal(values: &[f32]) -> String {
    format!(
        "[{}]",
        values
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

fn metadata_from_value(value: Value) -> Metadata {
    value
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter_map(|(key, value)| value.as_str().map(|text| (key.clone(), text.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn row_to_hit(row: &PgRow) -> Result<RetrievedChunk, sqlx::Error> {
    let metadata: Value = row.try_get("metadata_")?;
    let chunk_index: i64 = row.try_get("chunk_index")?;
    let score: f64 = row.try_get("score")?;

    Ok(RetrievedChunk {
        chunk: Chunk {
            chunk_id: row.try_get("chunk_id")?,
            document_id: row.try_get("document_id")?,
            chunk_index: chunk_index.max(0) as u64,
            text: row.try_get("text")?,
            metadata: metadata_from_value(metadata),
            embedding: Vec::new(),
        },
        score: score as f32,
    })
}

#[async_trait]
impl ChunkStore for PgVectorStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let table = &self.table;
        let dimensions = self.dimensions;

        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;

        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                id BIGSERIAL PRIMARY KEY, \
                chunk_id TEXT NOT NULL UNIQUE, \
                document_id TEXT NOT NULL, \
                chunk_index BIGINT NOT NULL, \
                text TEXT NOT NULL, \
                metadata_ JSONB NOT NULL DEFAULT '{{}}'::jsonb, \
                embedding vector({dimensions}) NOT NULL\
            )"
        );
        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index =
            format!("CREATE INDEX IF NOT EXISTS {table}_document_id_idx ON {table} (document_id)");
        sqlx::query(&create_index).execute(&self.pool).await?;

        debug!(table = %table, dimensions, "ensured pgvector table");
        Ok(())
    }

    async fn replace_document(
        &self,
        document_id: &str,
        chunks: &[Chunk],
    ) -> Result<usize, StoreError> {
        for chunk in chunks {
            self.check_dimensions(chunk.embedding.len())?;
        }

        let table = &self.table;
        let insert_sql = format!(
            "INSERT INTO {table} (chunk_id, document_id, chunk_index, text, metadata_, embedding) \
             VALUES ($1, $2, $3, $4, $5, $6::vector)"
        );

        let mut transaction = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(document_id)
            .execute(&mut *transaction)
            .await?;

        let removed = sqlx::query(&format!("DELETE FROM {table} WHERE document_id = $1"))
            .bind(document_id)
            .execute(&mut *transaction)
            .await?
            .rows_affected();

        for chunk in chunks {
            let metadata = serde_json::to_value(&chunk.metadata)?;
            sqlx::query(&insert_sql)
                .bind(&chunk.chunk_id)
                .bind(document_id)
                .bind(chunk.chunk_index as i64)
                .bind(&chunk.text)
                .bind(metadata)
                .bind(vector_literal(&chunk.embedding))
                .execute(&mut *transaction)
                .await?;
        }

        transaction.commit().await?;

        debug!(document_id, removed, written = chunks.len(), "replaced document chunks");
        Ok(chunks.len())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError> {
        let table = &self.table;
        let mut transaction = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(document_id)
            .execute(&mut *transaction)
            .await?;

        let removed = match sqlx::query(&format!("DELETE FROM {table} WHERE document_id = $1"))
            .bind(document_id)
            .execute(&mut *transaction)
            .await
        {
            Ok(result) => result.rows_affected(),
            Err(error) if is_undefined_table(&error) => 0,
            Err(error) => return Err(error.into()),
        };

        transaction.commit().await?;
        Ok(removed as usize)
    }

    async fn document_ids(&self) -> Result<Vec<String>, StoreError> {
        let table = &self.table;
        let sql = format!(
            "SELECT DISTINCT metadata_->>'{FILE_NAME_KEY}' AS file_name \
             FROM {table} \
             WHERE metadata_->>'{FILE_NAME_KEY}' IS NOT NULL \
             ORDER BY file_name"
        );

        match sqlx::query(&sql).fetch_all(&self.pool).await {
            Ok(rows) => rows
                .iter()
                .map(|row| row.try_get::<String, _>("file_name").map_err(StoreError::from))
                .collect(),
            Err(error) if is_undefined_table(&error) => Ok(Vec::new()),
            Err(error) => Err(error.into()),
        }
    }

    async fn chunk_ids(&self, document_id: &str) -> Result<Vec<String>, StoreError> {
        let table = &self.table;
        let sql = format!(
            "SELECT chunk_id FROM {table} WHERE document_id = $1 ORDER BY chunk_index"
        );

        match sqlx::query(&sql).bind(document_id).fetch_all(&self.pool).await {
            Ok(rows) => rows
                .iter()
                .map(|row| row.try_get::<String, _>("chunk_id").map_err(StoreError::from))
                .collect(),
            Err(error) if is_undefined_table(&error) => Ok(Vec::new()),
            Err(error) => Err(error.into()),
        }
    }

    async fn stored_dimensions(&self) -> Result<Option<usize>, StoreError> {
        let table = &self.table;
        let sql = format!("SELECT vector_dims(embedding) AS dims FROM {table} LIMIT 1");

        match sqlx::query(&sql).fetch_optional(&self.pool).await {
            Ok(Some(row)) => {
                let dims: i32 = row.try_get("dims")?;
                Ok(Some(dims.max(0) as usize))
            }
            Ok(None) => Ok(None),
            Err(error) if is_undefined_table(&error) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError> {
        self.check_dimensions(query_vector.len())?;

        let table = &self.table;
        // `<=>` is cosine distance; score = 1 - distance.
        let sql = format!(
            "SELECT chunk_id, document_id, chunk_index, text, metadata_, \
                    1 - (embedding <=> $1::vector) AS score \
             FROM {table} \
             ORDER BY embedding <=> $1::vector \
             LIMIT $2"
        );

        let rows = match sqlx::query(&sql)
            .bind(vector_literal(query_vector))
            .bind(top_k as i64)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(error) if is_undefined_table(&error) => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let hits = rows
            .iter()
            .map(row_to_hit)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(table = %table, top_k, hits = hits.len(), "pgvector search");
        Ok(hits)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
