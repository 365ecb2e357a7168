use std::str::FromStr;

use chrono::{DateTime, Utc};
use quarry_llm::ModelSignature;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::error::{Result, StoreError};
use crate::store::{BoxFuture, IndexStore};
use crate::types::{
    EmbeddingRecord, FileMetadata, ModelChange, ProjectStats, ScoredRecord, cosine_similarity,
    majority_signature, model_change, normalize_rel_path,
};

const MAX_DIMENSIONS_KEY: &str = "max_dimensions";

type FileRow = (String, String, String, String, String, i64, i64, String);

type EmbeddingRow = (
    String,
    String,
    String,
    String,
    i64,
    String,
    Vec<u8>,
    i64,
    String,
    String,
    String,
    i64,
    i64,
    Option<String>,
    Option<String>,
    String,
);

const EMBEDDING_COLUMNS: &str = "id, project_id, file_id, file_path, chunk_index, content, vector, \
     dimensions, format, provider, content_hash, start_line, end_line, symbol_name, symbol_type, \
     language";

/// `SQLite`-backed index store. Vectors are stored as little-endian `f32`
/// blobs and searched by brute-force cosine similarity.
#[derive(Debug, Clone)]
pub struct SqliteIndexStore {
    pool: SqlitePool,
    dimension_limit: Option<usize>,
}

impl SqliteIndexStore {
    /// Open (or create) the database at `path` and run migrations.
    ///
    /// `:memory:` opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn open(path: &str) -> Result<Self> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            if let Some(parent) = std::path::Path::new(path).parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            format!("sqlite:{path}?mode=rwc")
        };

        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // A pooled in-memory database would give every connection its own copy.
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            dimension_limit: None,
        })
    }

    #[must_use]
    pub fn with_dimension_limit(mut self, limit: usize) -> Self {
        self.dimension_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn widest_dimensions(&self) -> Result<usize> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM index_schema WHERE key = ?")
            .bind(MAX_DIMENSIONS_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| usize::try_from(v)).transpose()?.unwrap_or(0))
    }

    async fn signatures(&self, project_id: &str) -> Result<Vec<(ModelSignature, usize)>> {
        let rows: Vec<(String, i64, String, i64)> = sqlx::query_as(
            "SELECT provider, dimensions, format, COUNT(*) FROM index_embeddings \
             WHERE project_id = ? GROUP BY provider, dimensions, format",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(provider, dims, format, count)| -> Result<(ModelSignature, usize)> {
                Ok((
                    ModelSignature::new(provider, usize::try_from(dims)?, format),
                    usize::try_from(count)?,
                ))
            })
            .collect()
    }

    fn check_limit(&self, dimensions: usize) -> Result<()> {
        match self.dimension_limit {
            Some(limit) if dimensions > limit => Err(StoreError::DimensionUnsupported {
                requested: dimensions,
                limit,
            }),
            _ => Ok(()),
        }
    }
}

fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn parse_timestamp(id: &str, raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| StoreError::Corrupt {
            id: id.to_owned(),
            reason: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn file_from_row(row: FileRow) -> Result<FileMetadata> {
    let (id, project_id, path, content_hash, language, size, line_count, last_modified) = row;
    let last_modified = parse_timestamp(&id, &last_modified)?;
    Ok(FileMetadata {
        id,
        project_id,
        path,
        content_hash,
        language,
        size: u64::try_from(size)?,
        line_count: usize::try_from(line_count)?,
        last_modified,
    })
}

fn embedding_from_row(row: EmbeddingRow) -> Result<EmbeddingRecord> {
    let (
        id,
        project_id,
        file_id,
        file_path,
        chunk_index,
        content,
        blob,
        dimensions,
        format,
        provider,
        content_hash,
        start_line,
        end_line,
        symbol_name,
        symbol_type,
        language,
    ) = row;
    let vector = blob_to_vec(&blob);
    let dimensions = usize::try_from(dimensions)?;
    if vector.len() != dimensions {
        return Err(StoreError::Corrupt {
            id,
            reason: format!("vector has {} values, expected {dimensions}", vector.len()),
        });
    }
    Ok(EmbeddingRecord {
        id,
        project_id,
        file_id,
        file_path,
        chunk_index: usize::try_from(chunk_index)?,
        content,
        vector,
        dimensions,
        format,
        provider,
        content_hash,
        start_line: usize::try_from(start_line)?,
        end_line: usize::try_from(end_line)?,
        symbol_name,
        symbol_type,
        language,
    })
}

impl IndexStore for SqliteIndexStore {
    fn store_file_metadata(&self, meta: FileMetadata) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO index_files \
                 (id, project_id, path, content_hash, language, size, line_count, last_modified, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                 content_hash = excluded.content_hash, language = excluded.language, \
                 size = excluded.size, line_count = excluded.line_count, \
                 last_modified = excluded.last_modified, updated_at = excluded.updated_at",
            )
            .bind(&meta.id)
            .bind(&meta.project_id)
            .bind(normalize_rel_path(&meta.path))
            .bind(&meta.content_hash)
            .bind(&meta.language)
            .bind(i64::try_from(meta.size)?)
            .bind(i64::try_from(meta.line_count)?)
            .bind(meta.last_modified.to_rfc3339())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get_file_metadata(
        &self,
        project_id: &str,
        path: &str,
    ) -> BoxFuture<'_, Result<Option<FileMetadata>>> {
        let project_id = project_id.to_owned();
        let path = normalize_rel_path(path);
        Box::pin(async move {
            let row: Option<FileRow> = sqlx::query_as(
                "SELECT id, project_id, path, content_hash, language, size, line_count, last_modified \
                 FROM index_files WHERE project_id = ? AND path = ?",
            )
            .bind(&project_id)
            .bind(&path)
            .fetch_optional(&self.pool)
            .await?;
            row.map(file_from_row).transpose()
        })
    }

    fn list_files(&self, project_id: &str) -> BoxFuture<'_, Result<Vec<FileMetadata>>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            let rows: Vec<FileRow> = sqlx::query_as(
                "SELECT id, project_id, path, content_hash, language, size, line_count, last_modified \
                 FROM index_files WHERE project_id = ? ORDER BY path",
            )
            .bind(&project_id)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(file_from_row).collect()
        })
    }

    fn delete_file(&self, file_id: &str) -> BoxFuture<'_, Result<()>> {
        let file_id = file_id.to_owned();
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM index_embeddings WHERE file_id = ?")
                .bind(&file_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM index_files WHERE id = ?")
                .bind(&file_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn delete_embeddings_by_file(&self, file_id: &str) -> BoxFuture<'_, Result<usize>> {
        let file_id = file_id.to_owned();
        Box::pin(async move {
            let done = sqlx::query("DELETE FROM index_embeddings WHERE file_id = ?")
                .bind(&file_id)
                .execute(&self.pool)
                .await?;
            Ok(usize::try_from(done.rows_affected())?)
        })
    }

    fn store_embedding(&self, record: EmbeddingRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_limit(record.dimensions)?;
            sqlx::query(
                "INSERT OR REPLACE INTO index_embeddings \
                 (id, project_id, file_id, file_path, chunk_index, content, vector, dimensions, \
                  format, provider, content_hash, start_line, end_line, symbol_name, symbol_type, \
                  language, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.id)
            .bind(&record.project_id)
            .bind(&record.file_id)
            .bind(&record.file_path)
            .bind(i64::try_from(record.chunk_index)?)
            .bind(&record.content)
            .bind(vec_to_blob(&record.vector))
            .bind(i64::try_from(record.dimensions)?)
            .bind(&record.format)
            .bind(&record.provider)
            .bind(&record.content_hash)
            .bind(i64::try_from(record.start_line)?)
            .bind(i64::try_from(record.end_line)?)
            .bind(&record.symbol_name)
            .bind(&record.symbol_type)
            .bind(&record.language)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get_project_stats(&self, project_id: &str) -> BoxFuture<'_, Result<ProjectStats>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            let (chunks, chunk_ts): (i64, Option<String>) = sqlx::query_as(
                "SELECT COUNT(*), MAX(created_at) FROM index_embeddings WHERE project_id = ?",
            )
            .bind(&project_id)
            .fetch_one(&self.pool)
            .await?;
            let (files, file_ts): (i64, Option<String>) = sqlx::query_as(
                "SELECT COUNT(*), MAX(updated_at) FROM index_files WHERE project_id = ?",
            )
            .bind(&project_id)
            .fetch_one(&self.pool)
            .await?;

            let last_updated = [chunk_ts, file_ts]
                .into_iter()
                .flatten()
                .map(|ts| parse_timestamp(&project_id, &ts))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .max();

            Ok(ProjectStats {
                total_chunks: usize::try_from(chunks)?,
                total_files: usize::try_from(files)?,
                last_updated,
            })
        })
    }

    fn ensure_dimension_compatibility(&self, dimensions: usize) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_limit(dimensions)?;
            let widest = self.widest_dimensions().await?;
            if dimensions > widest {
                sqlx::query(
                    "INSERT INTO index_schema (key, value) VALUES (?, ?) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )
                .bind(MAX_DIMENSIONS_KEY)
                .bind(i64::try_from(dimensions)?)
                .execute(&self.pool)
                .await?;
                tracing::info!(from = widest, to = dimensions, "widened vector schema");
            }
            Ok(())
        })
    }

    fn search_similar(
        &self,
        project_id: &str,
        vector: Vec<f32>,
        k: usize,
        min_score: f32,
    ) -> BoxFuture<'_, Result<Vec<ScoredRecord>>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            let sql = format!(
                "SELECT {EMBEDDING_COLUMNS} FROM index_embeddings \
                 WHERE project_id = ? AND dimensions = ?"
            );
            let rows: Vec<EmbeddingRow> = sqlx::query_as(&sql)
                .bind(&project_id)
                .bind(i64::try_from(vector.len())?)
                .fetch_all(&self.pool)
                .await?;

            let mut scored = Vec::with_capacity(rows.len());
            for row in rows {
                let record = embedding_from_row(row)?;
                let score = cosine_similarity(&vector, &record.vector);
                if score >= min_score {
                    scored.push(ScoredRecord { record, score });
                }
            }
            scored.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| a.record.id.cmp(&b.record.id))
            });
            scored.truncate(k);
            Ok(scored)
        })
    }

    fn check_model_change(
        &self,
        project_id: &str,
        current: &ModelSignature,
    ) -> BoxFuture<'_, Result<ModelChange>> {
        let project_id = project_id.to_owned();
        let current = current.clone();
        Box::pin(async move {
            let distinct = self.signatures(&project_id).await?;
            Ok(model_change(&distinct, &current))
        })
    }

    fn project_model(&self, project_id: &str) -> BoxFuture<'_, Result<Option<ModelSignature>>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            let distinct = self.signatures(&project_id).await?;
            Ok(majority_signature(distinct.iter().map(|(s, c)| (s, *c))))
        })
    }

    fn clear_project_embeddings(&self, project_id: &str) -> BoxFuture<'_, Result<usize>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let done = sqlx::query("DELETE FROM index_embeddings WHERE project_id = ?")
                .bind(&project_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM index_files WHERE project_id = ?")
                .bind(&project_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(usize::try_from(done.rows_affected())?)
        })
    }

    fn project_records(&self, project_id: &str) -> BoxFuture<'_, Result<Vec<EmbeddingRecord>>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            let sql = format!(
                "SELECT {EMBEDDING_COLUMNS} FROM index_embeddings \
                 WHERE project_id = ? ORDER BY file_path, chunk_index"
            );
            let rows: Vec<EmbeddingRow> = sqlx::query_as(&sql)
                .bind(&project_id)
                .fetch_all(&self.pool)
                .await?;
            rows.into_iter().map(embedding_from_row).collect()
        })
    }
}
