use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Duration, Utc};
use futures::{stream::{self, BoxStream}, StreamExt, TryStreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use walkdir::WalkDir;

use crate::store::{fingerprint::FileState, integrations::{quoted, RecordRowBuilder}, lancedb::{LanceDBError, LanceTable}};

/// Errors that can occur during embedding store operations.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Embedding of length {actual} does not match the store dimension {expected}")]
    InvalidVectorLength { actual: usize, expected: usize },
    #[error("Error opening embedding store")]
    Open (#[source] LanceDBError),
    #[error("Error writing record for {path}")]
    Write { path: String, #[source] source: LanceDBError },
    #[error("Error deleting records")]
    Delete (#[source] LanceDBError),
    #[error("Error reading records")]
    Read (#[source] LanceDBError),
    #[error("Error reading record batch from query result")]
    Stream (#[source] ::lancedb::error::Error),
    #[error("Error assembling record batch")]
    Encode { #[source] source: anyhow::Error },
    #[error("Unexpected data in column {column}: {issue}")]
    Decode { column: &'static str, issue: String },
    #[error("Background filesystem task failed")]
    Join (#[source] tokio::task::JoinError),
}

/// One indexed image.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub file_path: Utf8PathBuf,
    pub embedding: Vec<f32>,
    /// MD5 of the file bytes at indexing time; empty if the file could not be read
    pub content_fingerprint: String,
    pub last_modified: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_embeddings: usize,
    /// Records created within the last 24 hours
    pub recent_embeddings: usize,
    pub database_path: Utf8PathBuf,
    pub database_size_mb: f64,
}

/// Persistent mapping from image path to its embedding, content fingerprint and modification time.
///
/// Every read goes to the table, nothing is cached between calls. Writes are serialized by the underlying
/// [`LanceTable`], so a store may be shared (behind an `Arc`) between the async indexing pipeline and the
/// blocking watcher threads.
pub struct EmbeddingStore {
    table: LanceTable,
    data_dir: Utf8PathBuf,
    dimension: usize,
}

pub type PairStream = BoxStream<'static, Result<(Utf8PathBuf, Vec<f32>), StoreError>>;

const RECENT_WINDOW_HOURS: i64 = 24;
const DELETE_CHUNK: usize = 100;

impl EmbeddingStore {
    pub async fn open(data_dir: &Utf8Path, table_name: &str, dimension: usize) -> Result<EmbeddingStore, StoreError> {
        let width = i32::try_from(dimension)
            .map_err(|_| StoreError::Open(LanceDBError::InvalidParameter {
                parameter: "dimension",
                issue: format!("{dimension} does not fit an arrow list size"),
            }))?;
        let table = LanceTable::open(data_dir.as_str(), table_name, integrations::schema(width)).await
            .map_err(StoreError::Open)?;

        Ok(EmbeddingStore {
            table,
            data_dir: data_dir.to_owned(),
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    /// Insert-or-replace the record for `path`, capturing the file's current fingerprint and modification
    /// time. If the file cannot be read the record is still written, with an empty fingerprint so that it is
    /// always considered stale.
    pub async fn store(&self, path: &Utf8Path, embedding: &[f32]) -> Result<(), StoreError> {
        self.check_length(embedding)?;
        let state = match read_state(path).await? {
            Ok(state) => state,
            Err(e) => {
                warn!("Could not fingerprint {} while storing its embedding: {}", path, e);
                FileState { fingerprint: String::new(), modified: Utc::now() }
            },
        };
        self.store_with_state(path, embedding, state).await
    }

    /// Insert-or-replace the record for `path` with a file state read before the embedding was computed, so a
    /// file rewritten in the meantime still reads as stale afterwards.
    pub async fn store_with_state(&self, path: &Utf8Path, embedding: &[f32], state: FileState) -> Result<(), StoreError> {
        self.check_length(embedding)?;
        let now = Utc::now();

        let record = EmbeddingRecord {
            file_path: path.to_owned(),
            embedding: embedding.to_vec(),
            content_fingerprint: state.fingerprint,
            last_modified: state.modified,
            created_at: now,
        };
        let mut builder = RecordRowBuilder::new(self.dimension as i32);
        builder.append(&record);
        let batch = builder.finish(self.table.schema())?;

        self.table.merge_insert(integrations::FILE_PATH_COLUMN, batch).await
            .map_err(|e| StoreError::Write { path: path.to_string(), source: e })?;
        debug!("Stored embedding for {}", path);
        Ok(())
    }

    fn check_length(&self, embedding: &[f32]) -> Result<(), StoreError> {
        if embedding.len() != self.dimension {
            return Err(StoreError::InvalidVectorLength { actual: embedding.len(), expected: self.dimension });
        }
        Ok(())
    }

    pub async fn get(&self, path: &Utf8Path) -> Result<Option<Vec<f32>>, StoreError> {
        Ok(self.get_record(path).await?.map(|r| r.embedding))
    }

    pub async fn get_record(&self, path: &Utf8Path) -> Result<Option<EmbeddingRecord>, StoreError> {
        let filter = path_filter(path);
        let batches: Vec<_> = self.table.scan(&integrations::ALL_COLUMNS, Some(&filter)).await
            .map_err(StoreError::Read)?
            .try_collect().await
            .map_err(StoreError::Stream)?;

        for batch in batches {
            if let Some(record) = integrations::batch_to_records(&batch)?.into_iter().next() {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Every stored `(path, embedding)` pair, decoded lazily from a fresh scan of the table. Calling again
    /// restarts from the current persisted state.
    pub async fn all(&self) -> Result<PairStream, StoreError> {
        let columns = [integrations::FILE_PATH_COLUMN, integrations::EMBEDDING_COLUMN];
        let batches = self.table.scan(&columns, None).await
            .map_err(StoreError::Read)?;

        Ok(batches
            .map(|batch| batch
                .map_err(StoreError::Stream)
                .and_then(|b| integrations::batch_to_pairs(&b)))
            .flat_map(|decoded| match decoded {
                Ok(pairs) => stream::iter(pairs.into_iter().map(Ok).collect::<Vec<_>>()),
                Err(e) => stream::iter(vec![Err(e)]),
            })
            .boxed())
    }

    pub async fn exists(&self, path: &Utf8Path) -> Result<bool, StoreError> {
        Ok(self.get_record(path).await?.is_some())
    }

    /// True if there is no record for `path`, or the file changed since it was recorded. Any failure to read
    /// the record or the file also answers true.
    pub async fn needs_reindexing(&self, path: &Utf8Path) -> bool {
        let record = match self.get_record(path).await {
            Ok(Some(record)) => record,
            Ok(None) => return true,
            Err(e) => {
                warn!("Could not look up record for {}, treating as stale: {}", path, e);
                return true;
            },
        };

        match read_state(path).await {
            Ok(Ok(state)) => state.is_newer_than(&record.content_fingerprint, &record.last_modified),
            Ok(Err(e)) => {
                warn!("Could not fingerprint {}, treating as stale: {}", path, e);
                true
            },
            Err(e) => {
                warn!("Fingerprint task for {} failed, treating as stale: {}", path, e);
                true
            },
        }
    }

    pub async fn remove(&self, path: &Utf8Path) -> Result<(), StoreError> {
        self.table.delete_where(&path_filter(path)).await
            .map_err(StoreError::Delete)
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        info!("Clearing all records from {}", self.table.name());
        self.table.delete_where(&format!("{} IS NOT NULL", integrations::FILE_PATH_COLUMN)).await
            .map_err(StoreError::Delete)
    }

    /// Deletes every record whose file no longer exists and returns how many were removed.
    pub async fn cleanup_missing(&self) -> Result<usize, StoreError> {
        let batches: Vec<_> = self.table.scan(&[integrations::FILE_PATH_COLUMN], None).await
            .map_err(StoreError::Read)?
            .try_collect().await
            .map_err(StoreError::Stream)?;

        let mut paths = Vec::new();
        for batch in &batches {
            let column = integrations::string_column(batch, integrations::FILE_PATH_COLUMN)?;
            paths.extend(column.iter().flatten().map(Utf8PathBuf::from));
        }

        let missing: Vec<Utf8PathBuf> = tokio::task::spawn_blocking(move || {
            paths.into_iter().filter(|p| !p.exists()).collect()
        }).await.map_err(StoreError::Join)?;

        for chunk in missing.chunks(DELETE_CHUNK) {
            let list = chunk.iter().map(|p| quoted(p.as_str())).collect::<Vec<_>>().join(", ");
            self.table.delete_where(&format!("{} IN ({})", integrations::FILE_PATH_COLUMN, list)).await
                .map_err(StoreError::Delete)?;
        }

        if !missing.is_empty() {
            info!("Removed {} records for files that no longer exist", missing.len());
        }
        Ok(missing.len())
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.table.count().await.map_err(StoreError::Read)
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let total_embeddings = self.count().await?;

        let cutoff = (Utc::now() - Duration::hours(RECENT_WINDOW_HOURS)).timestamp_millis();
        let batches: Vec<_> = self.table.scan(&[integrations::CREATED_AT_COLUMN], None).await
            .map_err(StoreError::Read)?
            .try_collect().await
            .map_err(StoreError::Stream)?;
        let mut recent_embeddings = 0;
        for batch in &batches {
            let created = integrations::timestamp_column(batch, integrations::CREATED_AT_COLUMN)?;
            recent_embeddings += created.iter().flatten().filter(|millis| *millis >= cutoff).count();
        }

        let database_path = Utf8PathBuf::from(self.table.directory(self.data_dir.as_str()));
        let walk_root = database_path.clone();
        let bytes = tokio::task::spawn_blocking(move || directory_size(&walk_root)).await
            .map_err(StoreError::Join)?;

        Ok(StoreStats {
            total_embeddings,
            recent_embeddings,
            database_path,
            database_size_mb: bytes as f64 / (1024.0 * 1024.0),
        })
    }
}

/// Drops a table and all of its data. Used for development resets.
pub async fn drop_table(data_dir: &Utf8Path, table_name: &str) -> Result<(), StoreError> {
    self::lancedb::drop(data_dir.as_str(), table_name).await.map_err(StoreError::Delete)
}

fn path_filter(path: &Utf8Path) -> String {
    format!("{} = {}", integrations::FILE_PATH_COLUMN, quoted(path.as_str()))
}

async fn read_state(path: &Utf8Path) -> Result<std::io::Result<FileState>, StoreError> {
    let owned = path.to_owned();
    tokio::task::spawn_blocking(move || FileState::read(&owned)).await
        .map_err(StoreError::Join)
}

fn directory_size(root: &Utf8Path) -> u64 {
    WalkDir::new(root).into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .sum()
}

pub mod fingerprint;
pub mod integrations;
pub mod lancedb;
