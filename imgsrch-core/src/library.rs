use std::{env, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};
use tokio::runtime::Handle;

use crate::{
    app_config::AppConfig,
    embedding::worker::InferenceWorker,
    indexing::{EventSink, IndexingError, IndexingPipeline, IndexingStatus, IndexingSummary, StatusTracker},
    search::{RequestContext, SearchEngine, SearchError, SearchResult},
    store::{EmbeddingStore, StoreError, StoreStats},
    watch::{FolderWatcher, WatchError, WatchedFolders},
};

#[derive(thiserror::Error, Debug)]
pub enum LibraryError {
    #[error("Folder not found: {requested}")]
    FolderNotFound { requested: String },
    #[error(transparent)]
    Indexing (#[from] IndexingError),
    #[error(transparent)]
    Watch (#[from] WatchError),
    #[error(transparent)]
    Search (#[from] SearchError),
    #[error(transparent)]
    Store (#[from] StoreError),
}

/// Tunables for an [`ImageLibrary`].
#[derive(Debug, Clone)]
pub struct LibraryOptions {
    pub batch_size: usize,
    pub progress_interval: usize,
    pub watch_debounce: std::time::Duration,
}

impl Default for LibraryOptions {
    fn default() -> Self {
        Self {
            batch_size: crate::indexing::DEFAULT_BATCH_SIZE,
            progress_interval: crate::indexing::DEFAULT_PROGRESS_INTERVAL,
            watch_debounce: std::time::Duration::from_millis(500),
        }
    }
}

impl From<&AppConfig> for LibraryOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            progress_interval: config.progress_interval,
            watch_debounce: config.watch_debounce(),
        }
    }
}

/// Everything a transport layer needs: one store, one status tracker, one watched folder set and the
/// components sharing them. Separate libraries share nothing.
pub struct ImageLibrary {
    store: Arc<EmbeddingStore>,
    status: Arc<StatusTracker>,
    folders: Arc<WatchedFolders>,
    pipeline: IndexingPipeline,
    search: SearchEngine,
    watcher: Arc<FolderWatcher>,
}

impl ImageLibrary {
    /// `runtime` drives store access from the watcher threads; pass the handle of the runtime the library is
    /// used from.
    pub fn new(store: EmbeddingStore, worker: InferenceWorker, runtime: Handle, options: LibraryOptions) -> Self {
        let store = Arc::new(store);
        let status = Arc::new(StatusTracker::new());
        let folders = Arc::new(WatchedFolders::new());

        let pipeline = IndexingPipeline::new(store.clone(), worker.clone(), status.clone())
            .with_batch_size(options.batch_size)
            .with_progress_interval(options.progress_interval);
        let search = SearchEngine::new(store.clone(), worker.clone(), folders.clone());
        let watcher = Arc::new(FolderWatcher::new(store.clone(), worker, runtime, options.watch_debounce));

        Self { store, status, folders, pipeline, search, watcher }
    }

    /// Indexes `folder`, then watches it for new images and makes it the active folder if it was not
    /// watched already. A folder that fails to index is not watched.
    pub async fn add_folder(&self, folder: &str, sink: &dyn EventSink) -> Result<IndexingSummary, LibraryError> {
        let folder = resolve_folder(folder)?;
        let summary = self.pipeline.index_folder(&folder, sink).await?;

        self.watcher.watch(&folder)?;
        self.folders.add(&folder);
        Ok(summary)
    }

    /// One-off indexing of `folder` without watching it.
    pub async fn index_folder(&self, folder: &str, sink: &dyn EventSink) -> Result<IndexingSummary, LibraryError> {
        let folder = resolve_folder(folder)?;
        Ok(self.pipeline.index_folder(&folder, sink).await?)
    }

    /// Clears the store and indexes every watched folder again, oldest first. The whole rebuild holds the
    /// indexing gate, so it is refused up front while another run is in flight and nothing can start in
    /// between. Stops at the first failure.
    pub async fn reindex_all(&self, sink: &dyn EventSink) -> Result<Vec<IndexingSummary>, LibraryError> {
        let folders = self.folders.list();
        let first = folders.first().cloned().unwrap_or_else(|| self.store.data_dir().to_owned());
        let mut gate = self.pipeline.claim(&first)?;

        if let Err(e) = self.store.clear().await {
            gate.fail(e.to_string());
            return Err(e.into());
        }
        let mut summaries = Vec::with_capacity(folders.len());
        for folder in &folders {
            match self.pipeline.index_claimed(&mut gate, folder, sink).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    gate.fail(e.to_string());
                    return Err(e.into());
                },
            }
        }
        gate.finish();
        info!("Re-indexed {} folders", summaries.len());
        Ok(summaries)
    }

    pub async fn search(&self, query: &str, top_k: usize, context: &RequestContext)
        -> Result<Vec<SearchResult>, LibraryError> {
        Ok(self.search.search(query, top_k, context).await?)
    }

    pub async fn stats(&self) -> Result<StoreStats, LibraryError> {
        Ok(self.store.stats().await?)
    }

    pub async fn cleanup_missing(&self) -> Result<usize, LibraryError> {
        Ok(self.store.cleanup_missing().await?)
    }

    pub async fn clear(&self) -> Result<(), LibraryError> {
        Ok(self.store.clear().await?)
    }

    pub fn status(&self) -> IndexingStatus {
        self.status.get_status()
    }

    /// The tracker gating indexing runs of this library, for transports that need to hold or observe it.
    pub fn status_tracker(&self) -> &Arc<StatusTracker> {
        &self.status
    }

    pub fn watched_folders(&self) -> Vec<Utf8PathBuf> {
        self.folders.list()
    }

    pub fn active_folder(&self) -> Option<Utf8PathBuf> {
        self.folders.active()
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    /// Stops all watches, waiting for in-flight watch events to finish.
    pub async fn shutdown(&self) {
        let watcher = self.watcher.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || watcher.stop_all()).await {
            warn!("Stopping folder watches failed: {}", e);
        }
    }
}

/// Resolves a user supplied folder: as given if it is an existing directory, otherwise relative to the
/// current directory, otherwise relative to the home directory. The result is absolute and canonical.
pub fn resolve_folder(requested: &str) -> Result<Utf8PathBuf, LibraryError> {
    let requested_path = Utf8Path::new(requested);
    let mut candidates = vec![requested_path.to_owned()];
    if let Some(cwd) = env::current_dir().ok().and_then(|d| Utf8PathBuf::from_path_buf(d).ok()) {
        candidates.push(cwd.join(requested_path));
    }
    if let Some(home) = dirs::home_dir().and_then(|d| Utf8PathBuf::from_path_buf(d).ok()) {
        candidates.push(home.join(requested_path));
    }

    candidates.into_iter()
        .filter(|candidate| candidate.is_dir())
        .find_map(|candidate| candidate.canonicalize_utf8().ok())
        .ok_or_else(|| LibraryError::FolderNotFound { requested: requested.to_owned() })
}
