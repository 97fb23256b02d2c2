use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use image::DynamicImage;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::task;
use walkdir::WalkDir;

use crate::{embedding::{normalize, worker::InferenceWorker}, store::{fingerprint::FileState, EmbeddingStore}};

pub use error::IndexingError;
pub use events::{EventSink, IndexingEvent, NoopSink};
pub use status::{IndexingGuard, IndexingStatus, Progress, StatusTracker};

pub const DEFAULT_BATCH_SIZE: usize = 16;
pub const DEFAULT_PROGRESS_INTERVAL: usize = 10;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Outcome of one indexing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexingSummary {
    pub folder: Utf8PathBuf,
    pub total: usize,
    /// Images embedded and stored during this run
    pub added: usize,
    /// Images already up to date in the store
    pub skipped: usize,
    /// Images that could not be decoded, embedded or stored
    pub failed: usize,
}

/// Bulk indexing of a folder tree into the embedding store.
///
/// Only files the store reports as stale are decoded and embedded, in batches of `batch_size`. Progress goes
/// both to the shared [`StatusTracker`] and to the caller's [`EventSink`]. The tracker also gates runs: while
/// one run is in flight any other `index_folder` call, from this pipeline or another one sharing the tracker,
/// is rejected with [`IndexingError::AlreadyIndexing`].
pub struct IndexingPipeline {
    store: Arc<EmbeddingStore>,
    worker: InferenceWorker,
    status: Arc<StatusTracker>,
    batch_size: usize,
    progress_interval: usize,
}

#[derive(Default)]
struct RunCounts {
    processed: usize,
    added: usize,
    skipped: usize,
    failed: usize,
}

impl IndexingPipeline {
    pub fn new(store: Arc<EmbeddingStore>, worker: InferenceWorker, status: Arc<StatusTracker>) -> Self {
        Self {
            store,
            worker,
            status,
            batch_size: DEFAULT_BATCH_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_progress_interval(mut self, progress_interval: usize) -> Self {
        self.progress_interval = progress_interval.max(1);
        self
    }

    /// Claims the indexing gate for `folder`, failing with [`IndexingError::AlreadyIndexing`] if a run is in
    /// flight. The gate reopens when the returned guard is finished, failed or dropped.
    pub fn claim(&self, folder: &Utf8Path) -> Result<IndexingGuard<'_>, IndexingError> {
        self.status.try_begin(folder).map_err(|current| {
            info!("Rejecting indexing of {}, already indexing {}", folder, current);
            IndexingError::AlreadyIndexing { folder: current }
        })
    }

    pub async fn index_folder(&self, folder: &Utf8Path, sink: &dyn EventSink) -> Result<IndexingSummary, IndexingError> {
        let mut gate = self.claim(folder)?;
        let result = self.index_claimed(&mut gate, folder, sink).await;
        match &result {
            Ok(_) => gate.finish(),
            Err(e) => gate.fail(e.to_string()),
        }
        result
    }

    /// Indexes `folder` under a gate the caller already holds, e.g. to run several folders as one exclusive
    /// operation. Lifecycle events are emitted here; releasing the gate is left to the caller.
    pub async fn index_claimed(&self, gate: &mut IndexingGuard<'_>, folder: &Utf8Path, sink: &dyn EventSink)
        -> Result<IndexingSummary, IndexingError> {
        debug_assert!(gate.is_held_on(&self.status));
        gate.switch_to(folder);

        match self.run(folder, sink).await {
            Ok(summary) => {
                gate.complete_folder();
                info!("Finished indexing {}: {} added, {} skipped, {} failed of {} images",
                    folder, summary.added, summary.skipped, summary.failed, summary.total);
                sink.emit(IndexingEvent::Completed {
                    folder: folder.to_owned(),
                    total_indexed: summary.added,
                    skipped: summary.skipped,
                    message: format!("Indexed {} new images, {} already up to date", summary.added, summary.skipped),
                });
                Ok(summary)
            },
            Err(e) => {
                let error = e.to_string();
                warn!("Indexing of {} failed: {}", folder, error);
                sink.emit(IndexingEvent::Error { folder: folder.to_owned(), error });
                Err(e)
            },
        }
    }

    async fn run(&self, folder: &Utf8Path, sink: &dyn EventSink) -> Result<IndexingSummary, IndexingError> {
        self.status.reset_progress();
        sink.emit(IndexingEvent::Started { folder: folder.to_owned() });
        info!("Indexing folder {}", folder);

        let files = discover_images(folder).await?;
        let total = files.len();
        let mut counts = RunCounts::default();
        self.report(sink, folder, None, 0, total);

        // Staleness scan, up to date files are done here
        let mut pending = Vec::new();
        for file in &files {
            if self.store.needs_reindexing(file).await {
                pending.push(file.clone());
            } else {
                debug!("Skipping up to date {}", file);
                counts.skipped += 1;
                counts.processed += 1;
                if counts.processed % self.progress_interval == 0 {
                    self.report(sink, folder, Some(file), counts.processed, total);
                }
            }
            task::yield_now().await;
        }
        debug!("{} of {} images in {} need embedding", pending.len(), total, folder);

        for batch in pending.chunks(self.batch_size) {
            self.index_batch(folder, batch, &mut counts).await?;
            counts.processed += batch.len();
            self.report(sink, folder, batch.last().map(Utf8PathBuf::as_path), counts.processed, total);
            task::yield_now().await;
        }

        self.report(sink, folder, None, total, total);

        Ok(IndexingSummary {
            folder: folder.to_owned(),
            total,
            added: counts.added,
            skipped: counts.skipped,
            failed: counts.failed,
        })
    }

    async fn index_batch(&self, folder: &Utf8Path, batch: &[Utf8PathBuf], counts: &mut RunCounts)
        -> Result<(), IndexingError> {
        let (decoded, images) = decode_images(batch.to_vec()).await?;
        counts.failed += batch.len() - decoded.len();
        if images.is_empty() {
            return Ok(());
        }

        let results = self.worker.embed_batch(images).await
            .map_err(|e| IndexingError::Embedding { folder: folder.to_owned(), source: e })?;

        for ((path, state), result) in decoded.into_iter().zip(results) {
            let mut embedding = match result {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!("Could not embed {}: {}", path, e);
                    counts.failed += 1;
                    continue;
                },
            };
            normalize(&mut embedding);

            let stored = match state {
                Some(state) => self.store.store_with_state(&path, &embedding, state).await,
                None => self.store.store(&path, &embedding).await,
            };
            match stored {
                Ok(()) => counts.added += 1,
                Err(e) => {
                    warn!("Could not store embedding for {}: {}", path, e);
                    counts.failed += 1;
                },
            }
        }
        Ok(())
    }

    fn report(&self, sink: &dyn EventSink, folder: &Utf8Path, current: Option<&Utf8Path>, processed: usize, total: usize) {
        self.status.update_progress(current, processed, total);
        sink.emit(IndexingEvent::Progress {
            folder: folder.to_owned(),
            current_file: current.map(Utf8Path::to_owned),
            processed,
            total,
            percentage: status::percentage(processed, total),
        });
    }
}

/// Whether the path has one of the recognised image extensions (case-insensitive).
pub fn is_image_path(path: &Utf8Path) -> bool {
    path.extension()
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// Recursive count of image files under `root`.
pub async fn count_images(root: &Utf8Path) -> Result<usize, IndexingError> {
    Ok(discover_images(root).await?.len())
}

/// Every image file under `root`, in walk order with siblings sorted by file name. Entries below the root
/// that cannot be read, or whose paths are not UTF-8, are logged and left out.
pub async fn discover_images(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, IndexingError> {
    let root = root.to_owned();
    task::spawn_blocking(move || walk_images(&root)).await
        .map_err(IndexingError::Join)?
}

fn walk_images(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, IndexingError> {
    if !root.is_dir() {
        return Err(IndexingError::NotADirectory { folder: root.to_owned() });
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(IndexingError::Walk { folder: root.to_owned(), source: e }),
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", root, e);
                continue;
            },
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match Utf8PathBuf::from_path_buf(entry.into_path()) {
            Ok(path) if is_image_path(&path) => images.push(path),
            Ok(_) => {},
            Err(path) => warn!("Skipping non UTF-8 path {}", path.display()),
        }
    }
    Ok(images)
}

/// Decodes a batch off the async runtime. Returns the paths that decoded, each with the file state read just
/// before decoding, alongside their images, in order.
async fn decode_images(batch: Vec<Utf8PathBuf>)
    -> Result<(Vec<(Utf8PathBuf, Option<FileState>)>, Vec<DynamicImage>), IndexingError> {
    task::spawn_blocking(move || {
        let mut decoded = Vec::with_capacity(batch.len());
        let mut images = Vec::with_capacity(batch.len());
        for path in batch {
            let state = FileState::read(&path)
                .inspect_err(|e| debug!("Could not fingerprint {} before decoding: {}", path, e))
                .ok();
            match image::open(&path) {
                Ok(image) => {
                    images.push(image);
                    decoded.push((path, state));
                },
                Err(e) => warn!("Could not load image {}: {}", path, e),
            }
        }
        (decoded, images)
    }).await.map_err(IndexingError::Join)
}

pub mod error;
pub mod events;
pub mod status;

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn recognises_image_extensions() {
        assert!(is_image_path(Utf8Path::new("/a/b.png")));
        assert!(is_image_path(Utf8Path::new("/a/b.JPEG")));
        assert!(is_image_path(Utf8Path::new("b.WebP")));
        assert!(!is_image_path(Utf8Path::new("/a/b.gif")));
        assert!(!is_image_path(Utf8Path::new("/a/png")));
    }

    #[tokio::test]
    async fn discovery_is_recursive_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir(root.join("nested")).unwrap();
        for name in ["b.jpg", "a.PNG", "notes.txt", "nested/c.webp"] {
            fs::write(root.join(name), b"x").unwrap();
        }

        let found = discover_images(&root).await.unwrap();
        assert_eq!(found, vec![root.join("a.PNG"), root.join("b.jpg"), root.join("nested/c.webp")]);
        assert_eq!(count_images(&root).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let result = discover_images(Utf8Path::new("/no/such/folder/anywhere")).await;
        assert!(matches!(result, Err(IndexingError::NotADirectory { .. })));
    }
}
