use std::{collections::HashMap, path::PathBuf, sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock}, thread::{self, JoinHandle},
    time::Duration};

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::runtime::Handle;

use crate::{embedding::{normalize, worker::InferenceWorker, EmbeddingError}, indexing::is_image_path,
    store::{fingerprint::FileState, EmbeddingStore, StoreError}};

#[derive(thiserror::Error, Debug)]
pub enum WatchError {
    #[error("Could not watch folder {folder}")]
    Notify { folder: Utf8PathBuf, #[source] source: notify::Error },
    #[error("Could not start watch handler thread for {folder}")]
    Thread { folder: Utf8PathBuf, #[source] source: std::io::Error },
    #[error("Could not load image {path}")]
    Image { path: Utf8PathBuf, #[source] source: image::ImageError },
    #[error("Could not embed image {path}")]
    Embedding { path: Utf8PathBuf, #[source] source: EmbeddingError },
    #[error("Could not store embedding for {path}")]
    Store { path: Utf8PathBuf, #[source] source: StoreError },
}

/// Folders being indexed and watched, in the order they were added. The last one added is the active folder.
#[derive(Debug, Default)]
pub struct WatchedFolders {
    folders: RwLock<Vec<Utf8PathBuf>>,
}

impl WatchedFolders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `folder` unless it is already present. Returns whether it was added.
    pub fn add(&self, folder: &Utf8Path) -> bool {
        let mut folders = self.folders.write().unwrap_or_else(PoisonError::into_inner);
        if folders.iter().any(|f| f == folder) {
            return false;
        }
        folders.push(folder.to_owned());
        true
    }

    pub fn list(&self) -> Vec<Utf8PathBuf> {
        self.folders.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn active(&self) -> Option<Utf8PathBuf> {
        self.folders.read().unwrap_or_else(PoisonError::into_inner).last().cloned()
    }

    pub fn contains(&self, folder: &Utf8Path) -> bool {
        self.folders.read().unwrap_or_else(PoisonError::into_inner).iter().any(|f| f == folder)
    }
}

enum WatchMessage {
    Created(PathBuf),
    Stop,
}

struct FolderWatch {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    sender: Sender<WatchMessage>,
    handler: JoinHandle<()>,
}

/// Incremental indexing of newly created images in watched folders.
///
/// Every watched folder gets an OS watch (recursive, debounced) and a handler thread that takes creation
/// events one at a time: stale images are embedded through the shared inference worker and stored. The
/// handler threads drive store futures on `runtime` with `block_on`, so they must never be the runtime's
/// own threads.
///
/// Call [`FolderWatcher::stop_all`] (or [`crate::ImageLibrary::shutdown`]) before the last handle is dropped.
/// Dropping with live watches from inside the runtime only signals the handler threads to stop instead of
/// joining them, since a handler may be waiting on that very runtime.
pub struct FolderWatcher {
    store: Arc<EmbeddingStore>,
    worker: InferenceWorker,
    runtime: Handle,
    debounce: Duration,
    watches: Mutex<HashMap<Utf8PathBuf, FolderWatch>>,
}

impl FolderWatcher {
    pub fn new(store: Arc<EmbeddingStore>, worker: InferenceWorker, runtime: Handle, debounce: Duration) -> Self {
        Self {
            store,
            worker,
            runtime,
            debounce,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Starts watching `folder`. Returns false, doing nothing, if it is already watched.
    pub fn watch(&self, folder: &Utf8Path) -> Result<bool, WatchError> {
        let mut watches = self.lock();
        if watches.contains_key(folder) {
            debug!("Already watching {}", folder);
            return Ok(false);
        }

        let (sender, receiver) = crossbeam_channel::unbounded();
        let events = sender.clone();
        let watched = folder.to_owned();
        let mut debouncer = new_debouncer(self.debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(debounced) => {
                    for event in debounced {
                        if !matches!(event.kind, EventKind::Create(_)) {
                            continue;
                        }
                        for path in &event.paths {
                            // handler is gone only while stopping
                            let _ = events.send(WatchMessage::Created(path.clone()));
                        }
                    }
                },
                Err(errors) => errors.iter().for_each(|e| warn!("Watch error in {}: {}", watched, e)),
            }
        }).map_err(|e| WatchError::Notify { folder: folder.to_owned(), source: e })?;

        debouncer.watch(folder.as_std_path(), RecursiveMode::Recursive)
            .map_err(|e| WatchError::Notify { folder: folder.to_owned(), source: e })?;

        let handler = {
            let store = self.store.clone();
            let worker = self.worker.clone();
            let runtime = self.runtime.clone();
            let handled = folder.to_owned();
            thread::Builder::new()
                .name("imgsrch-watch".to_owned())
                .spawn(move || handle_events(&handled, receiver, &store, &worker, &runtime))
                .map_err(|e| WatchError::Thread { folder: folder.to_owned(), source: e })?
        };

        info!("Watching {} for new images", folder);
        watches.insert(folder.to_owned(), FolderWatch { debouncer, sender, handler });
        Ok(true)
    }

    pub fn is_watching(&self, folder: &Utf8Path) -> bool {
        self.lock().contains_key(folder)
    }

    /// Stops every watch and waits for the handler threads to exit. Events already queued are handled first.
    /// Blocking; from async code run it on a blocking thread.
    pub fn stop_all(&self) {
        self.stop_watches(true);
    }

    fn stop_watches(&self, join: bool) {
        let watches: Vec<_> = self.lock().drain().collect();
        for (folder, watch) in watches {
            watch.debouncer.stop();
            let _ = watch.sender.send(WatchMessage::Stop);
            if !join {
                debug!("Not waiting for the watch handler of {} to exit", folder);
            } else if watch.handler.join().is_err() {
                warn!("Watch handler for {} panicked", folder);
            }
            info!("Stopped watching {}", folder);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Utf8PathBuf, FolderWatch>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for FolderWatcher {
    fn drop(&mut self) {
        if self.lock().is_empty() {
            return;
        }
        let in_runtime = Handle::try_current().is_ok();
        warn!("Folder watcher dropped with live watches, stop them before dropping");
        self.stop_watches(!in_runtime);
    }
}

fn handle_events(folder: &Utf8Path, receiver: Receiver<WatchMessage>, store: &EmbeddingStore,
    worker: &InferenceWorker, runtime: &Handle) {
    debug!("Watch handler for {} started", folder);
    while let Ok(message) = receiver.recv() {
        let path = match message {
            WatchMessage::Stop => break,
            WatchMessage::Created(path) => path,
        };
        let path = match Utf8PathBuf::from_path_buf(path) {
            Ok(path) => path,
            Err(path) => {
                warn!("Ignoring non UTF-8 path {}", path.display());
                continue;
            },
        };
        if !is_image_path(&path) || !path.is_file() {
            continue;
        }

        match index_created(&path, store, worker, runtime) {
            Ok(true) => info!("Indexed new image {}", path),
            Ok(false) => debug!("{} is already up to date", path),
            Err(e) => warn!("Failed to index new image: {}", e),
        }
    }
    debug!("Watch handler for {} stopped", folder);
}

/// Embeds and stores one newly created image if the store does not already hold a current embedding.
fn index_created(path: &Utf8Path, store: &EmbeddingStore, worker: &InferenceWorker, runtime: &Handle)
    -> Result<bool, WatchError> {
    if !runtime.block_on(store.needs_reindexing(path)) {
        return Ok(false);
    }

    // read before decoding, so a rewrite while embedding leaves the record stale
    let state = FileState::read(path).ok();
    let image = image::open(path)
        .map_err(|e| WatchError::Image { path: path.to_owned(), source: e })?;
    let mut embedding = worker.embed_image_blocking(image)
        .map_err(|e| WatchError::Embedding { path: path.to_owned(), source: e })?;
    normalize(&mut embedding);

    let stored = match state {
        Some(state) => runtime.block_on(store.store_with_state(path, &embedding, state)),
        None => runtime.block_on(store.store(path, &embedding)),
    };
    stored.map_err(|e| WatchError::Store { path: path.to_owned(), source: e })?;
    Ok(true)
}
