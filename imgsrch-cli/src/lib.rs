use std::{path::{self, PathBuf}, time::Duration};

use anyhow::{anyhow, Context};
use camino::Utf8PathBuf;
use imgsrch_core::{
    app_config::AppConfig,
    embedding::{siglip2::Siglip2Embedder, worker::InferenceWorker},
    indexing::{EventSink, IndexingEvent},
    init_ort,
    store::EmbeddingStore,
    ImageLibrary, LibraryOptions,
};
use indicatif::{ProgressBar, ProgressStyle};
use normalize_path::NormalizePath;
use tokio::runtime::Handle;

/// Loads the model and opens the configured store. Must be called from within a tokio runtime.
pub async fn open_library(config: &AppConfig) -> anyhow::Result<ImageLibrary> {
    init_ort(config.onnx_library_directory.as_deref())
        .map_err(|e| anyhow!("Could not initialize ONNX Runtime: {e}"))?;

    let missing: Vec<_> = Siglip2Embedder::required_files(&config.model_directory).into_iter()
        .filter(|f| !f.is_file())
        .collect();
    if !missing.is_empty() {
        return Err(anyhow!("Model files missing: {:?}", missing));
    }

    let embedder = Siglip2Embedder::load(&config.model_directory)?;
    let worker = InferenceWorker::spawn(embedder)?;
    let store = EmbeddingStore::open(&config.data_directory, &config.table_name, worker.dimension()).await
        .with_context(|| format!("Could not open embedding store in {}", config.data_directory))?;

    Ok(ImageLibrary::new(store, worker, Handle::current(), LibraryOptions::from(config)))
}

/// Opens the configured store without loading any model.
pub async fn open_store(config: &AppConfig) -> anyhow::Result<EmbeddingStore> {
    EmbeddingStore::open(&config.data_directory, &config.table_name, Siglip2Embedder::VECTOR_LENGTH).await
        .with_context(|| format!("Could not open embedding store in {}", config.data_directory))
}

/// Absolute, normalized, UTF-8 version of a path given on the command line.
pub fn clean_path(path: PathBuf) -> anyhow::Result<Utf8PathBuf> {
    let absolute = path::absolute(&path)
        .with_context(|| format!("Could not make {} absolute", path.display()))?
        .normalize();
    Utf8PathBuf::from_path_buf(absolute)
        .map_err(|p| anyhow!("Path is not valid UTF-8: {}", p.display()))
}

/// Renders indexing events on a terminal progress bar.
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(ProgressStyle::with_template("{spinner} [{elapsed_precise}] {wide_bar} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()));
        bar.enable_steady_tick(Duration::from_millis(250));
        Self { bar }
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for ProgressBarSink {
    fn emit(&self, event: IndexingEvent) {
        match event {
            IndexingEvent::Started { folder } => {
                self.bar.reset();
                self.bar.set_message(format!("scanning {}", folder));
            },
            IndexingEvent::Progress { processed, total, current_file, .. } => {
                self.bar.set_length(total as u64);
                self.bar.set_position(processed as u64);
                if let Some(file) = current_file.as_ref().and_then(|f| f.file_name()) {
                    self.bar.set_message(file.to_owned());
                }
            },
            IndexingEvent::Completed { message, .. } => self.bar.finish_with_message(message),
            IndexingEvent::Error { error, .. } => self.bar.abandon_with_message(format!("failed: {}", error)),
        }
    }
}
