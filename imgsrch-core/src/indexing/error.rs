use camino::Utf8PathBuf;

use crate::embedding::EmbeddingError;

#[derive(thiserror::Error, Debug)]
pub enum IndexingError {
    #[error("Indexing already in progress for folder {folder}")]
    AlreadyIndexing { folder: Utf8PathBuf },
    #[error("Folder {folder} does not exist or is not a directory")]
    NotADirectory { folder: Utf8PathBuf },
    #[error("Error walking folder {folder}")]
    Walk { folder: Utf8PathBuf, #[source] source: walkdir::Error },
    #[error("Inference failed while indexing {folder}")]
    Embedding { folder: Utf8PathBuf, #[source] source: EmbeddingError },
    #[error("Background task failed while indexing")]
    Join (#[source] tokio::task::JoinError),
}
