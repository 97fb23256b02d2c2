use crate::{embedding::EmbeddingError, store::StoreError};

#[derive(thiserror::Error, Debug)]
pub enum SearchError {
    #[error("Error reading embeddings from the store")]
    Store (#[from] StoreError),
    #[error("Error embedding query text")]
    Embedding (#[from] EmbeddingError),
}
