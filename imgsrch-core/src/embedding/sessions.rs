use std::fmt::Display;

use camino::Utf8Path;
use log::debug;
use ort::session::{builder::GraphOptimizationLevel, Session};
use tokenizers::Tokenizer;

use crate::embedding::EmbeddingError;

const INTRA_THREADS: usize = 4;

pub fn create_session(model_path: &Utf8Path) -> Result<Session, EmbeddingError> {
    debug!("Loading onnx model from {}", model_path);
    let init_error = |e: &dyn Display| EmbeddingError::Initialization(
        anyhow::anyhow!("loading model {}: {}", model_path, e));

    let builder = Session::builder().map_err(|e| init_error(&e))?;
    let builder = builder.with_optimization_level(GraphOptimizationLevel::Level3).map_err(|e| init_error(&e))?;
    let builder = builder.with_intra_threads(INTRA_THREADS).map_err(|e| init_error(&e))?;
    builder.commit_from_file(model_path).map_err(|e| init_error(&e))
}

pub fn create_tokenizer(tokenizer_path: &Utf8Path) -> Result<Tokenizer, EmbeddingError> {
    debug!("Loading tokenizer from {}", tokenizer_path);
    Tokenizer::from_file(tokenizer_path)
        .map_err(|e| EmbeddingError::Initialization(
            anyhow::anyhow!("loading tokenizer {}: {}", tokenizer_path, e)))
}
