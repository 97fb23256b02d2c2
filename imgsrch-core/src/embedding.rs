use image::DynamicImage;
use log::warn;

#[derive(thiserror::Error, Debug)]
pub enum EmbeddingError {
    #[error("Error during intialization of model and tokenizer for embedding")]
    Initialization (#[source] anyhow::Error),
    #[error("Error while performing neural network calculations with {element} at step: {step}")]
    Calculation { element: String, step: &'static str, #[source] source: anyhow::Error },
    #[error("Error while preprocessing data in preparation for embedding: {element} at step: {step}")]
    Preprocessing { element: String, step: &'static str, #[source] source: anyhow::Error },
    #[error("Model returned {actual} embeddings for a batch of {expected} inputs")]
    BatchSizeMismatch { expected: usize, actual: usize },
    #[error("Inference worker is no longer running")]
    WorkerUnavailable,
    #[error("Error: {msg}")]
    Unknown { msg: &'static str, #[source] source: anyhow::Error },
}

/// An opaque function mapping images and query strings into the same vector space.
///
/// Implementations are driven from a single inference thread (see [`worker::InferenceWorker`]), which is
/// why the methods take `&mut self`: no implementation ever sees concurrent calls.
pub trait Embedder: Send + 'static {
    /// Length of every vector this embedder produces.
    fn dimension(&self) -> usize;
    /// Embed a batch of images in a single call. Must return exactly one vector per input image, in order.
    fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
    /// Embed a free-text query.
    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Runs a batch through the embedder in one call, falling back to embedding every image on its own if the
/// batched call fails. The returned vector always has one entry per input image.
pub fn embed_batch_with_fallback(embedder: &mut dyn Embedder, images: &[DynamicImage])
    -> Vec<Result<Vec<f32>, EmbeddingError>> {
    if images.is_empty() {
        return vec![];
    }

    match embedder.embed_images(images) {
        Ok(vectors) if vectors.len() == images.len() => return vectors.into_iter().map(Ok).collect(),
        Ok(vectors) => warn!("Batched embedding returned {} vectors for {} images, retrying one at a time",
            vectors.len(), images.len()),
        Err(e) => warn!("Batched embedding of {} images failed, retrying one at a time: {}", images.len(), e),
    }

    images.iter()
        .map(|image| {
            let mut vectors = embedder.embed_images(std::slice::from_ref(image))?;
            match vectors.len() {
                1 => Ok(vectors.remove(0)),
                actual => Err(EmbeddingError::BatchSizeMismatch { expected: 1, actual }),
            }
        })
        .collect()
}

/// Scales a vector to unit length in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

pub mod sessions;
pub mod siglip2;
pub mod worker;
