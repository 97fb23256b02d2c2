#![allow(dead_code)]

use std::{fs, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use imgsrch_core::{
    embedding::{worker::InferenceWorker, Embedder, EmbeddingError},
    indexing::{IndexingPipeline, StatusTracker},
    store::EmbeddingStore,
};
use tempfile::TempDir;

pub const DIMENSION: usize = 4;

/// Maps an image to its mean colour and text to a colour keyword, so red images rank first for "red".
pub struct FakeEmbedder;

impl Embedder for FakeEmbedder {
    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(images.iter().map(mean_colour).collect())
    }

    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = text.to_lowercase();
        Ok(if text.contains("red") {
            vec![1.0, 0.0, 0.0, 0.0]
        } else if text.contains("green") {
            vec![0.0, 1.0, 0.0, 0.0]
        } else if text.contains("blue") {
            vec![0.0, 0.0, 1.0, 0.0]
        } else {
            vec![0.0, 0.0, 0.0, 1.0]
        })
    }
}

fn mean_colour(image: &DynamicImage) -> Vec<f32> {
    let mut sums = [0.0f32; 3];
    let mut count = 0.0f32;
    for (_, _, pixel) in image.pixels() {
        for channel in 0..3 {
            sums[channel] += pixel.0[channel] as f32 / 255.0;
        }
        count += 1.0;
    }
    vec![sums[0] / count, sums[1] / count, sums[2] / count, 0.1]
}

pub const RED: [u8; 3] = [250, 10, 10];
pub const GREEN: [u8; 3] = [10, 250, 10];
pub const BLUE: [u8; 3] = [10, 10, 250];

pub struct TestDir {
    _dir: TempDir,
    pub path: Utf8PathBuf,
}

pub fn temp_dir() -> TestDir {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().canonicalize().unwrap()).unwrap();
    TestDir { _dir: dir, path }
}

/// Writes a small solid colour image; the format follows the extension.
pub fn write_image(path: &Utf8Path, colour: [u8; 3]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    RgbImage::from_pixel(8, 8, Rgb(colour)).save(path).unwrap();
}

pub fn write_garbage(path: &Utf8Path) {
    fs::write(path, b"definitely not an image").unwrap();
}

pub async fn open_store(data_dir: &Utf8Path) -> Arc<EmbeddingStore> {
    Arc::new(EmbeddingStore::open(data_dir, "image_embeddings", DIMENSION).await.unwrap())
}

pub fn spawn_worker() -> InferenceWorker {
    InferenceWorker::spawn(FakeEmbedder).unwrap()
}

pub fn pipeline(store: Arc<EmbeddingStore>, status: Arc<StatusTracker>) -> IndexingPipeline {
    IndexingPipeline::new(store, spawn_worker(), status)
        .with_batch_size(2)
        .with_progress_interval(1)
}
