use std::thread;

use crossbeam_channel::{Receiver, Sender};
use image::DynamicImage;
use log::{debug, info};
use tokio::sync::oneshot;

use crate::embedding::{embed_batch_with_fallback, Embedder, EmbeddingError};

type BatchReply = Vec<Result<Vec<f32>, EmbeddingError>>;

enum Job {
    Batch { images: Vec<DynamicImage>, reply: oneshot::Sender<BatchReply> },
    Text { text: String, reply: oneshot::Sender<Result<Vec<f32>, EmbeddingError>> },
}

/// Handle to the dedicated inference thread.
///
/// The embedder is moved onto its own OS thread and every request is funneled through one queue, so model
/// calls from the indexing pipeline, the search engine and the folder watchers never run concurrently and
/// never block an async executor thread. Handles are cheap to clone; the thread exits once every handle
/// has been dropped.
#[derive(Clone)]
pub struct InferenceWorker {
    sender: Sender<Job>,
    dimension: usize,
}

impl InferenceWorker {
    pub fn spawn<E: Embedder>(embedder: E) -> Result<InferenceWorker, EmbeddingError> {
        let dimension = embedder.dimension();
        let (sender, receiver) = crossbeam_channel::unbounded();

        thread::Builder::new()
            .name("imgsrch-inference".to_owned())
            .spawn(move || run(embedder, receiver))
            .map_err(|e| EmbeddingError::Initialization(e.into()))?;

        Ok(InferenceWorker { sender, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embeds a batch of images. The outer error means the worker is gone; the inner results are per image,
    /// in input order.
    pub async fn embed_batch(&self, images: Vec<DynamicImage>) -> Result<BatchReply, EmbeddingError> {
        let (reply, response) = oneshot::channel();
        self.sender.send(Job::Batch { images, reply })
            .map_err(|_| EmbeddingError::WorkerUnavailable)?;
        response.await.map_err(|_| EmbeddingError::WorkerUnavailable)
    }

    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let (reply, response) = oneshot::channel();
        self.sender.send(Job::Text { text: text.to_owned(), reply })
            .map_err(|_| EmbeddingError::WorkerUnavailable)?;
        response.await.map_err(|_| EmbeddingError::WorkerUnavailable)?
    }

    /// Blocking variant for callers outside the async runtime (filesystem watcher threads).
    /// Must not be called from within an async task.
    pub fn embed_image_blocking(&self, image: DynamicImage) -> Result<Vec<f32>, EmbeddingError> {
        let (reply, response) = oneshot::channel();
        self.sender.send(Job::Batch { images: vec![image], reply })
            .map_err(|_| EmbeddingError::WorkerUnavailable)?;
        let mut results = response.blocking_recv().map_err(|_| EmbeddingError::WorkerUnavailable)?;
        match results.len() {
            1 => results.remove(0),
            actual => Err(EmbeddingError::BatchSizeMismatch { expected: 1, actual }),
        }
    }
}

fn run<E: Embedder>(mut embedder: E, receiver: Receiver<Job>) {
    info!("Inference worker started (dimension {})", embedder.dimension());

    while let Ok(job) = receiver.recv() {
        match job {
            Job::Batch { images, reply } => {
                debug!("Inference worker: embedding batch of {} images", images.len());
                let results = embed_batch_with_fallback(&mut embedder, &images);
                // receiver may have given up waiting, nothing to do about it
                let _ = reply.send(results);
            },
            Job::Text { text, reply } => {
                debug!("Inference worker: embedding query text");
                let _ = reply.send(embedder.embed_text(&text));
            },
        }
    }

    info!("Inference worker stopped");
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;

    struct Doubler;

    impl Embedder for Doubler {
        fn dimension(&self) -> usize {
            2
        }

        fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(images.iter().map(|i| vec![i.width() as f32 * 2.0, i.height() as f32 * 2.0]).collect())
        }

        fn embed_text(&mut self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![text.len() as f32, 0.0])
        }
    }

    #[tokio::test]
    async fn answers_batches_in_order() {
        let worker = InferenceWorker::spawn(Doubler).unwrap();
        assert_eq!(worker.dimension(), 2);

        let images = vec![
            DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 2, Rgb([0, 0, 0]))),
            DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 4, Rgb([0, 0, 0]))),
        ];
        let results = worker.embed_batch(images).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), &vec![2.0, 4.0]);
        assert_eq!(results[1].as_ref().unwrap(), &vec![6.0, 8.0]);
        assert_eq!(worker.embed_text("abc").await.unwrap(), vec![3.0, 0.0]);
    }

    #[test]
    fn blocking_calls_work_off_runtime() {
        let worker = InferenceWorker::spawn(Doubler).unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(5, 1, Rgb([0, 0, 0])));
        assert_eq!(worker.embed_image_blocking(image).unwrap(), vec![10.0, 2.0]);
    }
}
