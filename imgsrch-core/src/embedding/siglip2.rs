use std::fmt::Display;

use camino::{Utf8Path, Utf8PathBuf};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use log::debug;
use ndarray::{Array, Array2, Array4, ArrayD, ArrayViewD, Axis};
use ort::{inputs, session::Session, value::TensorRef};
use tokenizers::Tokenizer;

use crate::embedding::{sessions::{create_session, create_tokenizer}, Embedder, EmbeddingError};

/// SigLIP2 (base, patch16, 512px) image and text towers exported to ONNX.
///
/// Expects the following files under the model directory:
/// - `siglip2-base-patch16-512/image_embedder.onnx`
/// - `siglip2-base-patch16-512/text_embedder.onnx`
/// - `siglip2-base-patch16-512/tokenizer.json`
pub struct Siglip2Embedder {
    image_session: Session,
    text_session: Session,
    tokenizer: Tokenizer,
}

impl Siglip2Embedder {
    pub const VECTOR_LENGTH: usize = 768;

    pub fn load(model_directory: &Utf8Path) -> Result<Siglip2Embedder, EmbeddingError> {
        debug!("Initializing Siglip2 embedding resources from {}", model_directory);
        let base = model_directory.join(MODEL_FOLDER);
        Ok(Siglip2Embedder {
            image_session: create_session(&base.join(IMAGE_MODEL_FILE))?,
            text_session: create_session(&base.join(TEXT_MODEL_FILE))?,
            tokenizer: create_tokenizer(&base.join(TOKENIZER_FILE))?,
        })
    }

    /// Paths of the files [`Siglip2Embedder::load`] needs, for callers that want to report what is missing.
    pub fn required_files(model_directory: &Utf8Path) -> Vec<Utf8PathBuf> {
        let base = model_directory.join(MODEL_FOLDER);
        [IMAGE_MODEL_FILE, TEXT_MODEL_FILE, TOKENIZER_FILE].iter()
            .map(|f| base.join(f))
            .collect()
    }
}

impl Embedder for Siglip2Embedder {
    fn dimension(&self) -> usize {
        Self::VECTOR_LENGTH
    }

    fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let batch = images.len();
        let element = format!("batch of {} images", batch);
        let input = pixel_tensor(images);

        let outputs = self.image_session.run(inputs![
                "input" => TensorRef::from_array_view(&input)
                    .map_err(|e| EmbeddingError::Preprocessing {
                        element: element.clone(),
                        step: "Converting to tensor",
                        source: anyhow::anyhow!("{e}"),
                    })?
            ])
            .map_err(|e| EmbeddingError::Calculation {
                element: element.clone(),
                step: "Performing image embedding",
                source: anyhow::anyhow!("{e}"),
            })?;

        let output = outputs.get("output").ok_or_else(|| missing_output(&element))?;
        let matrix = to_matrix(extract_array(output.try_extract_array::<f32>())?, batch, &element)?;
        Ok(matrix.outer_iter().map(|row| row.to_vec()).collect())
    }

    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let element = format!("Query: {}", text);
        let encoding = self.tokenizer.encode(text.to_lowercase(), false)
            .map_err(|e| EmbeddingError::Preprocessing {
                element: element.clone(),
                step: "tokenizing",
                source: anyhow::anyhow!(e),
            })?;
        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|n| *n as i64).collect();
        let input = Array::from_vec(input_ids).insert_axis(Axis(0));

        let outputs = self.text_session.run(inputs![
                "input" => TensorRef::from_array_view(&input)
                    .map_err(|e| EmbeddingError::Preprocessing {
                        element: element.clone(),
                        step: "Converting to tensor",
                        source: anyhow::anyhow!("{e}"),
                    })?
            ])
            .map_err(|e| EmbeddingError::Calculation {
                element: element.clone(),
                step: "Performing text embedding",
                source: anyhow::anyhow!("{e}"),
            })?;

        let output = outputs.get("output").ok_or_else(|| missing_output(&element))?;
        let matrix = to_matrix(extract_array(output.try_extract_array::<f32>())?, 1, &element)?;
        Ok(matrix.row(0).to_vec())
    }
}

// Private functions and variables

const MODEL_FOLDER: &str = "siglip2-base-patch16-512";
const IMAGE_MODEL_FILE: &str = "image_embedder.onnx";
const TEXT_MODEL_FILE: &str = "text_embedder.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";
const IMAGE_SIDE: u32 = 512;

/// Resizes every image to the model's input size and packs them into an NCHW tensor scaled to [0, 1].
fn pixel_tensor(images: &[DynamicImage]) -> Array4<f32> {
    let side = IMAGE_SIDE as usize;
    let mut input = Array::zeros((images.len(), 3, side, side));
    for (n, img) in images.iter().enumerate() {
        let resized = img.resize_exact(IMAGE_SIDE, IMAGE_SIDE, FilterType::Triangle);
        for (x, y, pixel) in resized.pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b, _] = pixel.0;
            input[[n, 0, y, x]] = (r as f32) / 255.;
            input[[n, 1, y, x]] = (g as f32) / 255.;
            input[[n, 2, y, x]] = (b as f32) / 255.;
        }
    }
    input
}

fn missing_output(element: &str) -> EmbeddingError {
    EmbeddingError::Calculation {
        element: element.to_owned(),
        step: "Reading model output",
        source: anyhow::anyhow!("model did not place its result in the 'output' key"),
    }
}

fn extract_array<E: Display>(extracted: Result<ArrayViewD<'_, f32>, E>) -> Result<ArrayD<f32>, EmbeddingError> {
    extracted
        .map(|view| view.into_owned())
        .map_err(|e| EmbeddingError::Unknown {
            msg: "Error while extracting array from output as f32",
            source: anyhow::anyhow!("{e}"),
        })
}

/// Model returns a (rows, 768) shaped array
fn to_matrix(array: ArrayD<f32>, rows: usize, element: &str) -> Result<Array2<f32>, EmbeddingError> {
    array.into_shape_with_order((rows, Siglip2Embedder::VECTOR_LENGTH))
        .map_err(|e| EmbeddingError::Calculation {
            element: element.to_owned(),
            step: "Reshaping model output",
            source: e.into(),
        })
}
