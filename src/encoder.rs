//! Cross-modal embedding model wrapper for fastembed.
//!
//! Text and images must land in the same space, so the text and vision
//! towers have to come from the same CLIP checkpoint; mixing checkpoints
//! silently breaks retrieval. Models download on first use into the
//! configured cache directory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    TextEmbedding,
};

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Encoding failed: {0}")]
    EncodeFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Encoder capability: text and image into one native embedding space.
/// Outputs are L2-normalized.
pub trait Encoder: Send + Sync {
    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncoderError>;
    fn encode_text_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError>;
    fn encode_image(&self, path: &Path) -> Result<Vec<f32>, EncoderError>;
    /// Native embedding dimension (D_native).
    fn dimensions(&self) -> usize;
}

/// CLIP ViT-B/32 text + vision towers via fastembed.
/// Mutexes because fastembed's embed() requires &mut self.
pub struct ClipEncoder {
    text: Mutex<TextEmbedding>,
    image: Mutex<ImageEmbedding>,
    dimensions: usize,
}

impl ClipEncoder {
    /// Load (downloading if needed) the CLIP pair named by `model_name`.
    ///
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EncoderError> {
        let (text_model, image_model) = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EncoderError::InitFailed(format!("failed to create models directory: {e}"))
        })?;

        let text_options = InitOptions::new(text_model)
            .with_cache_dir(models_dir.clone())
            .with_show_download_progress(true);
        let mut text = TextEmbedding::try_new(text_options)
            .map_err(|e| EncoderError::InitFailed(e.to_string()))?;

        let image_options = ImageInitOptions::new(image_model)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);
        let image = ImageEmbedding::try_new(image_options)
            .map_err(|e| EncoderError::InitFailed(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut text)?;

        Ok(Self {
            text: Mutex::new(text),
            image: Mutex::new(image),
            dimensions,
        })
    }

    /// Map a model name to the matched (text, vision) tower pair.
    fn parse_model_name(
        name: &str,
    ) -> Result<(EmbeddingModel, ImageEmbeddingModel), EncoderError> {
        match name.to_lowercase().as_str() {
            "clip-vit-b-32" | "clipvitb32" => {
                Ok((EmbeddingModel::ClipVitB32, ImageEmbeddingModel::ClipVitB32))
            }
            _ => Err(EncoderError::InvalidModel(format!(
                "Unknown model: {name}. Supported models: clip-ViT-B-32 \
                 (text and vision towers must come from the same checkpoint)"
            ))),
        }
    }

    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EncoderError> {
        let probe = model
            .embed(vec!["test"], None)
            .map_err(|e| EncoderError::InitFailed(format!("failed to probe dimensions: {e}")))?;
        probe
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EncoderError::InitFailed("model returned no embedding".to_string()))
    }
}

impl Encoder for ClipEncoder {
    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncoderError> {
        let mut model = self
            .text
            .lock()
            .map_err(|e| EncoderError::EncodeFailed(format!("model lock poisoned: {e}")))?;

        model
            .embed(vec![text], None)
            .map_err(|e| EncoderError::EncodeFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EncoderError::EncodeFailed("no embedding returned".to_string()))
    }

    fn encode_text_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self
            .text
            .lock()
            .map_err(|e| EncoderError::EncodeFailed(format!("model lock poisoned: {e}")))?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EncoderError::EncodeFailed(e.to_string()))
    }

    fn encode_image(&self, path: &Path) -> Result<Vec<f32>, EncoderError> {
        let mut model = self
            .image
            .lock()
            .map_err(|e| EncoderError::EncodeFailed(format!("model lock poisoned: {e}")))?;

        model
            .embed(vec![path], None)
            .map_err(|e| EncoderError::EncodeFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EncoderError::EncodeFailed("no embedding returned".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Defers model download and session construction until the first encode
/// call. Commands that never embed skip the startup cost entirely.
pub struct LazyClipEncoder {
    model_name: String,
    cache_dir: PathBuf,
    expected_dimensions: usize,
    inner: Mutex<Option<Arc<ClipEncoder>>>,
}

impl LazyClipEncoder {
    pub fn new(model_name: &str, cache_dir: PathBuf, expected_dimensions: usize) -> Self {
        Self {
            model_name: model_name.to_string(),
            cache_dir,
            expected_dimensions,
            inner: Mutex::new(None),
        }
    }

    fn encoder(&self) -> Result<Arc<ClipEncoder>, EncoderError> {
        let mut slot = self
            .inner
            .lock()
            .map_err(|e| EncoderError::InitFailed(format!("model lock poisoned: {e}")))?;
        if let Some(encoder) = slot.as_ref() {
            return Ok(encoder.clone());
        }

        let encoder = Arc::new(ClipEncoder::new(&self.model_name, self.cache_dir.clone())?);
        if encoder.dimensions() != self.expected_dimensions {
            return Err(EncoderError::InitFailed(format!(
                "model {} emits {}-d embeddings, expected {}",
                self.model_name,
                encoder.dimensions(),
                self.expected_dimensions
            )));
        }
        *slot = Some(encoder.clone());
        Ok(encoder)
    }
}

impl Encoder for LazyClipEncoder {
    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncoderError> {
        self.encoder()?.encode_text(text)
    }

    fn encode_text_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError> {
        self.encoder()?.encode_text_batch(texts)
    }

    fn encode_image(&self, path: &Path) -> Result<Vec<f32>, EncoderError> {
        self.encoder()?.encode_image(path)
    }

    fn dimensions(&self) -> usize {
        self.expected_dimensions
    }
}
