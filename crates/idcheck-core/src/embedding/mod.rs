//! Face detection and descriptor extraction.
//!
//! The model is external: anything implementing [`FaceInference`] can back
//! the service. [`FaceEmbeddingService`] adds the policy on top (one primary
//! face per image, confidence thresholds, the resolution retry for small
//! faces cropped from ID photos).

#[cfg(feature = "onnx")]
pub mod onnx;

use image::DynamicImage;
use thiserror::Error;

use crate::types::{BoundingBox, DescriptorError, DetectedFace, FaceDescriptor, Landmarks};

#[cfg(feature = "onnx")]
pub use onnx::OnnxFaceModel;

/// Detection threshold for faces on document photos.
pub const REFERENCE_MIN_CONFIDENCE: f32 = 0.1;
/// Detection threshold for live frames.
pub const LIVE_MIN_CONFIDENCE: f32 = 0.5;
/// Default detector input resolution.
pub const DEFAULT_INPUT_SIZE: u32 = 416;
/// Input resolution for the single retry on document photos.
pub const RETRY_INPUT_SIZE: u32 = 608;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[cfg(feature = "onnx")]
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectOptions {
    pub min_confidence: f32,
    /// Square input resolution the detector resizes to.
    pub input_size: u32,
}

impl DetectOptions {
    pub fn reference() -> Self {
        Self {
            min_confidence: REFERENCE_MIN_CONFIDENCE,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }

    pub fn live() -> Self {
        Self {
            min_confidence: LIVE_MIN_CONFIDENCE,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

/// Detector plus embedder. Sessions hold mutable scratch state, so both
/// calls take `&mut self` and the implementor lives on one thread at a time.
pub trait FaceInference: Send {
    /// All faces at or above `options.min_confidence`, in pixel coordinates
    /// of `image`.
    fn detect(
        &mut self,
        image: &DynamicImage,
        options: &DetectOptions,
    ) -> Result<Vec<DetectedFace>, InferenceError>;

    /// Raw descriptor values for one detected face.
    fn describe(
        &mut self,
        image: &DynamicImage,
        face: &DetectedFace,
    ) -> Result<Vec<f32>, InferenceError>;
}

/// One analysed face: where it is and who it is.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceAnalysis {
    pub face: DetectedFace,
    pub descriptor: FaceDescriptor,
}

impl FaceAnalysis {
    pub fn bbox(&self) -> &BoundingBox {
        &self.face.bbox
    }

    pub fn landmarks(&self) -> &Landmarks {
        &self.face.landmarks
    }

    pub fn detection_score(&self) -> f32 {
        self.descriptor.detection_score
    }
}

pub struct FaceEmbeddingService {
    model: Box<dyn FaceInference>,
}

impl FaceEmbeddingService {
    pub fn new(model: Box<dyn FaceInference>) -> Self {
        Self { model }
    }

    /// Highest-scoring face above the threshold, if any.
    pub fn detect_primary(
        &mut self,
        image: &DynamicImage,
        options: &DetectOptions,
    ) -> Result<Option<DetectedFace>, InferenceError> {
        let faces = self.model.detect(image, options)?;
        let count = faces.len();
        let primary = faces
            .into_iter()
            .filter(|f| f.score() >= options.min_confidence)
            .max_by(|a, b| a.score().total_cmp(&b.score()));
        if count > 1 {
            tracing::debug!(
                count,
                score = primary.as_ref().map(DetectedFace::score),
                "multiple faces, keeping highest score"
            );
        }
        Ok(primary)
    }

    /// Detect the primary face and compute its descriptor.
    pub fn analyze(
        &mut self,
        image: &DynamicImage,
        options: &DetectOptions,
    ) -> Result<Option<FaceAnalysis>, InferenceError> {
        let Some(face) = self.detect_primary(image, options)? else {
            return Ok(None);
        };
        let values = self.model.describe(image, &face)?;
        let descriptor = FaceDescriptor::new(values, face.score())?;
        Ok(Some(FaceAnalysis { face, descriptor }))
    }

    /// Analyse the face printed on a document: low threshold, and one retry
    /// at a larger input resolution when nothing is found.
    pub fn analyze_reference(
        &mut self,
        image: &DynamicImage,
    ) -> Result<Option<FaceAnalysis>, InferenceError> {
        let mut options = DetectOptions::reference();
        if let Some(found) = self.analyze(image, &options)? {
            tracing::info!(score = found.detection_score(), "reference face found");
            return Ok(Some(found));
        }

        options.input_size = RETRY_INPUT_SIZE;
        tracing::debug!(input_size = options.input_size, "no reference face, retrying");
        let found = self.analyze(image, &options)?;
        match &found {
            Some(f) => tracing::info!(score = f.detection_score(), "reference face found on retry"),
            None => tracing::warn!("no face on document photo"),
        }
        Ok(found)
    }

    /// Detection only, at the live-frame threshold.
    pub fn detect_live(
        &mut self,
        image: &DynamicImage,
    ) -> Result<Option<DetectedFace>, InferenceError> {
        self.detect_primary(image, &DetectOptions::live())
    }

    /// Full analysis of a live frame (the selfie).
    pub fn analyze_live(
        &mut self,
        image: &DynamicImage,
    ) -> Result<Option<FaceAnalysis>, InferenceError> {
        self.analyze(image, &DetectOptions::live())
    }
}
