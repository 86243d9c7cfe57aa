//! ONNX Runtime backend: a post-NMS face detector and a 128-d embedder.
//!
//! Detector contract: input `[1, 3, S, S]` RGB, `(p - 127.5) / 128`, where
//! `S` is [`DetectOptions::input_size`]; output `[N, 15]` rows of
//! `x1, y1, x2, y2, score, lx0, ly0, .., lx4, ly4`, coordinates relative to
//! the input (0..1).
//!
//! Embedder contract: input `[1, 3, 150, 150]` RGB scaled to 0..1, cropped
//! around the face box; output 128 floats.

use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;

use super::{DetectOptions, FaceInference, InferenceError};
use crate::types::{BoundingBox, DetectedFace, Landmarks, DESCRIPTOR_DIM};

const DETECTOR_MEAN: f32 = 127.5;
const DETECTOR_STD: f32 = 128.0;
const DETECTOR_ROW: usize = 15;
const EMBEDDER_INPUT_SIZE: u32 = 150;
/// Face box is grown by this fraction per side before cropping for the embedder.
const CROP_PADDING: f32 = 0.15;

pub struct OnnxFaceModel {
    detector: Session,
    embedder: Session,
}

fn load_session(path: &Path) -> Result<Session, InferenceError> {
    if !path.exists() {
        return Err(InferenceError::ModelNotFound(path.display().to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;
    tracing::info!(
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
    Ok(session)
}

impl OnnxFaceModel {
    pub fn load(detector_path: &Path, embedder_path: &Path) -> Result<Self, InferenceError> {
        Ok(Self {
            detector: load_session(detector_path)?,
            embedder: load_session(embedder_path)?,
        })
    }

    fn detector_input(image: &DynamicImage, size: u32) -> Array4<f32> {
        let resized = image.resize_exact(size, size, FilterType::Triangle).to_rgb8();
        let side = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (f32::from(pixel[c]) - DETECTOR_MEAN) / DETECTOR_STD;
            }
        }
        tensor
    }

    fn embedder_input(image: &DynamicImage, bbox: &BoundingBox) -> Array4<f32> {
        let pad_x = bbox.width * CROP_PADDING;
        let pad_y = bbox.height * CROP_PADDING;
        let x0 = (bbox.x - pad_x).max(0.0) as u32;
        let y0 = (bbox.y - pad_y).max(0.0) as u32;
        let x1 = ((bbox.x + bbox.width + pad_x) as u32).min(image.width());
        let y1 = ((bbox.y + bbox.height + pad_y) as u32).min(image.height());
        let crop = image.crop_imm(x0, y0, x1.saturating_sub(x0).max(1), y1.saturating_sub(y0).max(1));

        let resized = crop
            .resize_exact(EMBEDDER_INPUT_SIZE, EMBEDDER_INPUT_SIZE, FilterType::Triangle)
            .to_rgb8();
        let side = EMBEDDER_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = f32::from(pixel[c]) / 255.0;
            }
        }
        tensor
    }
}

/// Map one detector row back to pixel space of the source image.
fn decode_row(row: &[f32], width: f32, height: f32) -> DetectedFace {
    let (x1, y1) = (row[0] * width, row[1] * height);
    let (x2, y2) = (row[2] * width, row[3] * height);
    let mut points = [(0.0f32, 0.0f32); 5];
    for (i, point) in points.iter_mut().enumerate() {
        *point = (row[5 + 2 * i] * width, row[6 + 2 * i] * height);
    }
    DetectedFace {
        bbox: BoundingBox {
            x: x1,
            y: y1,
            width: (x2 - x1).max(0.0),
            height: (y2 - y1).max(0.0),
            confidence: row[4],
        },
        landmarks: Landmarks(points),
    }
}

impl FaceInference for OnnxFaceModel {
    fn detect(
        &mut self,
        image: &DynamicImage,
        options: &DetectOptions,
    ) -> Result<Vec<DetectedFace>, InferenceError> {
        let input = Self::detector_input(image, options.input_size);
        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::InferenceFailed(format!("detector output: {e}")))?;

        if data.len() % DETECTOR_ROW != 0 {
            return Err(InferenceError::InferenceFailed(format!(
                "detector output length {} is not a multiple of {DETECTOR_ROW}",
                data.len()
            )));
        }

        let (w, h) = (image.width() as f32, image.height() as f32);
        let faces: Vec<DetectedFace> = data
            .chunks_exact(DETECTOR_ROW)
            .filter(|row| row[4] >= options.min_confidence)
            .map(|row| decode_row(row, w, h))
            .collect();
        tracing::trace!(
            faces = faces.len(),
            input_size = options.input_size,
            "detector finished"
        );
        Ok(faces)
    }

    fn describe(
        &mut self,
        image: &DynamicImage,
        face: &DetectedFace,
    ) -> Result<Vec<f32>, InferenceError> {
        let input = Self::embedder_input(image, &face.bbox);
        let outputs = self
            .embedder
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::InferenceFailed(format!("embedder output: {e}")))?;
        if data.len() != DESCRIPTOR_DIM {
            return Err(InferenceError::InferenceFailed(format!(
                "expected {DESCRIPTOR_DIM}-dim descriptor, got {}",
                data.len()
            )));
        }
        Ok(data.to_vec())
    }
}
