//! Face embedding capability and its ArcFace implementation.

use crate::types::{BoundingBox, Embedding, FrameRef};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
/// Context added around the detector box on each side, as a fraction of its size.
const CROP_MARGIN: f32 = 0.1;

#[derive(Error, Debug)]
pub enum EncodeError {
    /// The region cannot yield an embedding (too small, outside the frame, ...).
    #[error("encoding failed: {0}")]
    EncodingFailed(String),
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns one detected face region into a fixed-dimension embedding.
pub trait FaceEncoder: Send {
    fn encode(&mut self, frame: &FrameRef<'_>, region: &BoundingBox) -> Result<Embedding, EncodeError>;
}

/// ArcFace (w600k_r50) encoder backed by ONNX Runtime, producing
/// L2-normalised 512-dimensional embeddings.
pub struct ArcFaceEncoder {
    session: Session,
    /// Regions narrower or shorter than this (pixels) are rejected.
    min_face_size: u32,
}

impl ArcFaceEncoder {
    pub fn load(model_path: &str, min_face_size: u32) -> Result<Self, EncodeError> {
        if !Path::new(model_path).exists() {
            return Err(EncodeError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, min_face_size, "loaded ArcFace model");
        Ok(Self { session, min_face_size })
    }

    fn preprocess(crop: &GrayImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, p) in crop.enumerate_pixels() {
            let v = (p[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = v;
            }
        }
        tensor
    }
}

impl FaceEncoder for ArcFaceEncoder {
    fn encode(&mut self, frame: &FrameRef<'_>, region: &BoundingBox) -> Result<Embedding, EncodeError> {
        let crop = crop_face(frame, region, self.min_face_size)?;
        let input = Self::preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncodeError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EncodeError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(l2_normalize(raw))
    }
}

/// Cut the region (plus margin) out of the frame and resize it to the model input.
fn crop_face(frame: &FrameRef<'_>, region: &BoundingBox, min_face_size: u32) -> Result<GrayImage, EncodeError> {
    if !frame.is_complete() {
        return Err(EncodeError::EncodingFailed("incomplete frame".into()));
    }
    if region.width < min_face_size as f32 || region.height < min_face_size as f32 {
        return Err(EncodeError::EncodingFailed(format!(
            "face {:.0}x{:.0} below minimum {min_face_size}px",
            region.width, region.height
        )));
    }

    let mx = region.width * CROP_MARGIN;
    let my = region.height * CROP_MARGIN;
    let x0 = (region.x - mx).max(0.0) as u32;
    let y0 = (region.y - my).max(0.0) as u32;
    let x1 = ((region.x + region.width + mx).min(frame.width as f32)).max(0.0) as u32;
    let y1 = ((region.y + region.height + my).min(frame.height as f32)).max(0.0) as u32;
    if x1 <= x0 || y1 <= y0 {
        return Err(EncodeError::EncodingFailed("face lies outside the frame".into()));
    }

    let pixels = (frame.width * frame.height) as usize;
    let image = GrayImage::from_raw(frame.width, frame.height, frame.data[..pixels].to_vec())
        .ok_or_else(|| EncodeError::EncodingFailed("buffer does not fit dimensions".into()))?;
    let face = imageops::crop_imm(&image, x0, y0, x1 - x0, y1 - y0).to_image();
    Ok(imageops::resize(&face, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle))
}

fn l2_normalize(raw: &[f32]) -> Embedding {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    let values = if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    };
    Embedding::new(values)
}
