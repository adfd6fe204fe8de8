//! Face detection capability and its SCRFD implementation.
//!
//! SCRFD is anchor-free over three strides; per stride the model emits a
//! score per anchor and four edge distances (in stride units) per anchor.

use crate::types::{BoundingBox, FrameRef};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a frame. Output order carries no identity meaning
/// and may change from one frame to the next.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &FrameRef<'_>) -> Result<Vec<BoundingBox>, DetectError>;
}

/// Mapping from letterboxed model space back to frame space.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);
        let (w, h) = Self::scaled(width, height, scale);
        Self {
            scale,
            pad_x: ((SCRFD_INPUT_SIZE - w) / 2) as f32,
            pad_y: ((SCRFD_INPUT_SIZE - h) / 2) as f32,
        }
    }

    fn scaled(width: u32, height: u32, scale: f32) -> (u32, u32) {
        let w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        (w, h)
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD detector backed by ONNX Runtime.
pub struct ScrfdDetector {
    session: Session,
    /// (score, bbox) output index per stride.
    outputs: [(usize, usize); 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectError> {
        if !Path::new(model_path).exists() {
            return Err(DetectError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(DetectError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let outputs = output_layout(&names);
        tracing::info!(path = model_path, ?names, ?outputs, "loaded SCRFD model");

        Ok(Self { session, outputs })
    }

    fn preprocess(frame: &FrameRef<'_>) -> Result<(Array4<f32>, Letterbox), DetectError> {
        if !frame.is_complete() {
            return Err(DetectError::InvalidFrame(format!(
                "{}x{} frame with {} bytes",
                frame.width,
                frame.height,
                frame.data.len()
            )));
        }
        let pixels = (frame.width * frame.height) as usize;
        let src = GrayImage::from_raw(frame.width, frame.height, frame.data[..pixels].to_vec())
            .ok_or_else(|| DetectError::InvalidFrame("buffer does not fit dimensions".into()))?;

        let letterbox = Letterbox::fit(frame.width, frame.height);
        let (w, h) = Letterbox::scaled(frame.width, frame.height, letterbox.scale);
        let resized = imageops::resize(&src, w, h, FilterType::Triangle);

        // Zeros are the normalised padding value.
        let size = SCRFD_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        for (x, y, p) in resized.enumerate_pixels() {
            let v = (p[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, oy + y as usize, ox + x as usize]] = v;
            }
        }
        Ok((tensor, letterbox))
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &FrameRef<'_>) -> Result<Vec<BoundingBox>, DetectError> {
        let (input, letterbox) = Self::preprocess(frame)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in SCRFD_STRIDES.iter().zip(self.outputs.iter()) {
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            decode_stride(scores, boxes, stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD, &mut candidates);
        }

        let faces = suppress_overlaps(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection");
        Ok(faces)
    }
}

/// Find (score, bbox) outputs per stride by name ("score_8", "bbox_8", ...),
/// else assume the stock export order: scores 8/16/32 then boxes 8/16/32.
fn output_layout(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: u32| names.iter().position(|n| *n == format!("{prefix}_{stride}"));
    let named: Option<Vec<(usize, usize)>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: u32,
    letterbox: &Letterbox,
    threshold: f32,
    out: &mut Vec<BoundingBox>,
) {
    let grid_w = (SCRFD_INPUT_SIZE / stride) as usize;
    let s = stride as f32;

    for (idx, &score) in scores.iter().enumerate() {
        if score < threshold {
            continue;
        }
        let Some(d) = boxes.get(idx * 4..idx * 4 + 4) else {
            break;
        };
        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let cx = ((cell % grid_w) as u32 * stride) as f32;
        let cy = ((cell / grid_w) as u32 * stride) as f32;

        let (x1, y1) = letterbox.unmap(cx - d[0] * s, cy - d[1] * s);
        let (x2, y2) = letterbox.unmap(cx + d[2] * s, cy + d[3] * s);
        out.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
        });
    }
}

/// Greedy non-maximum suppression; result is ordered by confidence.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::new();
    for c in candidates {
        if kept.iter().all(|k| k.iou(&c) <= iou_threshold) {
            kept.push(c);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence }
    }

    #[test]
    fn test_suppress_overlapping() {
        let kept = suppress_overlaps(
            vec![
                bbox(0.0, 0.0, 100.0, 100.0, 0.8),
                bbox(5.0, 5.0, 100.0, 100.0, 0.9),
                bbox(300.0, 300.0, 50.0, 50.0, 0.6),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.6);
    }

    #[test]
    fn test_suppress_empty() {
        assert!(suppress_overlaps(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_landscape() {
        let lb = Letterbox::fit(1280, 720);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);
        let (x, y) = lb.unmap(320.0, 140.0);
        assert!((x - 640.0).abs() < 1e-3 && y.abs() < 1e-3);
    }

    #[test]
    fn test_decode_stride_maps_to_frame_space() {
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let grid = (SCRFD_INPUT_SIZE / 32) as usize;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];

        // Cell (col 1, row 2), second anchor.
        let idx = (2 * grid + 1) * SCRFD_ANCHORS_PER_CELL + 1;
        scores[idx] = 0.9;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 1.0, 1.0]);

        let mut out = Vec::new();
        decode_stride(&scores, &boxes, 32, &lb, 0.5, &mut out);
        assert_eq!(out.len(), 1);
        let b = &out[0];
        assert!((b.x - 16.0).abs() < 1e-4);
        assert!((b.y - 48.0).abs() < 1e-4);
        assert!((b.width - 48.0).abs() < 1e-4);
        assert!((b.height - 48.0).abs() < 1e-4);
    }

    #[test]
    fn test_output_layout_named_and_positional() {
        let named: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(output_layout(&named), [(1, 0), (3, 2), (5, 4)]);

        let numeric: Vec<String> = (0..9).map(|i| (400 + i).to_string()).collect();
        assert_eq!(output_layout(&numeric), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_preprocess_rejects_short_buffer() {
        let data = vec![0u8; 10];
        let frame = FrameRef::new(&data, 640, 480);
        assert!(matches!(ScrfdDetector::preprocess(&frame), Err(DetectError::InvalidFrame(_))));
    }

    #[test]
    fn test_preprocess_shape_and_padding() {
        let data = vec![255u8; 64 * 32];
        let frame = FrameRef::new(&data, 64, 32);
        let (tensor, lb) = ScrfdDetector::preprocess(&frame).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(lb.pad_y, 160.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 1, 320, 320]];
        assert!((inside - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-3);
    }
}
