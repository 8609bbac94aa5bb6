//! Face localization.
//!
//! The analyzer only needs a bounding box around the subject's face so that
//! background pixels (which also pick up the display's light) do not dilute
//! the reflection statistics. [`FaceDetector`] is the seam; the shipped
//! backend is [`ScrfdDetector`], the SCRFD-10G ONNX model run through ONNX
//! Runtime.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("image too small for detection: {width}x{height}")]
    TooSmall { width: u32, height: u32 },
    #[error("detector model not found: {0}")]
    ModelMissing(PathBuf),
    #[error("detector backend error: {0}")]
    Backend(String),
}

fn backend(e: impl std::fmt::Display) -> DetectorError {
    DetectorError::Backend(e.to_string())
}

/// Model file descriptor: download URL, file name and SHA-256 checksum.
pub struct ModelFile {
    pub name: &'static str,
    pub url: &'static str,
    pub sha256: &'static str,
    pub size_display: &'static str,
}

/// SCRFD-10G from the InsightFace buffalo_l pack.
pub const DETECTOR_MODEL: ModelFile = ModelFile {
    name: "det_10g.onnx",
    url: "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/det_10g.onnx",
    sha256: "5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91",
    size_display: "16 MB",
};

/// Axis-aligned face bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Grow the box by `margin` pixels on every side, clamped to an image of
    /// `image_width` x `image_height`. Never returns an empty box for a
    /// non-empty image.
    pub fn expanded(&self, margin: u32, image_width: u32, image_height: u32) -> FaceBox {
        let x0 = self.x.saturating_sub(margin).min(image_width.saturating_sub(1));
        let y0 = self.y.saturating_sub(margin).min(image_height.saturating_sub(1));
        let x1 = self
            .x
            .saturating_add(self.width)
            .saturating_add(margin)
            .min(image_width)
            .max(x0 + 1);
        let y1 = self
            .y
            .saturating_add(self.height)
            .saturating_add(margin)
            .min(image_height)
            .max(y0 + 1);
        FaceBox {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
            confidence: self.confidence,
        }
    }

    /// The same box on an image of another size, scaled per axis.
    pub fn rescaled(&self, from: (u32, u32), to: (u32, u32)) -> FaceBox {
        if from == to || from.0 == 0 || from.1 == 0 {
            return *self;
        }
        let sx = to.0 as f64 / from.0 as f64;
        let sy = to.1 as f64 / from.1 as f64;
        FaceBox {
            x: (self.x as f64 * sx).round() as u32,
            y: (self.y as f64 * sy).round() as u32,
            width: (self.width as f64 * sx).round() as u32,
            height: (self.height as f64 * sy).round() as u32,
            confidence: self.confidence,
        }
    }
}

/// Image to face boxes. `&mut self` lets backends keep scratch buffers or
/// inference sessions between calls.
pub trait FaceDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>, DetectorError>;
}

// ── SCRFD ──────────────────────────────────────────────────────────────────

const INPUT_SIZE: u32 = 640;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// SCRFD face detector over an ONNX Runtime session.
///
/// Output layout of the 10G export: three score tensors (strides 8, 16, 32)
/// followed by the three matching box-distance tensors and three keypoint
/// tensors, which are ignored.
pub struct ScrfdDetector {
    session: Session,
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl std::fmt::Debug for ScrfdDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrfdDetector")
            .field("score_threshold", &self.score_threshold)
            .field("nms_threshold", &self.nms_threshold)
            .finish_non_exhaustive()
    }
}

impl ScrfdDetector {
    /// Load the model from `path`. Fails fast when the file is missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DetectorError::ModelMissing(path.to_path_buf()));
        }
        let session = Session::builder()
            .map_err(backend)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(backend)?
            .with_intra_threads(1)
            .map_err(backend)?
            .commit_from_file(path)
            .map_err(backend)?;
        tracing::debug!(path = %path.display(), "SCRFD session created");
        Ok(Self {
            session,
            score_threshold: 0.5,
            nms_threshold: 0.4,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectorError::TooSmall { width, height });
        }

        let (blob, scale) = letterbox(image);
        let input = Tensor::from_array(blob).map_err(backend)?;
        let outputs = self.session.run(ort::inputs![input]).map_err(backend)?;
        if outputs.len() < 2 * STRIDES.len() {
            return Err(DetectorError::Backend(format!(
                "expected at least {} outputs, model produced {}",
                2 * STRIDES.len(),
                outputs.len()
            )));
        }

        let mut candidates = Vec::new();
        for (level, &stride) in STRIDES.iter().enumerate() {
            let (_, scores) = outputs[level]
                .try_extract_tensor::<f32>()
                .map_err(backend)?;
            let (_, distances) = outputs[level + STRIDES.len()]
                .try_extract_tensor::<f32>()
                .map_err(backend)?;
            decode_level(
                scores,
                distances,
                stride,
                self.score_threshold,
                scale,
                &mut candidates,
            );
        }

        let kept = non_max_suppression(candidates, self.nms_threshold);
        tracing::trace!(faces = kept.len(), "SCRFD detection");
        Ok(kept
            .into_iter()
            .filter_map(|c| c.to_face_box(width, height))
            .collect())
    }
}

/// Resize into the top-left of a `INPUT_SIZE` square keeping the aspect
/// ratio, normalized to `(v - 127.5) / 128` in NCHW RGB order. Padding is
/// black before normalization. Returns the blob and the resize factor.
fn letterbox(image: &RgbImage) -> (Array4<f32>, f32) {
    let (width, height) = image.dimensions();
    let scale = INPUT_SIZE as f32 / width.max(height) as f32;
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    let mut blob = Array4::<f32>::from_elem((1, 3, size, size), -127.5 / 128.0);
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            blob[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - 127.5) / 128.0;
        }
    }
    (blob, scale)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clamp to the image; `None` when nothing of the box is inside it.
    fn to_face_box(self, width: u32, height: u32) -> Option<FaceBox> {
        let x0 = self.x1.max(0.0).floor() as u32;
        let y0 = self.y1.max(0.0).floor() as u32;
        let x1 = (self.x2.max(0.0).ceil() as u32).min(width);
        let y1 = (self.y2.max(0.0).ceil() as u32).min(height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(FaceBox {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
            confidence: self.score,
        })
    }
}

/// Decode one stride level. Anchors sit at the top-left of each cell, two
/// per cell; distances are in units of the stride. Coordinates are mapped
/// back to the source image by dividing out `scale`.
fn decode_level(
    scores: &[f32],
    distances: &[f32],
    stride: u32,
    threshold: f32,
    scale: f32,
    out: &mut Vec<Candidate>,
) {
    let cells_per_row = (INPUT_SIZE / stride) as usize;
    let s = stride as f32;
    for (i, &score) in scores.iter().enumerate() {
        if score < threshold {
            continue;
        }
        let Some(d) = distances.get(i * 4..i * 4 + 4) else {
            break;
        };
        let cell = i / ANCHORS_PER_CELL;
        let cx = (cell % cells_per_row) as f32 * s;
        let cy = (cell / cells_per_row) as f32 * s;
        out.push(Candidate {
            x1: (cx - d[0] * s) / scale,
            y1: (cy - d[1] * s) / scale,
            x2: (cx + d[2] * s) / scale,
            y2: (cy + d[3] * s) / scale,
            score,
        });
    }
}

fn non_max_suppression(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= threshold) {
            kept.push(candidate);
        }
    }
    kept
}
