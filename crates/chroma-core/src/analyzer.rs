//! Per-frame reflection statistics.
//!
//! Each colored frame is compared with the reference frame (captured while
//! the display was transparent). Both are cut down to the subject's face,
//! brought to a common size and differenced channel by channel. The
//! difference image is what the displayed color added to the scene.

use crate::clustering::KMeans;
use crate::color_name::color_name;
use crate::detector::{FaceBox, FaceDetector};
use crate::event_log::FrameLabel;
use crate::extractor::ExtractedFrame;
use crate::heuristics::{Channel, ColorNaming};
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("frames cannot be brought to a common size ({width}x{height})")]
    DimensionMismatch { width: u32, height: u32 },
}

/// Part of the face region the statistics are computed over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionFocus {
    #[default]
    Full,
    /// Central two thirds of the face box.
    Face,
    Forehead,
    Cheeks,
}

impl RegionFocus {
    /// Pixel bounds `(x0, y0, x1, y1)` inside a `width` x `height` region,
    /// end-exclusive and never empty.
    pub fn bounds(self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let (w, h) = (width, height);
        let (x0, y0, x1, y1) = match self {
            RegionFocus::Full => (0, 0, w, h),
            RegionFocus::Face => (w / 6, h / 6, 5 * w / 6, 5 * h / 6),
            RegionFocus::Forehead => (w / 6, h / 6, 5 * w / 6, h / 3),
            RegionFocus::Cheeks => (w / 6, h / 3, 5 * w / 6, 2 * h / 3),
        };
        let x0 = x0.min(w.saturating_sub(1));
        let y0 = y0.min(h.saturating_sub(1));
        (x0, y0, x1.min(w).max(x0 + 1), y1.min(h).max(y0 + 1))
    }
}

impl FromStr for RegionFocus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(RegionFocus::Full),
            "face" => Ok(RegionFocus::Face),
            "forehead" => Ok(RegionFocus::Forehead),
            "cheeks" => Ok(RegionFocus::Cheeks),
            other => Err(format!("unknown region '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Summed per-pixel channel difference above which a pixel counts as
    /// affected by the reflection.
    pub threshold: u32,
    pub region: RegionFocus,
    /// Pixels added around a detected face box.
    pub face_margin: u32,
    pub max_clusters: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            threshold: 20,
            region: RegionFocus::Full,
            face_margin: 20,
            max_clusters: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelValues {
    #[serde(rename = "Red")]
    pub red: f64,
    #[serde(rename = "Green")]
    pub green: f64,
    #[serde(rename = "Blue")]
    pub blue: f64,
}

impl ChannelValues {
    pub fn get(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Red => self.red,
            Channel::Green => self.green,
            Channel::Blue => self.blue,
        }
    }

    /// Channel with the largest mean; ties go to the earlier of Red, Green, Blue.
    pub fn dominant(&self) -> Channel {
        let mut best = Channel::Red;
        for channel in Channel::ALL {
            if self.get(channel) > self.get(best) {
                best = channel;
            }
        }
        best
    }
}

/// A cluster of the reflection's difference colors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedColor {
    pub rgb: [u8; 3],
    pub percentage: f64,
    pub name: String,
}

/// Sizes involved in one comparison, as `"WxH"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResolution {
    pub base_frame: String,
    pub reflection_frame: String,
    pub face_region: String,
    pub roi: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceDetected {
    pub base_frame: bool,
    pub reflection_frame: bool,
}

/// Reflection statistics for one colored frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameStats {
    pub color: String,
    pub timestamp: i64,
    /// Mean difference over every channel of every ROI pixel.
    pub intensity: f64,
    pub channel_values: ChannelValues,
    pub dominant_channel: Channel,
    /// Percentage of ROI pixels above the difference threshold.
    pub affected_pixels: f64,
    pub detected_colors: Vec<DetectedColor>,
    pub image_resolution: ImageResolution,
    pub face_detected: FaceDetected,
}

/// A colored frame that could not be analyzed.
#[derive(Debug, Clone)]
pub struct FrameFailure {
    pub label: FrameLabel,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct SessionAnalysis {
    pub stats: Vec<FrameStats>,
    pub failures: Vec<FrameFailure>,
}

fn dims(w: u32, h: u32) -> String {
    format!("{w}x{h}")
}

impl fmt::Display for FrameFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.error)
    }
}

pub struct ReflectionAnalyzer {
    config: AnalyzerConfig,
    naming: ColorNaming,
}

impl ReflectionAnalyzer {
    pub fn new(config: AnalyzerConfig, naming: ColorNaming) -> Self {
        Self { config, naming }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyze every colored frame against `reference`. A frame that fails is
    /// logged and recorded, and does not stop the others.
    ///
    /// The face is located once, on the untinted reference; every colored
    /// frame is cut to that same box so the comparison covers the same pixels.
    pub fn analyze_session(
        &self,
        detector: &mut dyn FaceDetector,
        reference: &ExtractedFrame,
        colored: &[ExtractedFrame],
    ) -> SessionAnalysis {
        let face = self.locate_face(detector, &reference.image);
        let mut analysis = SessionAnalysis::default();
        for frame in colored {
            match self.analyze(face, reference, frame) {
                Ok(stats) => analysis.stats.push(stats),
                Err(e) => {
                    tracing::warn!(frame = %frame.label, error = %e, "frame analysis failed");
                    analysis.failures.push(FrameFailure {
                        label: frame.label.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        analysis
    }

    /// Largest face in `image`, or `None` when detection finds nothing or
    /// fails. The analyzer then uses the whole frame.
    pub fn locate_face(
        &self,
        detector: &mut dyn FaceDetector,
        image: &RgbImage,
    ) -> Option<FaceBox> {
        let faces = match detector.detect(image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::debug!(error = %e, "face detection failed, using whole frame");
                return None;
            }
        };
        let face = faces.into_iter().max_by_key(|f| f.area());
        if face.is_none() {
            tracing::debug!("no face detected, using whole frame");
        }
        face
    }

    /// Reflection statistics of `colored` relative to `reference`, both cut
    /// to `face` (located on the reference) plus margin.
    pub fn analyze(
        &self,
        face: Option<FaceBox>,
        reference: &ExtractedFrame,
        colored: &ExtractedFrame,
    ) -> Result<FrameStats, AnalysisError> {
        let base_face = self.face_region(face, &reference.image, reference.image.dimensions());
        let tint_face = self.face_region(face, &colored.image, reference.image.dimensions());

        let width = base_face.width().min(tint_face.width());
        let height = base_face.height().min(tint_face.height());
        if width == 0 || height == 0 {
            return Err(AnalysisError::DimensionMismatch { width, height });
        }
        let base = fit(base_face, width, height);
        let tint = fit(tint_face, width, height);

        let (x0, y0, x1, y1) = self.config.region.bounds(width, height);
        let roi_pixels = ((x1 - x0) as u64 * (y1 - y0) as u64) as f64;

        let mut sums = [0u64; 3];
        let mut masked: Vec<[u8; 3]> = Vec::new();
        for y in y0..y1 {
            for x in x0..x1 {
                let a = base.get_pixel(x, y).0;
                let b = tint.get_pixel(x, y).0;
                let diff = [a[0].abs_diff(b[0]), a[1].abs_diff(b[1]), a[2].abs_diff(b[2])];
                let total: u32 = diff.iter().map(|&d| d as u32).sum();
                for c in 0..3 {
                    sums[c] += diff[c] as u64;
                }
                if total > self.config.threshold {
                    masked.push(diff);
                }
            }
        }

        let channel_values = ChannelValues {
            red: sums[0] as f64 / roi_pixels,
            green: sums[1] as f64 / roi_pixels,
            blue: sums[2] as f64 / roi_pixels,
        };
        let intensity = sums.iter().sum::<u64>() as f64 / (3.0 * roi_pixels);
        let affected_pixels = 100.0 * masked.len() as f64 / roi_pixels;

        let detected_colors = KMeans::with_max_clusters(self.config.max_clusters)
            .cluster(&masked)
            .into_iter()
            .map(|c| DetectedColor {
                rgb: c.centroid,
                percentage: c.percentage,
                name: color_name(c.centroid, &self.naming),
            })
            .collect();

        let found = face.is_some();
        let stats = FrameStats {
            color: colored.label.color.clone(),
            timestamp: colored.label.timestamp,
            intensity,
            dominant_channel: channel_values.dominant(),
            channel_values,
            affected_pixels,
            detected_colors,
            image_resolution: ImageResolution {
                base_frame: dims(reference.image.width(), reference.image.height()),
                reflection_frame: dims(colored.image.width(), colored.image.height()),
                face_region: dims(width, height),
                roi: dims(x1 - x0, y1 - y0),
            },
            face_detected: FaceDetected {
                base_frame: found,
                reflection_frame: found,
            },
        };

        tracing::debug!(
            frame = %colored.label,
            intensity = stats.intensity,
            dominant = %stats.dominant_channel,
            affected = stats.affected_pixels,
            clusters = stats.detected_colors.len(),
            "frame analyzed"
        );
        Ok(stats)
    }

    /// Crop `image` to `face` plus margin. The box was found on an image of
    /// `located_on` size and is rescaled when `image` differs. Without a box
    /// the whole frame is kept.
    fn face_region(
        &self,
        face: Option<FaceBox>,
        image: &RgbImage,
        located_on: (u32, u32),
    ) -> RgbImage {
        let Some(face) = face else {
            return image.clone();
        };
        if image.width() == 0 || image.height() == 0 {
            return image.clone();
        }

        let face = face.rescaled(located_on, image.dimensions());
        let region = face.expanded(self.config.face_margin, image.width(), image.height());
        imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image()
    }
}

/// Bilinear resize to exactly `width` x `height`, skipped when already there.
fn fit(image: RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        image
    } else {
        imageops::resize(&image, width, height, FilterType::Triangle)
    }
}
