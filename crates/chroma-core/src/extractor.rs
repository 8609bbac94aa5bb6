//! Pick the frame shown under each color event.

use crate::event_log::{ColorEvent, FrameLabel};
use crate::heuristics::{ReferenceRule, ReferenceSelection};
use crate::media::{MediaError, VideoDecoder};
use image::RgbImage;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("insufficient frames: {reference} reference, {colored} colored")]
    InsufficientFrames { reference: usize, colored: usize },
}

/// A still tied to one color event.
#[derive(Debug, Clone)]
pub struct ExtractedFrame {
    pub label: FrameLabel,
    /// Index in the decoded video; `None` for stills loaded from disk.
    pub frame_index: Option<u64>,
    pub image: RgbImage,
}

impl ExtractedFrame {
    pub fn color(&self) -> &str {
        &self.label.color
    }
}

/// Frame index for an event: `floor(relative_ms / 1000 * fps)`.
///
/// Events before the recording started, and non-positive or non-finite frame
/// rates, have no frame.
pub fn target_frame(event: &ColorEvent, fps: f64) -> Option<u64> {
    let relative_ms = event.relative_ms();
    if relative_ms < 0 || !fps.is_finite() || fps <= 0.0 {
        return None;
    }
    Some(((relative_ms as f64 / 1000.0) * fps).floor() as u64)
}

#[derive(Debug)]
pub struct Extraction {
    /// Extracted frames in event-timestamp order.
    pub frames: Vec<ExtractedFrame>,
    /// Events that resolved to no decodable frame.
    pub misses: Vec<ColorEvent>,
    pub fps: f64,
    pub frames_decoded: u64,
}

/// Extract one still per event from `video` in a single decode pass.
///
/// Output depends only on the frame rate, the events and the video content;
/// the order events arrive in does not matter.
pub fn extract_frames(
    video: &Path,
    events: &[ColorEvent],
    decoder: &dyn VideoDecoder,
) -> Result<Extraction, ExtractError> {
    let info = decoder.probe(video)?;
    let fps = info.fps;
    if !fps.is_finite() || fps <= 0.0 {
        tracing::warn!(fps, path = %video.display(), "video reports an unusable frame rate");
    }

    let mut events: Vec<&ColorEvent> = events.iter().collect();
    events.sort_by_key(|e| e.timestamp);

    let mut targets: BTreeMap<u64, Vec<&ColorEvent>> = BTreeMap::new();
    let mut misses = Vec::new();
    for &event in &events {
        match target_frame(event, fps) {
            Some(index) => targets.entry(index).or_default().push(event),
            None => {
                tracing::warn!(
                    color = %event.new_color,
                    timestamp = event.timestamp,
                    video_start_time = event.video_start_time,
                    fps,
                    "color event has no frame target"
                );
                misses.push(event.clone());
            }
        }
    }

    let mut frames = Vec::with_capacity(events.len());
    let mut frames_decoded = 0;
    if let Some(&last_target) = targets.keys().next_back() {
        frames_decoded = decoder.decode(video, &mut |index: u64, image: &RgbImage| {
            if let Some(hits) = targets.get(&index) {
                for event in hits {
                    frames.push(ExtractedFrame {
                        label: event.label(),
                        frame_index: Some(index),
                        image: image.clone(),
                    });
                }
            }
            if index >= last_target {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
    }

    for (index, hits) in targets.range(frames_decoded..) {
        for event in hits {
            tracing::warn!(
                color = %event.new_color,
                timestamp = event.timestamp,
                target = index,
                frames_decoded,
                "color event beyond end of video"
            );
            misses.push((*event).clone());
        }
    }

    frames.sort_by_key(|f| f.label.timestamp);
    tracing::info!(
        fps,
        extracted = frames.len(),
        missed = misses.len(),
        frames_decoded,
        "frames extracted"
    );

    Ok(Extraction {
        frames,
        misses,
        fps,
        frames_decoded,
    })
}

/// Frames split into the reference and the frames analyzed against it.
#[derive(Debug)]
pub struct FramePartition {
    pub reference: ExtractedFrame,
    pub colored: Vec<ExtractedFrame>,
}

/// Split frames by the reference marker according to the selection policy.
pub fn partition_frames(
    frames: Vec<ExtractedFrame>,
    rule: &ReferenceRule,
) -> Result<FramePartition, ExtractError> {
    let (mut references, mut colored): (Vec<_>, Vec<_>) = frames
        .into_iter()
        .partition(|f| rule.is_reference(f.color()));
    references.sort_by_key(|f| f.label.timestamp);

    let insufficient = |reference: usize, colored: usize| ExtractError::InsufficientFrames {
        reference,
        colored,
    };

    match rule.selection {
        ReferenceSelection::Strict => {
            if references.len() != 1 || colored.is_empty() {
                return Err(insufficient(references.len(), colored.len()));
            }
        }
        ReferenceSelection::Earliest => {
            if references.is_empty() || references.len() + colored.len() < 2 {
                return Err(insufficient(references.len(), colored.len()));
            }
            colored.extend(references.drain(1..));
            colored.sort_by_key(|f| f.label.timestamp);
        }
    }

    let reference = references.remove(0);
    Ok(FramePartition { reference, colored })
}
