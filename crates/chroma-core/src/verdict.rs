//! Combine per-frame statistics into one genuine/injected classification.
//!
//! Two independent signals vote for "genuine":
//!
//! - **Channel match:** at least half of the frames reflect most strongly in
//!   the channel their displayed color is expected to excite.
//! - **Consistency:** reflection intensity stays within a narrow band across
//!   frames (a live face under a screen reacts with similar strength to
//!   every color).
//!
//! A session is classified as injected only when both signals fail.

use crate::analyzer::FrameStats;
use crate::heuristics::ExpectedChannels;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fewest analyzed frames a verdict can be based on.
pub const MIN_FRAMES: usize = 2;

/// Consistency above this counts as genuine on its own.
const CONSISTENCY_CUTOFF: f64 = 50.0;

/// Share of matching frames at or above which the session counts as genuine.
const MATCH_RATIO: f64 = 0.5;

#[derive(Error, Debug)]
pub enum VerdictError {
    #[error("insufficient data: {analyzed} frames analyzed, need at least 2")]
    InsufficientData { analyzed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub consistency: f64,
    pub match_percentage: f64,
    pub total_frames_analyzed: usize,
    pub frames_matching_expected: usize,
    pub intensity_range: IntensityRange,
    pub frame_details: Vec<FrameStats>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub is_injected: bool,
    pub analysis: AnalysisSummary,
}

/// `100 * (1 - (max - min) / max)`, or 0 when every intensity is zero.
pub fn consistency(intensities: &[f64]) -> f64 {
    let max = intensities.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = intensities.iter().copied().fold(f64::INFINITY, f64::min);
    if intensities.is_empty() || max <= 0.0 {
        return 0.0;
    }
    100.0 * (1.0 - (max - min) / max)
}

pub fn is_injected(matches: usize, total: usize, consistency: f64) -> bool {
    let enough_matches = matches as f64 >= MATCH_RATIO * total as f64;
    !(enough_matches || consistency > CONSISTENCY_CUTOFF)
}

/// Classify a session from its analyzed frames.
pub fn aggregate(
    stats: Vec<FrameStats>,
    expected: &ExpectedChannels,
) -> Result<Verdict, VerdictError> {
    let total = stats.len();
    if total < MIN_FRAMES {
        return Err(VerdictError::InsufficientData { analyzed: total });
    }

    let intensities: Vec<f64> = stats.iter().map(|s| s.intensity).collect();
    let consistency = consistency(&intensities);

    let matches = stats
        .iter()
        .filter(|s| expected.expected(&s.color) == Some(s.dominant_channel))
        .count();
    let match_percentage = 100.0 * matches as f64 / total as f64;
    let is_injected = is_injected(matches, total, consistency);

    let intensity_range = IntensityRange {
        min: intensities.iter().copied().fold(f64::INFINITY, f64::min),
        max: intensities.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    };

    tracing::info!(
        frames = total,
        matches,
        consistency,
        match_percentage,
        is_injected,
        "verdict reached"
    );

    Ok(Verdict {
        is_injected,
        analysis: AnalysisSummary {
            consistency,
            match_percentage,
            total_frames_analyzed: total,
            frames_matching_expected: matches,
            intensity_range,
            frame_details: stats,
        },
    })
}
