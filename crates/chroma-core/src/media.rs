//! Seams to the external codec service.
//!
//! The pipeline never encodes or decodes video itself. It asks a
//! [`MediaCodec`] to normalize and join fragments and a [`VideoDecoder`] to
//! walk the frames of the joined artifact.

use image::RgbImage;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("could not probe {path}: {reason}")]
    Probe { path: PathBuf, reason: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("media I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stream properties of a decodable video.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Transcode and concatenation contract.
pub trait MediaCodec: Send + Sync {
    /// Re-encode `input` into the target (MP4) container at `output`.
    fn transcode(&self, input: &Path, output: &Path) -> Result<(), MediaError>;

    /// Join `inputs`, in the given order, into `output` without re-encoding.
    fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MediaError>;
}

/// Sequential frame access contract.
pub trait VideoDecoder: Send + Sync {
    fn probe(&self, path: &Path) -> Result<VideoInfo, MediaError>;

    /// Decode frames from the start of `path`, calling `visit` with each
    /// zero-based frame index. Stops early when `visit` breaks.
    ///
    /// Returns the number of frames handed to `visit`.
    fn decode(
        &self,
        path: &Path,
        visit: &mut dyn FnMut(u64, &RgbImage) -> ControlFlow<()>,
    ) -> Result<u64, MediaError>;
}
