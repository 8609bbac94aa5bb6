//! The blocking half of a session: reassembly, extraction and analysis.
//!
//! Everything here runs on engine worker threads, never on the async runtime.

use chroma_core::extractor::ExtractError;
use chroma_core::reassembler::ReassemblyError;
use chroma_core::verdict::VerdictError;
use chroma_core::{
    aggregate, extract_frames, partition_frames, reassemble, ColorEvent, ExtractedFrame,
    FaceDetector, FrameLabel, Heuristics, MediaCodec, ReflectionAnalyzer, Verdict, VideoDecoder,
};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

use crate::session::SessionState;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Verdict(#[from] VerdictError),
    #[error("frame encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("pipeline I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What capture end produced, ready to be mirrored.
#[derive(Debug)]
pub struct CaptureOutcome {
    /// Merged session video.
    pub video: Vec<u8>,
    /// One PNG per extracted frame.
    pub images: Vec<(FrameLabel, Vec<u8>)>,
    /// Events that resolved to no frame.
    pub misses: Vec<ColorEvent>,
}

pub struct Pipeline {
    codec: Arc<dyn MediaCodec>,
    decoder: Arc<dyn VideoDecoder>,
    analyzer: ReflectionAnalyzer,
    heuristics: Heuristics,
}

impl Pipeline {
    pub fn new(
        codec: Arc<dyn MediaCodec>,
        decoder: Arc<dyn VideoDecoder>,
        analyzer: ReflectionAnalyzer,
        heuristics: Heuristics,
    ) -> Self {
        Self {
            codec,
            decoder,
            analyzer,
            heuristics,
        }
    }

    /// Merge the session's fragments and extract one frame per color event.
    /// The extracted frames stay in `state` for analysis.
    pub fn finalize(&self, state: &mut SessionState) -> Result<CaptureOutcome, PipelineError> {
        let artifact = reassemble(
            state.fragments.fragments(),
            &state.work_dir,
            self.codec.as_ref(),
        )?;
        let video = std::fs::read(&artifact.path)?;

        let events = state.events.snapshot();
        let extraction = extract_frames(&artifact.path, &events, self.decoder.as_ref())?;

        let mut images = Vec::with_capacity(extraction.frames.len());
        for frame in &extraction.frames {
            images.push((frame.label.clone(), encode_png(frame)?));
        }

        tracing::info!(
            fragments = artifact.fragments_used,
            dropped = artifact.fragments_dropped,
            ordering = ?artifact.ordering,
            frames = extraction.frames.len(),
            misses = extraction.misses.len(),
            "capture finalized"
        );

        state.frames = extraction.frames;
        Ok(CaptureOutcome {
            video,
            images,
            misses: extraction.misses,
        })
    }

    /// Classify a session from its extracted frames.
    pub fn analyze(
        &self,
        detector: &mut dyn FaceDetector,
        frames: Vec<ExtractedFrame>,
    ) -> Result<Verdict, PipelineError> {
        let partition = partition_frames(frames, &self.heuristics.reference)?;
        let analysis =
            self.analyzer
                .analyze_session(detector, &partition.reference, &partition.colored);
        if !analysis.failures.is_empty() {
            tracing::warn!(
                failed = analysis.failures.len(),
                analyzed = analysis.stats.len(),
                "some frames were excluded from analysis"
            );
        }
        let verdict = aggregate(analysis.stats, &self.heuristics.expected_channels)?;
        Ok(verdict)
    }
}

fn encode_png(frame: &ExtractedFrame) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Cursor::new(Vec::new());
    frame.image.write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fakes for the media and detector seams, shared by the daemon's tests.

    use chroma_core::detector::DetectorError;
    use chroma_core::{FaceBox, FaceDetector, MediaCodec, MediaError, VideoDecoder, VideoInfo};
    use image::{Rgb, RgbImage};
    use std::ops::ControlFlow;
    use std::path::{Path, PathBuf};

    pub const FPS: f64 = 10.0;
    pub const SIZE: u32 = 16;

    /// Joins fragments by byte concatenation; "transcodes" by copying.
    pub struct ByteCodec;

    impl MediaCodec for ByteCodec {
        fn transcode(&self, input: &Path, output: &Path) -> Result<(), MediaError> {
            std::fs::copy(input, output)?;
            Ok(())
        }

        fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MediaError> {
            let mut joined = Vec::new();
            for input in inputs {
                joined.extend(std::fs::read(input)?);
            }
            std::fs::write(output, joined)?;
            Ok(())
        }
    }

    /// Reads a "video" whose bytes are one color code per frame:
    /// `T` transparent (mid gray), `R` red tint, `G` green tint, `B` blue
    /// tint. Anything else decodes as the reference gray.
    pub struct CodeDecoder;

    pub fn frame_for(code: u8) -> RgbImage {
        let pixel = match code {
            b'R' => [180, 100, 100],
            b'G' => [100, 180, 100],
            b'B' => [100, 100, 180],
            _ => [100, 100, 100],
        };
        RgbImage::from_pixel(SIZE, SIZE, Rgb(pixel))
    }

    impl VideoDecoder for CodeDecoder {
        fn probe(&self, _path: &Path) -> Result<VideoInfo, MediaError> {
            Ok(VideoInfo {
                width: SIZE,
                height: SIZE,
                fps: FPS,
            })
        }

        fn decode(
            &self,
            path: &Path,
            visit: &mut dyn FnMut(u64, &RgbImage) -> ControlFlow<()>,
        ) -> Result<u64, MediaError> {
            let bytes = std::fs::read(path)?;
            let mut visited = 0;
            for (index, &code) in bytes.iter().enumerate() {
                visited += 1;
                if visit(index as u64, &frame_for(code)).is_break() {
                    break;
                }
            }
            Ok(visited)
        }
    }

    /// Never finds a face; the analyzer falls back to the whole frame.
    pub struct NoFace;

    impl FaceDetector for NoFace {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
            Ok(Vec::new())
        }
    }
}
