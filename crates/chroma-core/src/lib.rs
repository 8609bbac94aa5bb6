//! chroma-core: reflection-based liveness analysis.
//!
//! A client shows a sequence of full-screen colors while recording its own
//! camera. Light from the display reflects off a live face; a replayed or
//! injected video does not react to the colors that were actually shown.
//!
//! The pipeline in this crate runs leaves first:
//!
//! 1. [`event_log`] and [`fragment`] accumulate a session's color events and
//!    raw video fragments.
//! 2. [`reassembler`] orders and merges fragments into one artifact.
//! 3. [`extractor`] picks the frame under each color event.
//! 4. [`analyzer`] differences every colored frame against the reference.
//! 5. [`verdict`] turns per-frame statistics into a classification, and
//!    [`report`] renders it as the mirrored JSON document.
//!
//! Video I/O and face detection sit behind the [`media`] and [`detector`]
//! traits so the daemon can plug in real backends and tests can plug in fakes.

pub mod analyzer;
pub mod clustering;
pub mod color_name;
pub mod detector;
pub mod event_log;
pub mod extractor;
pub mod fragment;
pub mod heuristics;
pub mod media;
pub mod reassembler;
pub mod report;
pub mod verdict;

pub use analyzer::{AnalyzerConfig, FrameStats, ReflectionAnalyzer, RegionFocus, SessionAnalysis};
pub use detector::{DetectorError, FaceBox, FaceDetector, ModelFile, ScrfdDetector, DETECTOR_MODEL};
pub use event_log::{ColorEvent, EventLog, FrameLabel};
pub use extractor::{extract_frames, partition_frames, ExtractedFrame, Extraction, FramePartition};
pub use fragment::{Container, Fragment, FragmentMeta, FragmentStore};
pub use heuristics::{Channel, Heuristics};
pub use media::{MediaCodec, MediaError, VideoDecoder, VideoInfo};
pub use reassembler::{reassemble, Artifact, OrderingKey};
pub use report::{ReportStatus, VerdictDocument};
pub use verdict::{aggregate, Verdict};
