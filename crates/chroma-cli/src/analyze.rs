//! `chroma analyze`: offline reflection analysis of still frames.

use anyhow::{Context, Result};
use chroma_core::{
    aggregate, AnalyzerConfig, ExtractedFrame, FaceDetector, FrameLabel, Heuristics,
    ReflectionAnalyzer, RegionFocus, ScrfdDetector, VerdictDocument,
};
use std::path::{Path, PathBuf};

pub fn run(
    reference: &Path,
    frames: &[PathBuf],
    model: &Path,
    heuristics: Option<&Path>,
    threshold: u32,
    region: &str,
) -> Result<()> {
    let heuristics = load_heuristics(heuristics)?;
    let region: RegionFocus = region.parse().map_err(anyhow::Error::msg)?;
    let config = AnalyzerConfig {
        threshold,
        region,
        ..AnalyzerConfig::default()
    };

    let mut detector = ScrfdDetector::load(model).with_context(|| {
        format!(
            "failed to load detector model {} (run `chroma setup`)",
            model.display()
        )
    })?;
    let document = analyze_files(&mut detector, reference, frames, &heuristics, config)?;
    let json = document.to_json_pretty()?;
    println!("{}", String::from_utf8_lossy(&json));
    Ok(())
}

fn load_heuristics(path: Option<&Path>) -> Result<Heuristics> {
    let Some(path) = path else {
        return Ok(Heuristics::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Load a still. Its file stem must be a `{timestamp}_{color}` label, except
/// for the reference, which falls back to a synthetic label.
fn load_frame(path: &Path, is_reference: bool) -> Result<ExtractedFrame> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let label = match FrameLabel::parse(stem) {
        Some(label) => label,
        None if is_reference => FrameLabel {
            timestamp: 0,
            color: "reference".to_string(),
        },
        None => anyhow::bail!(
            "{} is not named {{timestamp}}_{{color}}.png",
            path.display()
        ),
    };
    let image = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgb8();
    Ok(ExtractedFrame {
        label,
        frame_index: None,
        image,
    })
}

fn analyze_files(
    detector: &mut dyn FaceDetector,
    reference: &Path,
    frames: &[PathBuf],
    heuristics: &Heuristics,
    config: AnalyzerConfig,
) -> Result<VerdictDocument> {
    let reference = load_frame(reference, true)?;
    let colored = frames
        .iter()
        .map(|p| load_frame(p, false))
        .collect::<Result<Vec<_>>>()?;

    let analyzer = ReflectionAnalyzer::new(config, heuristics.color_naming.clone());
    let analysis = analyzer.analyze_session(detector, &reference, &colored);
    for failure in &analysis.failures {
        tracing::warn!(frame = %failure.label, error = %failure.error, "frame skipped");
    }

    Ok(match aggregate(analysis.stats, &heuristics.expected_channels) {
        Ok(verdict) => VerdictDocument::success(verdict),
        Err(e) => VerdictDocument::error(e.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chroma_core::{DetectorError, FaceBox, ReportStatus};
    use image::{Rgb, RgbImage};

    struct NoFace;

    impl FaceDetector for NoFace {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
            Ok(Vec::new())
        }
    }

    fn write_png(dir: &Path, name: &str, pixel: [u8; 3]) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(32, 24, Rgb(pixel)).save(&path).unwrap();
        path
    }

    #[test]
    fn test_matching_stills_are_genuine() {
        let tmp = tempfile::tempdir().unwrap();
        let reference = write_png(tmp.path(), "1000_transparent.png", [90, 90, 90]);
        let frames = vec![
            write_png(tmp.path(), "1200_red.png", [150, 90, 90]),
            write_png(tmp.path(), "1400_green.png", [90, 150, 90]),
            write_png(tmp.path(), "1600_blue.png", [90, 90, 150]),
        ];

        let doc = analyze_files(
            &mut NoFace,
            &reference,
            &frames,
            &Heuristics::default(),
            AnalyzerConfig::default(),
        )
        .unwrap();
        assert_eq!(doc.status, ReportStatus::Success);
        assert_eq!(doc.is_injected, Some(false));
        let analysis = doc.analysis.unwrap();
        assert_eq!(analysis.total_frames_analyzed, 3);
        assert_eq!(analysis.frames_matching_expected, 3);
        assert_eq!(analysis.frame_details[0].timestamp, 1200);
    }

    #[test]
    fn test_single_frame_is_an_error_document() {
        let tmp = tempfile::tempdir().unwrap();
        let reference = write_png(tmp.path(), "ref.png", [90, 90, 90]);
        let frames = vec![write_png(tmp.path(), "1200_red.png", [150, 90, 90])];

        let doc = analyze_files(
            &mut NoFace,
            &reference,
            &frames,
            &Heuristics::default(),
            AnalyzerConfig::default(),
        )
        .unwrap();
        assert_eq!(doc.status, ReportStatus::Error);
        assert_eq!(doc.is_injected, None);
    }

    #[test]
    fn test_unlabeled_colored_frame_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let reference = write_png(tmp.path(), "ref.png", [90, 90, 90]);
        let frames = vec![write_png(tmp.path(), "red.png", [150, 90, 90])];

        let err = analyze_files(
            &mut NoFace,
            &reference,
            &frames,
            &Heuristics::default(),
            AnalyzerConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("red.png"));
    }

    #[test]
    fn test_missing_model_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let reference = write_png(tmp.path(), "ref.png", [90, 90, 90]);
        let frames = vec![write_png(tmp.path(), "1200_red.png", [150, 90, 90])];

        let err = run(
            &reference,
            &frames,
            &tmp.path().join("det_10g.onnx"),
            None,
            20,
            "full",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("chroma setup"));
    }
}
