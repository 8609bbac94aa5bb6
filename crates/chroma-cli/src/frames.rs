//! `chroma frames`: extract labeled stills from a recorded session video.

use anyhow::{Context, Result};
use chroma_core::{extract_frames, EventLog, ExtractedFrame};
use chroma_media::Ffmpeg;
use std::fs;
use std::path::{Path, PathBuf};

pub fn run(video: &Path, color_data: &Path, out: &Path) -> Result<()> {
    let bytes = fs::read(color_data)
        .with_context(|| format!("failed to read {}", color_data.display()))?;
    let log = EventLog::from_json(&bytes)
        .with_context(|| format!("failed to parse {}", color_data.display()))?;

    let ffmpeg = Ffmpeg::new(
        std::env::var("CHROMA_FFMPEG").unwrap_or_else(|_| "ffmpeg".to_string()),
        std::env::var("CHROMA_FFPROBE").unwrap_or_else(|_| "ffprobe".to_string()),
    );
    let extraction = extract_frames(video, &log.snapshot(), &ffmpeg)
        .with_context(|| format!("failed to extract frames from {}", video.display()))?;

    let written = write_frames(&extraction.frames, out)?;
    println!(
        "{} frame(s) written to {} ({} fps, {} decoded)",
        written.len(),
        out.display(),
        extraction.fps,
        extraction.frames_decoded
    );
    for event in &extraction.misses {
        println!(
            "  no frame for {} at {} ms",
            event.new_color,
            event.relative_ms()
        );
    }
    Ok(())
}

/// Save each frame as `{out}/{timestamp}_{color}.png`.
fn write_frames(frames: &[ExtractedFrame], out: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out)
        .with_context(|| format!("failed to create directory {}", out.display()))?;

    let mut written = Vec::with_capacity(frames.len());
    for frame in frames {
        let path = out.join(format!("{}.png", frame.label));
        frame
            .image
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
