//! `chroma setup`: fetch the face detector model used by chromad and
//! `chroma analyze`.

use anyhow::{Context, Result};
use chroma_core::{ModelFile, DETECTOR_MODEL};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::remote::save_verified;

/// `$XDG_DATA_HOME/chroma/models`, the directory chromad loads from by default.
pub fn default_model_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.local/share")
    });
    PathBuf::from(data_home).join("chroma/models")
}

pub fn default_model_path() -> PathBuf {
    default_model_dir().join(DETECTOR_MODEL.name)
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether `path` already holds a file with the `expected` SHA-256.
fn is_present(path: &Path, expected: &str) -> bool {
    path.is_file() && sha256_file(path).is_ok_and(|digest| digest == expected)
}

pub fn run(model_dir: Option<PathBuf>) -> Result<()> {
    let dir = model_dir.unwrap_or_else(default_model_dir);
    let model: &ModelFile = &DETECTOR_MODEL;
    let dest = dir.join(model.name);
    println!("Model directory: {}", dir.display());

    if is_present(&dest, model.sha256) {
        println!("  {} already present (checksum ok)", model.name);
        return Ok(());
    }
    if dest.exists() {
        tracing::warn!(path = %dest.display(), "model checksum differs, downloading again");
    }

    println!("  downloading {} ({})...", model.name, model.size_display);
    let resp = ureq::get(model.url)
        .call()
        .with_context(|| format!("failed to download {}", model.url))?;
    save_verified(resp.into_body().into_reader(), &dest, model.sha256)?;
    println!("  {} verified and installed", model.name);
    Ok(())
}
