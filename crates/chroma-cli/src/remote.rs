//! `chroma export` / `chroma status`: talk to a running chromad.

use anyhow::{bail, Context, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

/// Escaped when a mirror key becomes a URL path; `/` separators are kept.
const KEY_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// One entry of `GET /sessions/{id}/blobs`.
#[derive(Debug, Deserialize)]
struct BlobEntry {
    key: String,
    size: u64,
    sha256: String,
}

pub struct Client {
    base: String,
    api_key: Option<String>,
}

impl Client {
    pub fn new(url: &str, api_key: Option<String>) -> Self {
        Self {
            base: url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn get(&self, path: &str) -> Result<ureq::http::Response<ureq::Body>> {
        let url = format!("{}{path}", self.base);
        let mut req = ureq::get(&url);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
        }
        req.call().with_context(|| format!("GET {url} failed"))
    }

    /// Print the daemon's status document.
    pub fn status(&self) -> Result<()> {
        let mut resp = self.get("/status")?;
        let body = resp.body_mut().read_to_string()?;
        let status: serde_json::Value =
            serde_json::from_str(&body).context("daemon returned invalid status JSON")?;
        println!("{}", serde_json::to_string_pretty(&status)?);
        Ok(())
    }

    /// Download every mirrored blob of `session` to `{out}/{key}`, verifying
    /// each against its recorded SHA-256.
    pub fn export(&self, session: &str, out: &Path) -> Result<()> {
        let mut resp = self.get(&format!("/sessions/{session}/blobs"))?;
        let listing = resp.body_mut().read_to_string()?;
        let blobs: Vec<BlobEntry> =
            serde_json::from_str(&listing).context("daemon returned invalid blob listing")?;
        if blobs.is_empty() {
            bail!("no mirrored blobs for session {session}");
        }

        println!("Exporting {} blob(s) to {}", blobs.len(), out.display());
        for blob in &blobs {
            let dest = blob_path(out, &blob.key)?;
            self.download(blob, &dest)?;
            println!("  {} ({} bytes)", blob.key, blob.size);
        }
        Ok(())
    }

    fn download(&self, blob: &BlobEntry, dest: &Path) -> Result<()> {
        let resp = self.get(&format!("/blobs/{}", encode_key(&blob.key)))?;
        save_verified(resp.into_body().into_reader(), dest, &blob.sha256)
            .with_context(|| format!("failed to export {}", blob.key))
    }
}

/// Stream a download to `dest`, hashing as it goes. The bytes land in
/// `{dest}.part` and are renamed into place only when their SHA-256 matches.
pub fn save_verified(
    mut reader: impl Read,
    dest: &Path,
    expected_sha256: &str,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let mut tmp_name = dest.as_os_str().to_owned();
    tmp_name.push(".part");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])?;
    }
    file.flush()?;
    drop(file);

    let digest = format!("{:x}", hasher.finalize());
    if digest != expected_sha256 {
        fs::remove_file(&tmp_path).ok();
        bail!(
            "checksum mismatch for {}:\n  expected: {}\n  got:      {}",
            dest.display(),
            expected_sha256,
            digest
        );
    }

    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to rename {} -> {}",
            tmp_path.display(),
            dest.display()
        )
    })?;
    Ok(())
}

/// Local path for a mirror key. Keys that would escape `out` are refused.
fn blob_path(out: &Path, key: &str) -> Result<PathBuf> {
    let relative = Path::new(key);
    let safe = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if key.is_empty() || !safe {
        bail!("refusing unsafe blob key '{key}'");
    }
    Ok(out.join(relative))
}

/// Percent-encode the characters of a key that would break a URL path.
fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_PATH).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_path_stays_inside_out() {
        let out = Path::new("/tmp/export");
        assert_eq!(
            blob_path(out, "s1/images/1000_red.png").unwrap(),
            PathBuf::from("/tmp/export/s1/images/1000_red.png")
        );
        assert!(blob_path(out, "../etc/passwd").is_err());
        assert!(blob_path(out, "/etc/passwd").is_err());
        assert!(blob_path(out, "").is_err());
    }

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("s1/videos/s1.mp4"), "s1/videos/s1.mp4");
        assert_eq!(
            encode_key("s1/images/1000_#12ab34.png"),
            "s1/images/1000_%2312ab34.png"
        );
        assert_eq!(encode_key("a b?"), "a%20b%3F");
    }

    #[test]
    fn test_save_verified_renames_only_on_match() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("s1/videos/s1.mp4");
        let body = b"artifact bytes";
        let digest = format!("{:x}", Sha256::digest(body));

        save_verified(&body[..], &dest, &digest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), body);
        assert!(!tmp.path().join("s1/videos/s1.mp4.part").exists());

        let other = tmp.path().join("s1/videos/other.mp4");
        let err = save_verified(&body[..], &other, "00").unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(!other.exists());
        assert!(!tmp.path().join("s1/videos/other.mp4.part").exists());
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = Client::new("http://127.0.0.1:8600/", None);
        assert_eq!(client.base, "http://127.0.0.1:8600");
    }
}
