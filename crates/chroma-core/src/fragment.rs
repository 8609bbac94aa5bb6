//! Per-session store of raw video fragments.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;

/// Declared container of a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Container {
    Mp4,
    WebM,
    Other(String),
}

impl Container {
    /// Derive the container from a MIME type such as `video/webm;codecs=vp8`.
    /// Browsers' MediaRecorder emits WebM when nothing is declared.
    pub fn from_mime(mime: Option<&str>) -> Self {
        let Some(mime) = mime else {
            return Container::WebM;
        };
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "" | "video/webm" | "audio/webm" => Container::WebM,
            "video/mp4" | "audio/mp4" => Container::Mp4,
            other => Container::Other(other.to_string()),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::WebM => "webm",
            Container::Other(_) => "bin",
        }
    }

    /// Whether the fragment is already in the artifact's container.
    pub fn is_native(&self) -> bool {
        matches!(self, Container::Mp4)
    }

    /// Whether `bytes` continue an earlier fragment's stream instead of
    /// starting their own. A MediaRecorder timeslice after the first one
    /// carries WebM clusters without the EBML header.
    pub fn is_continuation(&self, bytes: &[u8]) -> bool {
        matches!(self, Container::WebM) && !bytes.starts_with(&EBML_MAGIC)
    }
}

/// First four bytes of every WebM/Matroska stream.
pub const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Client-declared metadata for one fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentMeta {
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub sequence: Option<u64>,
}

/// A fragment persisted in the session's fragment directory.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub meta: FragmentMeta,
    pub container: Container,
    /// Zero-based position in arrival order.
    pub arrival: usize,
    /// Headerless bytes that only decode appended to the preceding fragment.
    pub continuation: bool,
    pub path: PathBuf,
}

/// Ordered collection of a session's fragments, backed by one directory.
///
/// Fragments are written once and never modified; [`FragmentStore::cleanup`]
/// is the only operation that removes them.
#[derive(Debug)]
pub struct FragmentStore {
    dir: PathBuf,
    fragments: Vec<Fragment>,
}

impl FragmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fragments: Vec::new(),
        }
    }

    /// Persist a fragment and record it in arrival order.
    pub fn push(&mut self, meta: FragmentMeta, bytes: &[u8]) -> io::Result<&Fragment> {
        fs::create_dir_all(&self.dir)?;

        let arrival = self.fragments.len();
        let container = Container::from_mime(meta.mime_type.as_deref());
        let continuation = container.is_continuation(bytes);
        let path = self.dir.join(format!(
            "{arrival:04}_{}_{}.{}",
            meta.start_time,
            meta.end_time,
            container.extension()
        ));
        fs::write(&path, bytes)?;

        tracing::debug!(
            arrival,
            bytes = bytes.len(),
            sequence = ?meta.sequence,
            start_time = meta.start_time,
            continuation,
            "fragment stored"
        );

        self.fragments.push(Fragment {
            meta,
            container,
            arrival,
            continuation,
            path,
        });
        Ok(&self.fragments[arrival])
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Remove every stored fragment. Safe to call repeatedly and after a
    /// failed reassembly.
    pub fn cleanup(&mut self) -> io::Result<()> {
        self.fragments.clear();
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
