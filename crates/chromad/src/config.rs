use anyhow::Context;
use chroma_core::analyzer::RegionFocus;
use chroma_core::{Heuristics, DETECTOR_MODEL};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// When a captured session is analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisTrigger {
    /// Right after `capture-end` has reassembled and extracted the session.
    CaptureEnd,
    /// Only when a client calls `POST /sessions/{id}/analyze`.
    OnDemand,
}

impl AnalysisTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisTrigger::CaptureEnd => "capture-end",
            AnalysisTrigger::OnDemand => "on-demand",
        }
    }
}

impl FromStr for AnalysisTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "capture-end" => Ok(AnalysisTrigger::CaptureEnd),
            "on-demand" => Ok(AnalysisTrigger::OnDemand),
            other => Err(format!("unknown analysis trigger '{other}'")),
        }
    }
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address (default: 127.0.0.1:8600).
    pub bind: SocketAddr,
    /// Root of per-session working directories.
    pub work_dir: PathBuf,
    /// Path to the SQLite mirror database.
    pub db_path: PathBuf,
    /// Shared secret expected in `X-API-Key`. Unset disables the check.
    pub api_key: Option<String>,
    /// Number of engine worker threads.
    pub workers: usize,
    /// Idle time after which an unfinished session is reclaimed.
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub analysis_trigger: AnalysisTrigger,
    /// Summed channel difference above which a pixel counts as reflected.
    pub diff_threshold: u32,
    pub region: RegionFocus,
    pub face_margin: u32,
    /// Largest accepted request body (one video fragment).
    pub max_fragment_bytes: usize,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Optional TOML file overriding the heuristic tables.
    pub heuristics_path: Option<PathBuf>,
    /// SCRFD ONNX model loaded by every engine worker.
    pub detector_model: PathBuf,
}

impl Config {
    /// Load configuration from `CHROMA_*` environment variables with defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("chroma");

        let db_path = std::env::var("CHROMA_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("mirror.db"));
        let work_dir = std::env::var("CHROMA_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("chroma-sessions"));

        let bind = std::env::var("CHROMA_BIND").unwrap_or_else(|_| "127.0.0.1:8600".to_string());
        let bind: SocketAddr = bind
            .parse()
            .with_context(|| format!("invalid CHROMA_BIND '{bind}'"))?;

        let analysis_trigger: AnalysisTrigger = match std::env::var("CHROMA_ANALYSIS_TRIGGER") {
            Ok(v) => v.parse().map_err(anyhow::Error::msg)?,
            Err(_) => AnalysisTrigger::CaptureEnd,
        };
        let region: RegionFocus = match std::env::var("CHROMA_REGION") {
            Ok(v) => v.parse().map_err(anyhow::Error::msg)?,
            Err(_) => RegionFocus::Full,
        };

        Ok(Self {
            bind,
            work_dir,
            db_path,
            api_key: std::env::var("CHROMA_API_KEY").ok().filter(|k| !k.is_empty()),
            workers: env_usize("CHROMA_WORKERS", 2).max(1),
            session_ttl_secs: env_u64("CHROMA_SESSION_TTL_SECS", 600),
            sweep_interval_secs: env_u64("CHROMA_SWEEP_INTERVAL_SECS", 60).max(1),
            analysis_trigger,
            diff_threshold: env_u32("CHROMA_DIFF_THRESHOLD", 20),
            region,
            face_margin: env_u32("CHROMA_FACE_MARGIN", 20),
            max_fragment_bytes: env_usize("CHROMA_MAX_FRAGMENT_BYTES", 64 * 1024 * 1024),
            ffmpeg: env_path("CHROMA_FFMPEG", "ffmpeg"),
            ffprobe: env_path("CHROMA_FFPROBE", "ffprobe"),
            heuristics_path: std::env::var("CHROMA_HEURISTICS").ok().map(PathBuf::from),
            detector_model: std::env::var("CHROMA_DETECTOR_MODEL")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("models").join(DETECTOR_MODEL.name)),
        })
    }

    /// Heuristic tables: defaults, overridden by `CHROMA_HEURISTICS` if set.
    pub fn load_heuristics(&self) -> anyhow::Result<Heuristics> {
        let Some(path) = &self.heuristics_path else {
            return Ok(Heuristics::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading heuristics from {}", path.display()))?;
        let heuristics = toml::from_str(&text)
            .with_context(|| format!("parsing heuristics from {}", path.display()))?;
        tracing::info!(path = %path.display(), "heuristics loaded");
        Ok(heuristics)
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

#[cfg(test)]
impl Config {
    /// Defaults rooted at `work_dir`, without touching the environment.
    pub fn for_tests(work_dir: &std::path::Path) -> Self {
        Self {
            bind: ([127, 0, 0, 1], 0).into(),
            work_dir: work_dir.to_path_buf(),
            db_path: PathBuf::from(":memory:"),
            api_key: None,
            workers: 1,
            session_ttl_secs: 600,
            sweep_interval_secs: 60,
            analysis_trigger: AnalysisTrigger::CaptureEnd,
            diff_threshold: 20,
            region: RegionFocus::Full,
            face_margin: 20,
            max_fragment_bytes: 1024 * 1024,
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            heuristics_path: None,
            detector_model: work_dir.join("det_10g.onnx"),
        }
    }
}
