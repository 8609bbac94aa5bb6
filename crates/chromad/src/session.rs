//! Live capture sessions and their registry.

use chroma_core::{EventLog, ExtractedFrame, FragmentStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

const MAX_ID_LEN: usize = 64;

/// Opaque session token. Doubles as a directory and blob-key component, so
/// only `[A-Za-z0-9_-]` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting color events and fragments.
    Capturing,
    /// Reassembled and extracted; waiting for analysis.
    Captured,
    /// Destroyed. Holders of a stale handle see this after taking the lock.
    Closed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Capturing => "capturing",
            Phase::Captured => "captured",
            Phase::Closed => "closed",
        }
    }
}

/// Mutable per-session state, only ever touched under the session lock.
#[derive(Debug)]
pub struct SessionState {
    pub phase: Phase,
    pub events: EventLog,
    pub fragments: FragmentStore,
    /// Frames extracted at capture end, consumed by analysis.
    pub frames: Vec<ExtractedFrame>,
    pub work_dir: PathBuf,
    pub last_activity: Instant,
}

impl SessionState {
    fn new(work_dir: PathBuf) -> Self {
        Self {
            phase: Phase::Capturing,
            events: EventLog::new(),
            fragments: FragmentStore::new(work_dir.join("fragments")),
            frames: Vec::new(),
            work_dir,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Delete fragments, the artifact and everything else on disk. Safe to
    /// repeat.
    pub fn release_work_dir(&mut self) -> io::Result<()> {
        self.fragments.cleanup()?;
        match std::fs::remove_dir_all(&self.work_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    fn new(id: SessionId, work_root: &Path) -> Self {
        let work_dir = work_root.join(id.as_str());
        Self {
            id,
            created_at: Utc::now(),
            state: Arc::new(Mutex::new(SessionState::new(work_dir))),
        }
    }

    /// Take the session lock. The guard is owned so it can travel to an
    /// engine worker and back.
    pub async fn lock(&self) -> OwnedMutexGuard<SessionState> {
        self.state.clone().lock_owned().await
    }

    pub fn try_lock(&self) -> Option<OwnedMutexGuard<SessionState>> {
        self.state.clone().try_lock_owned().ok()
    }
}

/// All live sessions, keyed by id.
pub struct SessionRegistry {
    work_root: PathBuf,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// The session for `id`, created in phase `Capturing` if absent.
    pub async fn get_or_create(&self, id: &SessionId) -> Arc<Session> {
        if let Some(session) = self.sessions.read().await.get(id) {
            return session.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::info!(session = %id, "session created");
                Arc::new(Session::new(id.clone(), &self.work_root))
            })
            .clone()
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Drop `session` from the registry, unless the id has since been taken
    /// by a newer session.
    pub async fn remove(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Destroy sessions idle for longer than `ttl`. Sessions whose lock is
    /// currently held are busy by definition and are left for the next sweep.
    pub async fn sweep_expired(&self, ttl: Duration) -> usize {
        let candidates: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();

        let mut reclaimed = 0;
        for session in candidates {
            let Some(mut state) = session.try_lock() else {
                continue;
            };
            if state.phase == Phase::Closed || state.last_activity.elapsed() <= ttl {
                continue;
            }
            let phase = state.phase;
            state.phase = Phase::Closed;
            if let Err(e) = state.release_work_dir() {
                tracing::warn!(session = %session.id, error = %e, "failed to release work dir");
            }
            drop(state);

            if self.remove(&session).await {
                reclaimed += 1;
                tracing::info!(
                    session = %session.id,
                    phase = phase.as_str(),
                    "idle session reclaimed"
                );
            }
        }
        reclaimed
    }
}

/// Run [`SessionRegistry::sweep_expired`] every `interval`.
pub fn spawn_sweeper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    ttl: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reclaimed = registry.sweep_expired(ttl).await;
            if reclaimed > 0 {
                tracing::info!(reclaimed, "session sweep finished");
            }
        }
    })
}
