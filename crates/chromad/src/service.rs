//! Session lifecycle on top of the registry, engine and mirror.
//!
//! Transport-agnostic: the HTTP layer only decodes requests and maps
//! [`ServiceError`] to status codes.

use std::sync::Arc;
use thiserror::Error;

use chroma_core::{FragmentMeta, Heuristics, VerdictDocument};
use serde::Serialize;

use crate::config::{AnalysisTrigger, Config};
use crate::engine::{EngineError, EngineHandle};
use crate::events::SessionEvent;
use crate::session::{Phase, Session, SessionId, SessionRegistry, SessionState};
use crate::store::{self, BlobInfo, MirrorStore, StoreError};

type Guard = tokio::sync::OwnedMutexGuard<SessionState>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What handling one event led to.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum EventOutcome {
    Accepted,
    /// Capture finalized; analysis waits for an explicit request.
    Captured { frames: usize, misses: usize },
    Analyzed { verdict: VerdictDocument },
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub live_sessions: usize,
    pub mirrored_blobs: u64,
    pub analysis_trigger: &'static str,
    pub workers: usize,
}

#[derive(Clone)]
pub struct ChromaService {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    engine: EngineHandle,
    store: MirrorStore,
    heuristics: Arc<Heuristics>,
}

impl ChromaService {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        engine: EngineHandle,
        store: MirrorStore,
        heuristics: Arc<Heuristics>,
    ) -> Self {
        Self {
            config,
            registry,
            engine,
            store,
            heuristics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn api_key(&self) -> Option<&str> {
        self.config.api_key.as_deref()
    }

    pub fn heuristics(&self) -> &Heuristics {
        &self.heuristics
    }

    /// Mint a fresh session id and register the session.
    pub async fn create_session(&self) -> SessionId {
        let id = SessionId::generate();
        self.registry.get_or_create(&id).await;
        id
    }

    /// Apply one event to the session, creating it on first contact.
    pub async fn handle_event(
        &self,
        id: &SessionId,
        event: SessionEvent,
    ) -> Result<EventOutcome, ServiceError> {
        let session = self.registry.get_or_create(id).await;
        let mut state = session.lock().await;
        require_capturing(&session, &state)?;
        state.touch();

        match event {
            SessionEvent::CaptureStart {
                timestamp,
                mime_type,
            } => {
                tracing::info!(session = %id, ?timestamp, ?mime_type, "capture started");
                Ok(EventOutcome::Accepted)
            }
            SessionEvent::ColorChange(event) => {
                tracing::debug!(
                    session = %id,
                    color = %event.new_color,
                    timestamp = event.timestamp,
                    "color change logged"
                );
                state.events.append(event);
                Ok(EventOutcome::Accepted)
            }
            SessionEvent::VideoFragment { meta, payload } => {
                if payload.is_empty() {
                    return Err(ServiceError::BadRequest("empty video fragment".into()));
                }
                state.fragments.push(meta, &payload)?;
                Ok(EventOutcome::Accepted)
            }
            SessionEvent::CaptureEnd => self.capture_end(session, state).await,
        }
    }

    pub async fn push_fragment(
        &self,
        id: &SessionId,
        meta: FragmentMeta,
        payload: axum::body::Bytes,
    ) -> Result<EventOutcome, ServiceError> {
        self.handle_event(id, SessionEvent::VideoFragment { meta, payload })
            .await
    }

    /// Reassemble, extract and mirror; analyze right away unless analysis is
    /// on demand. A structural failure ends the session with a mirrored
    /// error document.
    async fn capture_end(
        &self,
        session: Arc<Session>,
        state: Guard,
    ) -> Result<EventOutcome, ServiceError> {
        let sid = session.id.as_str();
        tracing::info!(
            session = sid,
            events = state.events.len(),
            fragments = state.fragments.len(),
            "capture ended"
        );

        let color_data = state.events.to_json()?;
        self.store
            .put(sid, &store::color_data_key(sid), &color_data)
            .await?;

        let (mut state, result) = self.engine.finalize(state).await?;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(session = sid, error = %e, "capture finalization failed");
                let verdict = VerdictDocument::error(e.to_string());
                self.mirror_verdict(sid, &verdict).await?;
                self.destroy(&session, state).await;
                return Ok(EventOutcome::Analyzed { verdict });
            }
        };

        self.store
            .put(sid, &store::video_key(sid), &outcome.video)
            .await?;
        for (label, png) in &outcome.images {
            self.store
                .put(sid, &store::image_key(sid, &label.to_string()), png)
                .await?;
        }
        if let Err(e) = state.release_work_dir() {
            tracing::warn!(session = sid, error = %e, "failed to release work dir");
        }
        state.phase = Phase::Captured;
        state.touch();

        match self.config.analysis_trigger {
            AnalysisTrigger::CaptureEnd => {
                let verdict = self.analyze_locked(&session, state).await?;
                Ok(EventOutcome::Analyzed { verdict })
            }
            AnalysisTrigger::OnDemand => Ok(EventOutcome::Captured {
                frames: outcome.images.len(),
                misses: outcome.misses.len(),
            }),
        }
    }

    /// Analyze a captured session on request.
    pub async fn analyze(&self, id: &SessionId) -> Result<VerdictDocument, ServiceError> {
        let session = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| not_found(id))?;
        let state = session.lock().await;
        match state.phase {
            Phase::Capturing => Err(ServiceError::Conflict(format!(
                "session {id} is still capturing"
            ))),
            Phase::Closed => Err(not_found(id)),
            Phase::Captured => self.analyze_locked(&session, state).await,
        }
    }

    /// Run analysis, mirror the verdict document and destroy the session.
    async fn analyze_locked(
        &self,
        session: &Arc<Session>,
        state: Guard,
    ) -> Result<VerdictDocument, ServiceError> {
        let sid = session.id.as_str();
        let (state, result) = self.engine.analyze(state).await?;
        let verdict = match result {
            Ok(verdict) => {
                tracing::info!(
                    session = sid,
                    is_injected = verdict.is_injected,
                    frames = verdict.analysis.total_frames_analyzed,
                    "session analyzed"
                );
                VerdictDocument::success(verdict)
            }
            Err(e) => {
                tracing::error!(session = sid, error = %e, "analysis failed");
                VerdictDocument::error(e.to_string())
            }
        };
        self.mirror_verdict(sid, &verdict).await?;
        self.destroy(session, state).await;
        Ok(verdict)
    }

    async fn mirror_verdict(&self, sid: &str, verdict: &VerdictDocument) -> Result<(), ServiceError> {
        let json = verdict.to_json_pretty()?;
        self.store.put(sid, &store::verdict_key(sid), &json).await?;
        Ok(())
    }

    /// Close the session, delete its working files and unregister it.
    async fn destroy(&self, session: &Arc<Session>, mut state: Guard) {
        state.phase = Phase::Closed;
        state.frames.clear();
        if let Err(e) = state.release_work_dir() {
            tracing::warn!(session = %session.id, error = %e, "failed to release work dir");
        }
        drop(state);
        self.registry.remove(session).await;
        let age_ms = (chrono::Utc::now() - session.created_at).num_milliseconds();
        tracing::info!(session = %session.id, age_ms, "session destroyed");
    }

    /// The mirrored verdict document for a session.
    pub async fn verdict(&self, id: &SessionId) -> Result<VerdictDocument, ServiceError> {
        let bytes = self
            .store
            .get(&store::verdict_key(id.as_str()))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("no verdict for session {id}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn blob(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("no blob at {key}")))
    }

    pub async fn list_blobs(&self, id: &SessionId) -> Result<Vec<BlobInfo>, ServiceError> {
        Ok(self.store.list_session(id.as_str()).await?)
    }

    pub async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            live_sessions: self.registry.len().await,
            mirrored_blobs: self.store.count_all().await?,
            analysis_trigger: self.config.analysis_trigger.as_str(),
            workers: self.config.workers,
        })
    }
}

fn require_capturing(session: &Session, state: &SessionState) -> Result<(), ServiceError> {
    match state.phase {
        Phase::Capturing => Ok(()),
        phase => Err(ServiceError::Conflict(format!(
            "session {} is {}, not accepting events",
            session.id,
            phase.as_str()
        ))),
    }
}

fn not_found(id: &SessionId) -> ServiceError {
    ServiceError::NotFound(format!("unknown session {id}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::{spawn_engine, DetectorFactory};
    use crate::pipeline::testing::{ByteCodec, CodeDecoder, NoFace};
    use crate::pipeline::Pipeline;
    use axum::body::Bytes;
    use chroma_core::{
        AnalyzerConfig, ColorEvent, FaceDetector, ReflectionAnalyzer, ReportStatus,
    };
    use std::path::Path;

    async fn service(work_dir: &Path, trigger: AnalysisTrigger) -> ChromaService {
        let mut config = Config::for_tests(work_dir);
        config.analysis_trigger = trigger;
        service_with(config).await
    }

    /// A service over fake media backends and an in-memory mirror.
    pub(crate) async fn service_with(config: Config) -> ChromaService {
        let work_dir = config.work_dir.clone();
        let heuristics = Heuristics::default();

        let pipeline = Arc::new(Pipeline::new(
            Arc::new(ByteCodec),
            Arc::new(CodeDecoder),
            ReflectionAnalyzer::new(AnalyzerConfig::default(), heuristics.color_naming.clone()),
            heuristics.clone(),
        ));
        let detectors: DetectorFactory =
            Arc::new(|| Ok(Box::new(NoFace) as Box<dyn FaceDetector>));
        let engine = spawn_engine(pipeline, detectors, 1).unwrap();
        let store = MirrorStore::open(Path::new(":memory:")).await.unwrap();

        ChromaService::new(
            Arc::new(config),
            Arc::new(SessionRegistry::new(&work_dir)),
            engine,
            store,
            Arc::new(heuristics),
        )
    }

    fn color(new_color: &str, timestamp: i64) -> SessionEvent {
        SessionEvent::ColorChange(ColorEvent {
            previous_color: String::new(),
            new_color: new_color.to_string(),
            timestamp,
            video_start_time: 1_000,
        })
    }

    fn fragment(sequence: u64, codes: &'static [u8]) -> SessionEvent {
        SessionEvent::VideoFragment {
            meta: FragmentMeta {
                start_time: 1_000 + sequence as i64 * 200,
                end_time: 1_200 + sequence as i64 * 200,
                mime_type: Some("video/mp4".to_string()),
                sequence: Some(sequence),
            },
            payload: Bytes::from_static(codes),
        }
    }

    /// Feed a capture: frames T T R R G G B B at 10 fps, with the reference
    /// shown at the start of the recording.
    pub(crate) async fn feed_capture(svc: &ChromaService, id: &SessionId, with_reference: bool) {
        let mut events = vec![
            SessionEvent::CaptureStart {
                timestamp: Some(1_000),
                mime_type: Some("video/mp4".to_string()),
            },
            fragment(3, b"BB"),
            fragment(0, b"TT"),
            color("blue", 1_650),
            color("red", 1_250),
            fragment(1, b"RR"),
            fragment(2, b"GG"),
            color("green", 1_450),
        ];
        if with_reference {
            events.push(color("transparent", 1_000));
        }
        for event in events {
            let outcome = svc.handle_event(id, event).await.unwrap();
            assert!(matches!(outcome, EventOutcome::Accepted));
        }
    }

    #[tokio::test]
    async fn test_genuine_capture_is_analyzed_and_mirrored() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path(), AnalysisTrigger::CaptureEnd).await;
        let id = svc.create_session().await;
        feed_capture(&svc, &id, true).await;

        let outcome = svc.handle_event(&id, SessionEvent::CaptureEnd).await.unwrap();
        let EventOutcome::Analyzed { verdict } = outcome else {
            panic!("expected analysis at capture end");
        };
        assert_eq!(verdict.status, ReportStatus::Success);
        assert_eq!(verdict.is_injected, Some(false));
        assert_eq!(verdict.analysis.as_ref().unwrap().total_frames_analyzed, 3);

        let sid = id.as_str();
        let keys: Vec<String> = svc
            .list_blobs(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.key)
            .collect();
        assert_eq!(
            keys,
            vec![
                format!("{sid}/analysis/{sid}_response.json"),
                format!("{sid}/color_data/{sid}.json"),
                format!("{sid}/images/1000_transparent.png"),
                format!("{sid}/images/1250_red.png"),
                format!("{sid}/images/1450_green.png"),
                format!("{sid}/images/1650_blue.png"),
                format!("{sid}/videos/{sid}.mp4"),
            ]
        );
        assert_eq!(
            svc.blob(&store::video_key(sid)).await.unwrap(),
            b"TTRRGGBB"
        );
        assert_eq!(svc.verdict(&id).await.unwrap(), verdict);

        // Session destroyed, work dir gone
        assert_eq!(svc.registry.len().await, 0);
        assert!(!tmp.path().join(sid).exists());
    }

    #[tokio::test]
    async fn test_missing_reference_mirrors_error_document() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path(), AnalysisTrigger::CaptureEnd).await;
        let id = SessionId::parse("no-ref").unwrap();
        feed_capture(&svc, &id, false).await;

        let outcome = svc.handle_event(&id, SessionEvent::CaptureEnd).await.unwrap();
        let EventOutcome::Analyzed { verdict } = outcome else {
            panic!("expected a verdict document");
        };
        assert_eq!(verdict.status, ReportStatus::Error);
        assert_eq!(verdict.is_injected, None);
        assert!(verdict.message.unwrap().contains("insufficient frames"));

        let mirrored = svc.blob(&store::verdict_key("no-ref")).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&mirrored).unwrap();
        assert!(json["is_injected"].is_null());
        assert_eq!(json["status"], "error");
        assert!(svc.registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_capture_without_fragments_fails_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path(), AnalysisTrigger::CaptureEnd).await;
        let id = SessionId::parse("empty").unwrap();
        svc.handle_event(&id, color("transparent", 1_000)).await.unwrap();

        let outcome = svc.handle_event(&id, SessionEvent::CaptureEnd).await.unwrap();
        let EventOutcome::Analyzed { verdict } = outcome else {
            panic!("expected a verdict document");
        };
        assert!(verdict.message.unwrap().contains("no usable media"));
        // Color data was mirrored before reassembly
        assert!(svc.blob(&store::color_data_key("empty")).await.is_ok());
    }

    #[tokio::test]
    async fn test_on_demand_analysis_and_double_capture_end() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path(), AnalysisTrigger::OnDemand).await;
        let id = SessionId::parse("later").unwrap();
        feed_capture(&svc, &id, true).await;

        assert!(matches!(
            svc.analyze(&id).await.unwrap_err(),
            ServiceError::Conflict(_)
        ));

        let outcome = svc.handle_event(&id, SessionEvent::CaptureEnd).await.unwrap();
        assert!(matches!(
            outcome,
            EventOutcome::Captured {
                frames: 4,
                misses: 0
            }
        ));
        // Fragments are gone once the capture is mirrored
        assert!(!tmp.path().join("later").exists());
        assert!(matches!(
            svc.verdict(&id).await.unwrap_err(),
            ServiceError::NotFound(_)
        ));

        let err = svc.handle_event(&id, SessionEvent::CaptureEnd).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        let err = svc.handle_event(&id, color("red", 9_000)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        let verdict = svc.analyze(&id).await.unwrap();
        assert_eq!(verdict.is_injected, Some(false));
        assert!(matches!(
            svc.analyze(&id).await.unwrap_err(),
            ServiceError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_fragment_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path(), AnalysisTrigger::CaptureEnd).await;
        let id = SessionId::parse("s").unwrap();
        let meta = FragmentMeta {
            start_time: 0,
            end_time: 10,
            mime_type: None,
            sequence: None,
        };
        let err = svc.push_fragment(&id, meta, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_status_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path(), AnalysisTrigger::OnDemand).await;
        svc.create_session().await;
        svc.create_session().await;

        let status = svc.status().await.unwrap();
        assert_eq!(status.live_sessions, 2);
        assert_eq!(status.mirrored_blobs, 0);
        assert_eq!(status.analysis_trigger, "on-demand");
    }
}
