use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, Request, State,
    },
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chroma_core::FragmentMeta;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::events::EventEnvelope;
use crate::service::{ChromaService, ServiceError};
use crate::session::SessionId;

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Engine(_)
            | ServiceError::Store(_)
            | ServiceError::Io(_)
            | ServiceError::Json(_) => {
                tracing::error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the HTTP router with all routes.
pub fn create_router(service: ChromaService) -> Router {
    let max_body = service.config().max_fragment_bytes;

    let protected = Router::new()
        .route("/status", get(status))
        // Session lifecycle
        .route("/sessions", post(create_session))
        .route("/sessions/:session_id/events", post(post_event))
        .route("/sessions/:session_id/fragments", post(post_fragment))
        .route("/sessions/:session_id/analyze", post(analyze))
        // Mirror queries
        .route("/sessions/:session_id/verdict", get(verdict))
        .route("/sessions/:session_id/blobs", get(list_blobs))
        .route("/blobs/*key", get(get_blob))
        .route_layer(middleware::from_fn_with_state(
            service.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn require_api_key(
    State(service): State<ChromaService>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Response {
    if let Some(expected) = service.api_key() {
        let provided = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected) {
            tracing::warn!(path = %req.uri().path(), "rejected request with missing or wrong API key");
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "missing or invalid API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(req).await
}

fn session_id(raw: &str) -> Result<SessionId, ServiceError> {
    SessionId::parse(raw)
        .ok_or_else(|| ServiceError::BadRequest(format!("invalid session id '{raw}'")))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
async fn health_check() -> &'static str {
    "OK"
}

/// GET /status
async fn status(State(service): State<ChromaService>) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(service.status().await?))
}

/// POST /sessions
async fn create_session(State(service): State<ChromaService>) -> impl IntoResponse {
    let id = service.create_session().await;
    (
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: id.to_string(),
        }),
    )
}

/// POST /sessions/:session_id/events
async fn post_event(
    State(service): State<ChromaService>,
    Path(raw_id): Path<String>,
    envelope: Result<Json<EventEnvelope>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = session_id(&raw_id)?;
    let Json(envelope) = envelope.map_err(|e| ServiceError::BadRequest(e.body_text()))?;
    let event = envelope
        .into_event(&service.heuristics().palette)
        .map_err(ServiceError::BadRequest)?;
    Ok(Json(service.handle_event(&id, event).await?))
}

/// POST /sessions/:session_id/fragments?startTime=..&endTime=..[&mimeType=..][&sequence=..]
async fn post_fragment(
    State(service): State<ChromaService>,
    Path(raw_id): Path<String>,
    meta: Result<Query<FragmentMeta>, QueryRejection>,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let id = session_id(&raw_id)?;
    let Query(meta) = meta.map_err(|e| ServiceError::BadRequest(e.body_text()))?;
    Ok(Json(service.push_fragment(&id, meta, body).await?))
}

/// POST /sessions/:session_id/analyze
async fn analyze(
    State(service): State<ChromaService>,
    Path(raw_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = session_id(&raw_id)?;
    Ok(Json(service.analyze(&id).await?))
}

/// GET /sessions/:session_id/verdict
async fn verdict(
    State(service): State<ChromaService>,
    Path(raw_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = session_id(&raw_id)?;
    Ok(Json(service.verdict(&id).await?))
}

/// GET /sessions/:session_id/blobs
async fn list_blobs(
    State(service): State<ChromaService>,
    Path(raw_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = session_id(&raw_id)?;
    Ok(Json(service.list_blobs(&id).await?))
}

/// GET /blobs/*key
async fn get_blob(
    State(service): State<ChromaService>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let content = service.blob(&key).await?;
    Ok(([(header::CONTENT_TYPE, content_type(&key))], content))
}

fn content_type(key: &str) -> &'static str {
    match key.rsplit_once('.').map(|(_, ext)| ext) {
        Some("mp4") => "video/mp4",
        Some("png") => "image/png",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalysisTrigger, Config};
    use crate::service::tests::service_with;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn router(work_dir: &std::path::Path, api_key: Option<&str>) -> Router {
        let mut config = Config::for_tests(work_dir);
        config.api_key = api_key.map(str::to_string);
        config.analysis_trigger = AnalysisTrigger::CaptureEnd;
        create_router(service_with(config).await)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_key() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(tmp.path(), Some("secret")).await;

        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_key_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(tmp.path(), Some("secret")).await;

        let resp = app
            .clone()
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], "missing or invalid API key");

        let resp = app
            .oneshot(
                Request::get("/status")
                    .header("X-API-Key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let status = body_json(resp).await;
        assert_eq!(status["live_sessions"], 0);
        assert_eq!(status["analysis_trigger"], "capture-end");
    }

    #[tokio::test]
    async fn test_capture_over_http() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(tmp.path(), None).await;

        let resp = app
            .clone()
            .oneshot(Request::post("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let sid = body_json(resp).await["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        // Frames at 10 fps: T T R R B B
        for (seq, codes) in [(1, "RR"), (0, "TT"), (2, "BB")] {
            let start = 1_000 + seq * 200;
            let uri = format!(
                "/sessions/{sid}/fragments?startTime={start}&endTime={}&mimeType=video/mp4&sequence={seq}",
                start + 200
            );
            let resp = app
                .clone()
                .oneshot(Request::post(uri).body(Body::from(codes)).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(body_json(resp).await["status"], "accepted");
        }

        for (color, ts) in [("#00000000", 1_000), ("#FF0000", 1_250), ("#0000FF", 1_450)] {
            let event = json!({
                "event": "color-change",
                "data": {
                    "previousColor": "",
                    "newColor": color,
                    "timestamp": ts,
                    "videoStartTime": 1_000
                }
            });
            let resp = app
                .clone()
                .oneshot(post_json(&format!("/sessions/{sid}/events"), event))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/sessions/{sid}/events"),
                json!({"event": "capture-end", "data": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = body_json(resp).await;
        assert_eq!(outcome["status"], "analyzed");
        assert_eq!(outcome["verdict"]["status"], "success");
        assert_eq!(outcome["verdict"]["is_injected"], false);
        assert_eq!(outcome["verdict"]["analysis"]["total_frames_analyzed"], 2);

        let resp = app
            .clone()
            .oneshot(
                Request::get(format!("/sessions/{sid}/verdict"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["is_injected"], false);

        let resp = app
            .oneshot(
                Request::get(format!("/blobs/{sid}/images/1250_red.png"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(tmp.path(), None).await;

        let resp = app
            .clone()
            .oneshot(post_json("/sessions/bad%2Fid/events", json!({"event": "capture-end"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(post_json("/sessions/s1/events", json!({"event": "zoom"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].is_string());

        let resp = app
            .clone()
            .oneshot(
                Request::post("/sessions/s1/fragments?endTime=5")
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(Request::post("/sessions/nope/analyze").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(Request::get("/blobs/nope/x.png").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("s/videos/s.mp4"), "video/mp4");
        assert_eq!(content_type("s/analysis/s_response.json"), "application/json");
        assert_eq!(content_type("s/other"), "application/octet-stream");
    }
}
