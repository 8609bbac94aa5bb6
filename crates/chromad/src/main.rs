use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use chroma_core::{AnalyzerConfig, FaceDetector, ReflectionAnalyzer, ScrfdDetector};
use chroma_media::Ffmpeg;

mod config;
mod engine;
mod events;
mod http;
mod pipeline;
mod service;
mod session;
mod store;

use config::Config;
use engine::DetectorFactory;
use pipeline::Pipeline;
use service::ChromaService;
use session::SessionRegistry;
use store::MirrorStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("chromad starting");

    let config = Config::from_env()?;
    let heuristics = config.load_heuristics()?;
    tracing::info!(
        bind = %config.bind,
        work_dir = %config.work_dir.display(),
        db = %config.db_path.display(),
        workers = config.workers,
        trigger = config.analysis_trigger.as_str(),
        auth = config.api_key.is_some(),
        model = %config.detector_model.display(),
        "configuration loaded"
    );

    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("creating work dir {}", config.work_dir.display()))?;
    let store = MirrorStore::open(&config.db_path)
        .await
        .context("opening mirror database")?;

    let ffmpeg = Arc::new(Ffmpeg::new(&config.ffmpeg, &config.ffprobe));
    let analyzer = ReflectionAnalyzer::new(
        AnalyzerConfig {
            threshold: config.diff_threshold,
            region: config.region,
            face_margin: config.face_margin,
            ..AnalyzerConfig::default()
        },
        heuristics.color_naming.clone(),
    );
    let pipeline = Arc::new(Pipeline::new(
        ffmpeg.clone(),
        ffmpeg,
        analyzer,
        heuristics.clone(),
    ));
    let model = config.detector_model.clone();
    let detectors: DetectorFactory = Arc::new(move || {
        Ok(Box::new(ScrfdDetector::load(&model)?) as Box<dyn FaceDetector>)
    });
    let engine = engine::spawn_engine(pipeline, detectors, config.workers)
        .context("starting engine (run `chroma setup` to fetch the detector model)")?;
    tracing::info!(path = %config.detector_model.display(), "SCRFD detector loaded");

    let registry = Arc::new(SessionRegistry::new(&config.work_dir));
    session::spawn_sweeper(
        registry.clone(),
        Duration::from_secs(config.sweep_interval_secs),
        Duration::from_secs(config.session_ttl_secs),
    );

    let bind = config.bind;
    let service = ChromaService::new(
        Arc::new(config),
        registry,
        engine,
        store,
        Arc::new(heuristics),
    );
    let app = http::create_router(service);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(addr = %bind, "chromad ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("chromad shutting down");
        })
        .await?;

    Ok(())
}
