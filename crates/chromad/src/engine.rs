use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};

use chroma_core::{DetectorError, FaceDetector, Verdict};

use crate::pipeline::{CaptureOutcome, Pipeline, PipelineError};
use crate::session::SessionState;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to load face detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Builds one face detector per worker thread.
pub type DetectorFactory =
    Arc<dyn Fn() -> Result<Box<dyn FaceDetector>, DetectorError> + Send + Sync>;

type Guard = OwnedMutexGuard<SessionState>;

/// Messages sent from request handlers to the engine workers.
///
/// Each carries the session's lock guard; the worker hands it back with the
/// result, so the session stays locked for the whole operation.
enum EngineRequest {
    Finalize {
        state: Guard,
        reply: oneshot::Sender<(Guard, Result<CaptureOutcome, PipelineError>)>,
    },
    Analyze {
        state: Guard,
        reply: oneshot::Sender<(Guard, Result<Verdict, PipelineError>)>,
    },
}

/// Clone-safe handle to the engine workers.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Reassemble the session's fragments and extract its frames.
    pub async fn finalize(
        &self,
        state: Guard,
    ) -> Result<(Guard, Result<CaptureOutcome, PipelineError>), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Finalize {
                state,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Analyze the frames extracted at capture end. They are consumed.
    pub async fn analyze(
        &self,
        state: Guard,
    ) -> Result<(Guard, Result<Verdict, PipelineError>), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                state,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn `workers` engine threads sharing one request queue.
///
/// Each worker owns its own face detector, built before its thread starts;
/// a detector that fails to load stops startup. A request that would send a
/// guard to a dead engine fails with `ChannelClosed` and the guard is
/// dropped, releasing the session.
pub fn spawn_engine(
    pipeline: Arc<Pipeline>,
    detectors: DetectorFactory,
    workers: usize,
) -> Result<EngineHandle, EngineError> {
    let workers = workers.max(1);
    let (tx, rx) = mpsc::channel::<EngineRequest>(workers * 2);
    let rx = Arc::new(Mutex::new(rx));

    for id in 0..workers {
        let rx = rx.clone();
        let pipeline = pipeline.clone();
        let mut detector = detectors()?;
        std::thread::Builder::new()
            .name(format!("chroma-engine-{id}"))
            .spawn(move || {
                tracing::info!(worker = id, "engine worker started");
                loop {
                    // Hold the queue lock only while waiting for the next request
                    let next = match rx.lock() {
                        Ok(mut rx) => rx.blocking_recv(),
                        Err(_) => None,
                    };
                    let Some(req) = next else {
                        break;
                    };
                    handle(&pipeline, detector.as_mut(), req);
                }
                tracing::info!(worker = id, "engine worker exiting");
            })
            .map_err(EngineError::Spawn)?;
    }

    tracing::info!(workers, "engine started");
    Ok(EngineHandle { tx })
}

fn handle(pipeline: &Pipeline, detector: &mut dyn FaceDetector, req: EngineRequest) {
    match req {
        EngineRequest::Finalize { mut state, reply } => {
            let result = pipeline.finalize(&mut state);
            let _ = reply.send((state, result));
        }
        EngineRequest::Analyze { mut state, reply } => {
            let frames = std::mem::take(&mut state.frames);
            let result = pipeline.analyze(detector, frames);
            let _ = reply.send((state, result));
        }
    }
}
