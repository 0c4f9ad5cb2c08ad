use facegate_core::{ExtractError, Extraction, FaceDetector, SignatureExtractor};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("face detection timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Extract {
        payload: String,
        reply: oneshot::Sender<Result<Extraction, ExtractError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    algorithm: Arc<str>,
}

impl EngineHandle {
    /// Extract a signature from a base64 image payload.
    ///
    /// Gives up after `timeout`, counted from the call: time spent waiting
    /// for a queue slot is included. The engine finishes any in-flight
    /// detection and discards the reply.
    pub async fn extract(&self, payload: String, timeout: Duration) -> Result<Extraction, EngineError> {
        let request = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(EngineRequest::Extract {
                    payload,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            Ok::<_, EngineError>(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
        };

        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(timeout)),
        }
    }

    /// Algorithm tag of the detector this engine runs.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }
}

/// Spawn the engine on a dedicated OS thread that owns `detector`.
///
/// The detector is never shared: requests queue on a bounded channel and run
/// one at a time. The thread exits once every handle is dropped.
pub fn spawn_engine<D>(detector: D) -> Result<EngineHandle, EngineError>
where
    D: FaceDetector + 'static,
{
    let mut extractor = SignatureExtractor::new(detector);
    let algorithm: Arc<str> = Arc::from(extractor.algorithm());
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { payload, reply } => {
                        let result = extractor.extract(&payload);
                        drop(payload);
                        if reply.send(result).is_err() {
                            tracing::debug!("extraction reply dropped; caller gave up");
                        }
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, algorithm })
}
