use thiserror::Error;

/// Domain errors the Request Coordinator classifies into HTTP status
/// codes. Everything here is recovered inside the coordinator; it never
/// unwinds past it.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("wasm file is missing")]
    WasmMissing,
    #[error("render queue is full")]
    QueueFull,
    #[error("worker did not reply within the render timeout")]
    RenderTimeout,
    #[error("worker reported not-rendered")]
    NotRendered,
    #[error("render returned an empty body")]
    EmptyRender,
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("unexpected failure: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to write render job to worker: {0}")]
    Write(#[source] std::io::Error),
    #[error("worker closed its stdout before replying")]
    WorkerGone,
    #[error("worker reply was not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("worker restarted too many times for one request")]
    TooManyRestarts,
}
