pub mod args;
pub mod cache;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod pool;
pub mod state_reporter;

use std::sync::Arc;

use config::Config;
use context::AppContext;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to bind the HTTP listener: {0}")]
    Listener(#[source] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Wires up the pool, dispatch queue, cache, coordinator, and HTTP server
/// from a validated [`Config`], and runs until `ctx` is killed.
pub async fn run(config: Config, worker_binary: std::path::PathBuf, ctx: AppContext) -> Result<(), RunError> {
    let reporter = state_reporter::StateReporter::new();
    reporter.emit(
        crawlserver_types::State::Operating,
        crawlserver_types::Situation::ServerStarted,
        "server starting",
    );

    let pool = pool::WorkerPool::spawn(worker_binary, config.child_processes, reporter.clone())
        .await
        .map_err(|err| RunError::Other(err.into()))?;
    let pool = Arc::new(pool);

    tokio::spawn(pool::supervise(pool.clone(), ctx.get_kill_receiver()));

    // Admission capacity is pool slots + pending bound: the spec's queue
    // bound limits requests *waiting* for a worker, on top of however many
    // are already being rendered (see spec.md §8 scenario 5).
    let queue = dispatch::DispatchQueue::new(pool.clone(), config.child_processes + config.max_pending);
    let cache = cache::RenderCache::new();

    let coordinator = Arc::new(coordinator::RequestCoordinator::new(
        pool,
        queue,
        cache,
        reporter.clone(),
        config.path_to_wasm.clone(),
        config.port as u32,
        config.debug,
    ));

    let state = http::HttpState {
        coordinator,
        ctx: ctx.clone(),
    };

    let addr = format!("{}:{}", config.bind_host(), config.port)
        .parse()
        .map_err(|err| RunError::Other(anyhow::Error::new(err)))?;
    let listener = http::bind(addr).await.map_err(RunError::Listener)?;
    http::serve_on(listener, state, ctx).await.map_err(|err| RunError::Other(err.into()))?;

    // Graceful shutdown completed: the listener is closed and in-flight
    // requests observed the connection close (spec.md §5). This is the one
    // path that reaches `Stopped`/`fulfilled_stop_call` — every other exit
    // from `serve_on` is an error already mapped above.
    reporter.emit(
        crawlserver_types::State::Stopped,
        crawlserver_types::Situation::FulfilledStopCall,
        "server stopped after a shutdown signal",
    );
    Ok(())
}
