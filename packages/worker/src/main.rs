//! Entry point for the isolated Wasm-host worker process. Reads one
//! newline-delimited `RenderJob` JSON object at a time from stdin, writes
//! exactly one `RenderResult` JSON object to stdout per job, and exits
//! when the parent closes the pipe or a terminal condition is reached.
//! Never a second job is read before the previous reply is written.

use std::io::{BufRead, Write};

use crawlserver_types::{RenderJob, RenderResult};
use crawlserver_worker::{EngineError, WorkerEngine};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .without_time()
        .init();

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut engine = WorkerEngine::new().expect("failed to initialize wasm engine");

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let job: RenderJob = match serde_json::from_str(&line) {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(%err, "failed to parse render job");
                break;
            }
        };

        let RenderJob::Render {
            path,
            search,
            server_port,
            path_to_wasm,
            wasm_mtime_ms,
            debug_logs,
        } = job;

        let (result, should_exit) = if engine.is_loaded() {
            handle_warm(&mut engine, wasm_mtime_ms, &path, &search)
        } else {
            handle_cold(
                &mut engine,
                &path_to_wasm,
                wasm_mtime_ms,
                server_port,
                &path,
                &search,
                debug_logs,
            )
        };

        write_result(&mut stdout, &result);

        if should_exit {
            std::process::exit(if matches!(result, RenderResult::Restart { .. }) { 0 } else { 1 });
        }
    }
}

fn handle_cold(
    engine: &mut WorkerEngine,
    path_to_wasm: &std::path::Path,
    wasm_mtime_ms: u64,
    server_port: u32,
    path: &str,
    search: &str,
    debug_logs: bool,
) -> (RenderResult, bool) {
    match engine.load(path_to_wasm, wasm_mtime_ms, server_port, path, search, debug_logs) {
        Ok(outcome) => (
            RenderResult::Render {
                html: outcome.html,
                expires_in: outcome.expires_in_secs,
                last_modified_at: outcome.last_modified_at.map(|t| t.timestamp()),
            },
            false,
        ),
        Err(EngineError::StartTimeout) => {
            tracing::warn!("app never signalled readiness within the start deadline");
            (RenderResult::NotRendered, true)
        }
        Err(EngineError::MissingChangeRoute) => {
            tracing::warn!("app never registered a change-route callback");
            (RenderResult::NotRendered, true)
        }
        Err(err) => {
            tracing::error!(%err, "cold render failed");
            (RenderResult::Crash { reason: err.to_string() }, true)
        }
    }
}

fn handle_warm(
    engine: &mut WorkerEngine,
    wasm_mtime_ms: u64,
    path: &str,
    search: &str,
) -> (RenderResult, bool) {
    match engine.render_warm(wasm_mtime_ms, path, search) {
        Ok(None) => (RenderResult::Restart { reason: "stale-wasm".to_string() }, true),
        Ok(Some(outcome)) => (
            RenderResult::Render {
                html: outcome.html,
                expires_in: outcome.expires_in_secs,
                last_modified_at: outcome.last_modified_at.map(|t| t.timestamp()),
            },
            false,
        ),
        Err(err) => {
            tracing::error!(%err, "warm render failed");
            (RenderResult::Crash { reason: err.to_string() }, true)
        }
    }
}

fn write_result(stdout: &mut std::io::Stdout, result: &RenderResult) {
    if let Ok(mut line) = serde_json::to_string(result) {
        line.push('\n');
        let _ = stdout.write_all(line.as_bytes());
        let _ = stdout.flush();
    }
}
