use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crawlserver_types::{RenderJob, RenderResult, Situation, State};

use crate::cache::{Lookup, RenderCache};
use crate::dispatch::DispatchQueue;
use crate::error::CoordinatorError;
use crate::pool::WorkerPool;
use crate::state_reporter::StateReporter;

/// Extensions that never reach the render pipeline; these are treated as
/// static-asset requests the embedded app does not serve itself.
const BLOCKED_EXTENSIONS: &[&str] = &["ico", "css", "js", "html", "json"];

/// Parent-side ceiling on a single render round trip, independent of the
/// worker's own internal start deadline — this is what actually bounds a
/// hung or wedged worker process from the caller's perspective.
const RENDER_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESTART_ATTEMPTS: u32 = 3;

pub struct RequestCoordinator {
    pool: Arc<WorkerPool>,
    queue: DispatchQueue,
    cache: RenderCache,
    reporter: StateReporter,
    path_to_wasm: PathBuf,
    server_port: u32,
    debug_logs: bool,
}

/// What the HTTP layer should send back; kept free of any axum type so this
/// module stays testable without spinning up a server.
pub enum RenderedResponse {
    Ok {
        body: String,
        etag: String,
        last_modified: Option<DateTime<Utc>>,
        expires_at_ms: u64,
    },
    NotModified {
        etag: String,
    },
    NotFound,
    NotImplemented,
    ServerError(String),
    ServiceUnavailable(String),
}

impl RequestCoordinator {
    pub fn new(
        pool: Arc<WorkerPool>,
        queue: DispatchQueue,
        cache: RenderCache,
        reporter: StateReporter,
        path_to_wasm: PathBuf,
        server_port: u32,
        debug_logs: bool,
    ) -> Self {
        Self {
            pool,
            queue,
            cache,
            reporter,
            path_to_wasm,
            server_port,
            debug_logs,
        }
    }

    /// Total configured worker slots, for `/health`.
    pub async fn pool_size(&self) -> usize {
        self.pool.worker_count().await
    }

    /// Currently-idle worker slots, for `/health`.
    pub fn pool_idle_count(&self) -> usize {
        self.pool.idle_count()
    }

    /// The State Reporter's last-emitted coarse state, for `/health`.
    pub fn current_state(&self) -> Option<crawlserver_types::State> {
        self.reporter.current_state()
    }

    /// Per-request pipeline: blocked extension check, cache lookup (checked
    /// only against `If-None-Match`, per the cache's own lookup contract),
    /// then — on a miss — dispatch to a worker and, on a fresh render,
    /// evaluate both `If-None-Match` and `If-Modified-Since` against the
    /// result that render just produced.
    #[tracing::instrument(skip(self), fields(subsys = "RequestCoordinator"))]
    pub async fn handle(
        &self,
        raw_path: &str,
        if_none_match: Option<&str>,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> RenderedResponse {
        let (path, search) = split_path_query(raw_path);

        if let Some(ext) = blocked_extension(&path) {
            tracing::debug!(ext, "blocked extension, not rendering");
            return RenderedResponse::NotFound;
        }

        let cache_key = format!("{path}?{search}");
        let now_ms = now_ms();

        match self.cache.lookup(&cache_key, now_ms, if_none_match) {
            Lookup::Hit(entry) => {
                return RenderedResponse::Ok {
                    body: entry.body,
                    etag: entry.etag,
                    last_modified: entry.last_modified_at,
                    expires_at_ms: entry.expires_at_ms,
                };
            }
            Lookup::NotModified { etag } => return RenderedResponse::NotModified { etag },
            Lookup::Miss => {}
        }

        let mtime_ms = match std::fs::metadata(&self.path_to_wasm).and_then(|m| m.modified()) {
            Ok(modified) => modified
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            Err(_) => {
                self.reporter.emit(
                    State::Failing,
                    Situation::WasmMissing,
                    "wasm file missing at render time",
                );
                return RenderedResponse::ServerError("wasm_missing".to_string());
            }
        };

        match self.render_with_retries(&path, &search, mtime_ms).await {
            Ok(result) => self.translate(result, cache_key, now_ms, if_none_match, if_modified_since),
            Err(err) => {
                self.reporter.emit(State::Failing, Situation::RequestFailed, err.to_string());
                RenderedResponse::ServiceUnavailable(err.to_string())
            }
        }
    }

    /// A `restart` reply means `WorkerPool::dispatch` already replaced the
    /// worker behind `lease.worker_id()` in place, so every retry below
    /// targets that same slot rather than going back through `self.queue`
    /// for an arbitrary idle id — re-acquiring could land on a different,
    /// still-stale worker and exhaust `MAX_RESTART_ATTEMPTS` without ever
    /// retrying the one that was actually just fixed.
    async fn render_with_retries(
        &self,
        path: &str,
        search: &str,
        mtime_ms: u64,
    ) -> Result<RenderResult, CoordinatorError> {
        let job = RenderJob::render(path, search, self.server_port, self.path_to_wasm.clone(), mtime_ms, self.debug_logs);
        let lease = self.queue.acquire().await?;

        for attempt in 0..MAX_RESTART_ATTEMPTS {
            let dispatched =
                tokio::time::timeout(RENDER_TIMEOUT, self.pool.dispatch(lease.worker_id(), &job)).await;

            let result = match dispatched {
                Ok(Ok(result)) => result,
                Ok(Err(pool_err)) => return Err(CoordinatorError::Pool(pool_err)),
                Err(_) => {
                    // The worker may still be mid-render and could write a
                    // late reply into this id's reply channel; kill it and
                    // swap in a fresh worker rather than releasing this
                    // lease normally, so no unrelated future request can
                    // ever read that stale reply (spec.md §5: "mark it for
                    // kill" on a parent-side render timeout).
                    let worker_id = lease.worker_id();
                    self.pool.kill_and_replace(worker_id).await.ok();
                    lease.abandon();
                    return Err(CoordinatorError::RenderTimeout);
                }
            };

            if !result.is_restart() {
                return Ok(result);
            }

            tracing::warn!(attempt, "worker restarted, retrying on its replacement");
        }

        Err(CoordinatorError::Pool(crate::error::PoolError::TooManyRestarts))
    }

    fn translate(
        &self,
        result: RenderResult,
        cache_key: String,
        now_ms: u64,
        if_none_match: Option<&str>,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> RenderedResponse {
        match result {
            RenderResult::Render { html, .. } if html.is_empty() => {
                self.reporter.emit(State::Failing, Situation::RequestFailed, "render produced empty html");
                RenderedResponse::ServerError("empty_render".to_string())
            }
            RenderResult::Render { html, expires_in, last_modified_at } => {
                let last_modified_at = last_modified_at.and_then(|secs| DateTime::from_timestamp(secs, 0));
                let entry = self.cache.fill(cache_key, html, now_ms, expires_in, last_modified_at);
                self.reporter.emit(State::Operating, Situation::HtmlRendered, "render succeeded");

                // Conditional revalidation against the render we just
                // produced (spec: "If the client sent If-None-Match equal
                // to the newly computed ETag... If-Modified-Since >=
                // lastModifiedAt, likewise respond 304").
                if if_none_match == Some(entry.etag.as_str()) {
                    return RenderedResponse::NotModified { etag: entry.etag };
                }
                if let (Some(since), Some(last_modified)) = (if_modified_since, entry.last_modified_at) {
                    if since >= last_modified {
                        return RenderedResponse::NotModified { etag: entry.etag };
                    }
                }

                RenderedResponse::Ok {
                    body: entry.body,
                    etag: entry.etag,
                    last_modified: entry.last_modified_at,
                    expires_at_ms: entry.expires_at_ms,
                }
            }
            RenderResult::NotRendered => {
                self.reporter.emit(State::Failing, Situation::HtmlNotRendered, "app never rendered");
                RenderedResponse::NotImplemented
            }
            RenderResult::Restart { .. } | RenderResult::Crash { .. } => {
                unreachable!("restarts are resolved inside render_with_retries and crashes surface as PoolError")
            }
        }
    }
}

fn split_path_query(raw: &str) -> (String, String) {
    match raw.split_once('?') {
        Some((path, search)) => (path.to_string(), search.to_string()),
        None => (raw.to_string(), String::new()),
    }
}

fn blocked_extension(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    BLOCKED_EXTENSIONS.iter().find(|&&e| e == ext).copied()
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_path_and_query() {
        assert_eq!(split_path_query("/a/b?x=1"), ("/a/b".to_string(), "x=1".to_string()));
        assert_eq!(split_path_query("/a/b"), ("/a/b".to_string(), String::new()));
    }

    #[test]
    fn blocks_static_asset_extensions() {
        assert_eq!(blocked_extension("/app.js"), Some("js"));
        assert_eq!(blocked_extension("/app.css"), Some("css"));
        assert_eq!(blocked_extension("/favicon.ico"), Some("ico"));
        assert_eq!(blocked_extension("/page"), None);
        assert_eq!(blocked_extension("/about"), None);
    }

    async fn test_coordinator() -> RequestCoordinator {
        let reporter = StateReporter::new();
        let pool = WorkerPool::spawn(PathBuf::from("/bin/true"), 0, reporter.clone())
            .await
            .unwrap();
        let pool = Arc::new(pool);
        RequestCoordinator::new(
            pool.clone(),
            DispatchQueue::new(pool, 1),
            RenderCache::new(),
            reporter,
            PathBuf::from("/nonexistent.wasm"),
            8080,
            false,
        )
    }

    #[tokio::test]
    async fn fresh_render_revalidates_against_if_none_match() {
        let coordinator = test_coordinator().await;
        let rendered = RenderResult::Render {
            html: "<html><span id=\"x-1\">hi</span></html>".to_string(),
            expires_in: 60,
            last_modified_at: None,
        };
        let etag = crate::cache::RenderCache::etag_of("<html><span>hi</span></html>");

        let resp = coordinator.translate(rendered, "/a?".to_string(), 0, Some(&etag), None);
        assert!(matches!(resp, RenderedResponse::NotModified { .. }));
    }

    #[tokio::test]
    async fn fresh_render_revalidates_against_if_modified_since() {
        let coordinator = test_coordinator().await;
        let last_modified_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let rendered = RenderResult::Render {
            html: "<html>hi</html>".to_string(),
            expires_in: 60,
            last_modified_at: Some(1_700_000_000),
        };

        let resp = coordinator.translate(
            rendered,
            "/a?".to_string(),
            0,
            None,
            Some(last_modified_at),
        );
        assert!(matches!(resp, RenderedResponse::NotModified { .. }));
    }

    #[tokio::test]
    async fn fresh_render_serves_200_when_preconditions_do_not_match() {
        let coordinator = test_coordinator().await;
        let rendered = RenderResult::Render {
            html: "<html>hi</html>".to_string(),
            expires_in: 60,
            last_modified_at: None,
        };

        let resp = coordinator.translate(rendered, "/a?".to_string(), 0, None, None);
        assert!(matches!(resp, RenderedResponse::Ok { .. }));
    }
}
