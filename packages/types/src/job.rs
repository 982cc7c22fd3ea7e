use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Parent -> worker message. One render job is ever outstanding per worker
/// at a time; the parent never sends a second job before receiving a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RenderJob {
    Render {
        path: String,
        search: String,
        server_port: u32,
        path_to_wasm: PathBuf,
        /// mtime of `path_to_wasm` as observed by the coordinator, in whole
        /// milliseconds since the Unix epoch.
        wasm_mtime_ms: u64,
        debug_logs: bool,
    },
}

impl RenderJob {
    pub fn render(
        path: impl Into<String>,
        search: impl Into<String>,
        server_port: u32,
        path_to_wasm: PathBuf,
        wasm_mtime_ms: u64,
        debug_logs: bool,
    ) -> Self {
        RenderJob::Render {
            path: path.into(),
            search: search.into(),
            server_port,
            path_to_wasm,
            wasm_mtime_ms,
            debug_logs,
        }
    }
}

/// Worker -> parent reply. Exactly one of these is sent per `RenderJob`,
/// unless the worker dies before it can reply (the parent's own timeout is
/// the backstop in that case).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RenderResult {
    Render {
        html: String,
        /// seconds, app-supplied; 0 means "30 days" per the cache fill rule.
        expires_in: u64,
        /// Unix seconds, app-supplied; absent if the app never set one.
        last_modified_at: Option<i64>,
    },
    NotRendered,
    Restart {
        reason: String,
    },
    Crash {
        reason: String,
    },
}

impl RenderResult {
    pub fn is_restart(&self) -> bool {
        matches!(self, RenderResult::Restart { .. })
    }
}
