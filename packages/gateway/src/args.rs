use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// CLI surface: `crawlserver [path] [-p PORT] [-c N] [-d] [-g]`.
///
/// Every field doubles as an environment variable override
/// (`CS_PATH_TO_WASM`, `CS_SERVER_PORT`, `CS_CHILD_PROCESSES`, `CS_DEBUG`,
/// `CS_GLOBAL_BIND`) via clap's `env` attribute, merged into `Config`
/// through figment so CLI > env > built-in defaults.
#[derive(Debug, Parser, Serialize, Deserialize, Default, Clone)]
#[command(version, about = "SSR gateway for a single Wasm application")]
#[serde(default)]
pub struct CliArgs {
    /// Path to the Wasm binary to render. Required — via positional arg or
    /// `CS_PATH_TO_WASM`.
    #[arg(value_name = "PATH")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Path to the Wasm binary, as an alternative to the positional arg.
    #[arg(long = "path-to-wasm", env = "CS_PATH_TO_WASM")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_to_wasm: Option<PathBuf>,

    /// Port to bind the HTTP server to.
    #[arg(short = 'p', long = "port", env = "CS_SERVER_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Number of isolated render worker processes to keep warm.
    #[arg(short = 'c', long = "child-processes", env = "CS_CHILD_PROCESSES")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_processes: Option<usize>,

    /// Verbose logging, and forwards worker stdout/stderr to host logs.
    #[arg(short = 'd', long = "debug", env = "CS_DEBUG")]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,

    /// Bind `0.0.0.0` instead of loopback.
    #[arg(short = 'g', long = "global-bind", env = "CS_GLOBAL_BIND")]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub global_bind: bool,
}

impl CliArgs {
    pub fn wasm_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(|| self.path_to_wasm.clone())
    }
}
