use std::path::PathBuf;

use figment::providers::{Env, Format, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::args::CliArgs;

pub const DEFAULT_CHILD_PROCESSES: usize = 4;
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_PENDING: usize = 1_000;

/// Exit codes named in the CLI contract.
pub const EXIT_WASM_PATH_MISSING: i32 = 10;
pub const EXIT_WASM_FILE_NOT_FOUND: i32 = 20;
pub const EXIT_LISTENER_FAILED: i32 = 30;
pub const EXIT_OTHER: i32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no Wasm path given (pass a positional argument, --path-to-wasm, or set CS_PATH_TO_WASM)")]
    PathMissing,
    #[error("Wasm file not found at {0}")]
    FileNotFound(PathBuf),
    #[error("failed to build configuration: {0}")]
    Build(#[from] figment::Error),
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::PathMissing => EXIT_WASM_PATH_MISSING,
            ConfigError::FileNotFound(_) => EXIT_WASM_FILE_NOT_FOUND,
            ConfigError::Build(_) => EXIT_OTHER,
        }
    }
}

/// The fully parsed and validated configuration, built up from (in order of
/// preference) CLI args, then environment variables, then defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub path_to_wasm: PathBuf,
    pub port: u16,
    pub child_processes: usize,
    pub debug: bool,
    pub global_bind: bool,
    pub max_pending: usize,
}

impl Config {
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let wasm_path = args.wasm_path().ok_or(ConfigError::PathMissing)?;

        #[derive(Serialize, Deserialize, Default)]
        #[serde(default)]
        struct Defaults {
            server_port: u16,
            child_processes: usize,
            max_pending: usize,
        }

        #[derive(Serialize)]
        struct ArgsView {
            #[serde(skip_serializing_if = "Option::is_none")]
            server_port: Option<u16>,
            #[serde(skip_serializing_if = "Option::is_none")]
            child_processes: Option<usize>,
        }

        let defaults = Defaults {
            server_port: DEFAULT_PORT,
            child_processes: DEFAULT_CHILD_PROCESSES,
            max_pending: DEFAULT_MAX_PENDING,
        };

        let merged: Defaults = Figment::new()
            .merge(Serialized::defaults(defaults))
            .merge(Serialized::defaults(ArgsView {
                server_port: args.port,
                child_processes: args.child_processes,
            }))
            .merge(Env::prefixed("CS_"))
            .extract()?;

        // `CS_DEBUG`/`CS_GLOBAL_BIND` are presence-triggered flags rather
        // than valued settings, so they are resolved directly rather than
        // through figment's value-merge semantics.
        let debug = args.debug || std::env::var_os("CS_DEBUG").is_some();
        let global_bind = args.global_bind || std::env::var_os("CS_GLOBAL_BIND").is_some();

        if !wasm_path.exists() {
            return Err(ConfigError::FileNotFound(wasm_path));
        }

        Ok(Config {
            path_to_wasm: wasm_path,
            port: merged.server_port,
            child_processes: merged.child_processes.max(1),
            debug,
            global_bind,
            max_pending: merged.max_pending,
        })
    }

    pub fn bind_host(&self) -> &'static str {
        if self.global_bind {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }
}
