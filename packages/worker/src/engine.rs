//! The worker contract: instantiate a single Wasm
//! module once per process, install the three host-provided callbacks the
//! embedded app calls to register itself, and drive cold/warm renders.
//!
//! The exact guest ABI for passing strings into the guest's registered
//! change-route callback and for registering callbacks as funcrefs is left
//! to the host embedding, so this module picks one concrete, minimal
//! convention:
//!
//! Host-provided imports under module `crawlserver`:
//!   - `app_on_start()` — guest calls once init is done.
//!   - `register_disable_location_change_listener(cb: funcref)` — guest
//!     registers a zero-arg callback the host invokes once after start.
//!   - `register_change_route(cb: funcref)` — guest registers a callback
//!     of shape `(path_ptr, path_len, search_ptr, search_len)` the host
//!     invokes per render.
//!   - `change_route_done(expires_in_secs: i64, has_last_modified: i32,
//!     last_modified_at_secs: i64)` — the registered change-route callback
//!     calls this before returning to report the render outcome.
//!
//! The guest must export `cabi_realloc(old_ptr, old_len, align, new_len)
//! -> i32` so the host can place `path`/`search` bytes into guest memory
//! before calling the registered change-route callback.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use wasmtime::{Caller, Engine, FuncType, Instance, Linker, Module, Store, Val, ValType};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

/// Deadline for the guest to signal it has finished starting up.
pub const START_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("wasm file missing or unreadable: {0}")]
    Missing(#[source] std::io::Error),
    #[error("wasm module failed to compile: {0}")]
    Compile(#[source] anyhow::Error),
    #[error("wasm instantiation failed: {0}")]
    Instantiate(#[source] anyhow::Error),
    #[error("app never called app_on_start within the start deadline")]
    StartTimeout,
    #[error("app did not register a change-route callback")]
    MissingChangeRoute,
    #[error("render failed: {0}")]
    Render(#[source] anyhow::Error),
}

/// The late-bound capability record the guest populates by calling its
/// host-imported registration functions: a small capability record
/// the host inspects after start.
#[derive(Default)]
struct AppCallbacks {
    started: bool,
    disable_location_listener: Option<wasmtime::Func>,
    change_route: Option<wasmtime::Func>,
    pending_render: Option<(u64, Option<DateTime<Utc>>)>,
}

struct HostState {
    wasi: WasiP1Ctx,
    callbacks: Arc<Mutex<AppCallbacks>>,
}

pub struct RenderOutcome {
    pub html: String,
    pub expires_in_secs: u64,
    pub last_modified_at: Option<DateTime<Utc>>,
}

/// One live Wasm instance plus the state needed to reuse it on the warm
/// path below, where the already-live instance is reused.
pub struct LoadedApp {
    store: Store<HostState>,
    instance: Instance,
    callbacks: Arc<Mutex<AppCallbacks>>,
    pub loaded_mtime_ms: u64,
}

pub struct WorkerEngine {
    engine: Engine,
    app: Option<LoadedApp>,
}

impl WorkerEngine {
    pub fn new() -> anyhow::Result<Self> {
        let mut config = wasmtime::Config::new();
        config.wasm_multi_memory(true);
        let engine = Engine::new(&config)?;
        Ok(Self { engine, app: None })
    }

    pub fn is_loaded(&self) -> bool {
        self.app.is_some()
    }

    pub fn loaded_mtime_ms(&self) -> Option<u64> {
        self.app.as_ref().map(|a| a.loaded_mtime_ms)
    }

    /// First render for this process: compiles and instantiates the module.
    pub fn load(
        &mut self,
        wasm_path: &Path,
        mtime_ms: u64,
        server_port: u32,
        path: &str,
        search: &str,
        debug_logs: bool,
    ) -> Result<RenderOutcome, EngineError> {
        let bytes = std::fs::read(wasm_path).map_err(EngineError::Missing)?;
        let module = Module::new(&self.engine, &bytes).map_err(EngineError::Compile)?;

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        preview1::add_to_linker_sync(&mut linker, |h: &mut HostState| &mut h.wasi)
            .map_err(EngineError::Instantiate)?;

        let callbacks = Arc::new(Mutex::new(AppCallbacks::default()));
        add_app_callbacks(&mut linker, callbacks.clone()).map_err(EngineError::Instantiate)?;

        // Wasm stdout/stderr are host logs, gated behind --debug (spec.md
        // §4.1 step 5); non-debug, the guest's own output is discarded by
        // leaving the default (unconnected) stdio in place.
        let mut wasi_builder = WasiCtxBuilder::new();
        wasi_builder.env("LOCATION_HOST", &format!("0.0.0.0:{server_port}"));
        if debug_logs {
            wasi_builder.inherit_stdout().inherit_stderr();
        }
        let wasi = wasi_builder.build_p1();

        let mut store = Store::new(&self.engine, HostState { wasi, callbacks: callbacks.clone() });

        let instance = run_with_deadline(START_DEADLINE, || {
            let instance = linker
                .instantiate(&mut store, &module)
                .map_err(EngineError::Instantiate)?;

            // reactor-style modules export `_initialize`
            // and expect the host to dispatch to `main` afterward; command
            // modules just export `_start`.
            if let Ok(initialize) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
                initialize.call(&mut store, ()).map_err(EngineError::Instantiate)?;

                if let Ok(main) = instance.get_typed_func::<(), i32>(&mut store, "main") {
                    let _ = main.call(&mut store, ());
                } else if let Ok(main) = instance.get_typed_func::<(), ()>(&mut store, "__main_argc_argv") {
                    let _ = main.call(&mut store, ());
                }
            } else if let Ok(start) = instance.get_typed_func::<(), ()>(&mut store, "_start") {
                let _ = start.call(&mut store, ());
            }

            Ok(instance)
        })?;

        if !callbacks.lock().unwrap().started {
            return Err(EngineError::StartTimeout);
        }

        let disable_cb = callbacks.lock().unwrap().disable_location_listener;
        if let Some(disable) = disable_cb {
            let disable = disable.typed::<(), ()>(&store).map_err(EngineError::Render)?;
            disable.call(&mut store, ()).map_err(EngineError::Render)?;
        }

        if callbacks.lock().unwrap().change_route.is_none() {
            return Err(EngineError::MissingChangeRoute);
        }

        let outcome = invoke_change_route(&mut store, &instance, &callbacks, path, search)?;

        self.app = Some(LoadedApp {
            store,
            instance,
            callbacks,
            loaded_mtime_ms: mtime_ms,
        });

        Ok(outcome)
    }

    /// Reuses the already-loaded instance. Returns `Ok(None)` when the job's
    /// `wasm_mtime_ms` no longer matches the loaded instance — the caller
    /// must reply `restart` and exit without re-instantiating in-place.
    pub fn render_warm(
        &mut self,
        wasm_mtime_ms: u64,
        path: &str,
        search: &str,
    ) -> Result<Option<RenderOutcome>, EngineError> {
        let app = self.app.as_mut().expect("render_warm called before load");
        if app.loaded_mtime_ms != wasm_mtime_ms {
            return Ok(None);
        }
        invoke_change_route(&mut app.store, &app.instance, &app.callbacks, path, search).map(Some)
    }
}

fn invoke_change_route(
    store: &mut Store<HostState>,
    instance: &Instance,
    callbacks: &Arc<Mutex<AppCallbacks>>,
    path: &str,
    search: &str,
) -> Result<RenderOutcome, EngineError> {
    let change_route = callbacks
        .lock()
        .unwrap()
        .change_route
        .ok_or(EngineError::MissingChangeRoute)?;

    let realloc = instance
        .get_typed_func::<(i32, i32, i32, i32), i32>(&mut *store, "cabi_realloc")
        .map_err(EngineError::Render)?;
    let memory = instance
        .get_memory(&mut *store, "memory")
        .ok_or_else(|| EngineError::Render(anyhow::anyhow!("guest exports no memory")))?;

    let path_ptr = write_string(store, &realloc, &memory, path).map_err(EngineError::Render)?;
    let search_ptr = write_string(store, &realloc, &memory, search).map_err(EngineError::Render)?;

    callbacks.lock().unwrap().pending_render = None;

    let change_route = change_route
        .typed::<(i32, i32, i32, i32), ()>(&mut *store)
        .map_err(EngineError::Render)?;
    change_route
        .call(
            &mut *store,
            (path_ptr, path.len() as i32, search_ptr, search.len() as i32),
        )
        .map_err(EngineError::Render)?;

    let (expires_in_secs, last_modified_at) = callbacks
        .lock()
        .unwrap()
        .pending_render
        .take()
        .ok_or_else(|| EngineError::Render(anyhow::anyhow!("app never called change_route_done")))?;

    let html = serialize_dom(store, instance).map_err(EngineError::Render)?;

    Ok(RenderOutcome {
        html,
        expires_in_secs,
        last_modified_at,
    })
}

/// DOM serialization itself is out of scope for this host; the
/// worker treats whatever the guest leaves behind its `render_result`
/// export as opaque HTML bytes to forward upward unchanged.
fn serialize_dom(store: &mut Store<HostState>, instance: &Instance) -> anyhow::Result<String> {
    let result_ptr = instance.get_typed_func::<(), i32>(&mut *store, "render_result_ptr")?;
    let result_len = instance.get_typed_func::<(), i32>(&mut *store, "render_result_len")?;
    let memory = instance
        .get_memory(&mut *store, "memory")
        .ok_or_else(|| anyhow::anyhow!("guest exports no memory"))?;

    let ptr = result_ptr.call(&mut *store, ())? as usize;
    let len = result_len.call(&mut *store, ())? as usize;
    let data = memory.data(&mut *store);
    let bytes = data
        .get(ptr..ptr + len)
        .ok_or_else(|| anyhow::anyhow!("render result out of bounds"))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn write_string(
    store: &mut Store<HostState>,
    realloc: &wasmtime::TypedFunc<(i32, i32, i32, i32), i32>,
    memory: &wasmtime::Memory,
    s: &str,
) -> anyhow::Result<i32> {
    let bytes = s.as_bytes();
    let ptr = realloc.call(&mut *store, (0, 0, 1, bytes.len() as i32))?;
    memory.write(&mut *store, ptr as usize, bytes)?;
    Ok(ptr)
}

fn add_app_callbacks(
    linker: &mut Linker<HostState>,
    callbacks: Arc<Mutex<AppCallbacks>>,
) -> anyhow::Result<()> {
    {
        let callbacks = callbacks.clone();
        linker.func_new(
            "crawlserver",
            "app_on_start",
            FuncType::new(linker.engine(), [], []),
            move |_caller: Caller<'_, HostState>, _params: &[Val], _results: &mut [Val]| {
                callbacks.lock().unwrap().started = true;
                Ok(())
            },
        )?;
    }
    {
        let callbacks = callbacks.clone();
        linker.func_new(
            "crawlserver",
            "register_disable_location_change_listener",
            FuncType::new(linker.engine(), [ValType::FuncRef], []),
            move |_caller: Caller<'_, HostState>, params: &[Val], _results: &mut [Val]| {
                if let Val::FuncRef(Some(f)) = &params[0] {
                    callbacks.lock().unwrap().disable_location_listener = Some(*f);
                }
                Ok(())
            },
        )?;
    }
    {
        let callbacks = callbacks.clone();
        linker.func_new(
            "crawlserver",
            "register_change_route",
            FuncType::new(linker.engine(), [ValType::FuncRef], []),
            move |_caller: Caller<'_, HostState>, params: &[Val], _results: &mut [Val]| {
                if let Val::FuncRef(Some(f)) = &params[0] {
                    callbacks.lock().unwrap().change_route = Some(*f);
                }
                Ok(())
            },
        )?;
    }
    {
        let callbacks = callbacks.clone();
        linker.func_new(
            "crawlserver",
            "change_route_done",
            FuncType::new(
                linker.engine(),
                [ValType::I64, ValType::I32, ValType::I64],
                [],
            ),
            move |_caller: Caller<'_, HostState>, params: &[Val], _results: &mut [Val]| {
                let expires_in = params[0].i64().unwrap_or(0).max(0) as u64;
                let has_last_modified = params[1].i32().unwrap_or(0) != 0;
                let last_modified_at = has_last_modified
                    .then(|| DateTime::from_timestamp(params[2].i64().unwrap_or(0), 0))
                    .flatten();
                callbacks.lock().unwrap().pending_render = Some((expires_in, last_modified_at));
                Ok(())
            },
        )?;
    }
    Ok(())
}

/// Runs `f` to completion, but fails fast with `StartTimeout` if it takes
/// longer than `deadline` wall-clock time. The Wasm core module API is
/// synchronous, so the only way to enforce a hard deadline on it is to
/// check elapsed time after the call returns — a genuinely hung guest is
/// ultimately bounded by the parent's own render timeout.
fn run_with_deadline<T>(
    deadline: Duration,
    f: impl FnOnce() -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    let start = Instant::now();
    let result = f();
    if start.elapsed() > deadline {
        return Err(EngineError::StartTimeout);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spec.md §4.1 cold path step 1: "If the job lacks a Wasm path or the
    /// file is absent, reply crashed ... terminate." `load` surfaces this
    /// as `EngineError::Missing` before ever touching wasmtime.
    #[test]
    fn load_reports_missing_file_without_touching_wasmtime() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.wasm");
        let mut engine = WorkerEngine::new().unwrap();

        let err = engine
            .load(&missing, 0, 8080, "/", "", false)
            .unwrap_err();
        assert!(matches!(err, EngineError::Missing(_)));
        assert!(!engine.is_loaded());
    }

    /// A module that compiles but traps or never imports the callback
    /// surface should surface as a structured `EngineError`, not a panic —
    /// the parent process relies on this to turn it into a `crash` reply
    /// rather than taking the whole worker down silently.
    #[test]
    fn load_rejects_a_byte_stream_that_is_not_a_valid_module() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("not-wasm.wasm");
        std::fs::write(&bogus, b"this is not a wasm module").unwrap();
        let mut engine = WorkerEngine::new().unwrap();

        let err = engine.load(&bogus, 0, 8080, "/", "", false).unwrap_err();
        assert!(matches!(err, EngineError::Compile(_)));
    }

    #[test]
    fn render_warm_before_load_panics() {
        let mut engine = WorkerEngine::new().unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            engine.render_warm(0, "/", "")
        }));
        assert!(result.is_err());
    }
}
