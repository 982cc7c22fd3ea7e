use clap::Parser;
use crawlserver::args::CliArgs;
use crawlserver::config::{self, Config};
use crawlserver::context::AppContext;
use tracing_subscriber::EnvFilter;

fn main() {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if args.debug { "debug" } else { "info" })),
        )
        .init();

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(err.exit_code());
        }
    };

    let worker_binary = match worker_binary_path() {
        Ok(path) => path,
        Err(err) => {
            eprintln!("could not locate the crawlserver-worker binary: {err}");
            std::process::exit(config::EXIT_OTHER);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    runtime.block_on(async move {
        let ctx = AppContext::new();

        let kill_ctx = ctx.clone();
        ctrlc::set_handler(move || kill_ctx.kill()).expect("failed to install ctrl-c handler");

        if let Err(err) = crawlserver::run(config, worker_binary, ctx).await {
            match err {
                crawlserver::RunError::Listener(io_err) => {
                    eprintln!("failed to bind listener: {io_err}");
                    std::process::exit(config::EXIT_LISTENER_FAILED);
                }
                crawlserver::RunError::Other(err) => {
                    eprintln!("server error: {err:#}");
                    std::process::exit(config::EXIT_OTHER);
                }
            }
        }
    });
}

/// The worker binary is expected to live alongside this one, the way cargo
/// places every workspace `[[bin]]` target in the same `target/<profile>`
/// directory.
fn worker_binary_path() -> std::io::Result<std::path::PathBuf> {
    let mut path = std::env::current_exe()?;
    path.pop();
    path.push(if cfg!(windows) {
        "crawlserver-worker.exe"
    } else {
        "crawlserver-worker"
    });
    Ok(path)
}
