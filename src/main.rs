use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use modelgate::{config, default_state, install_panic_hook, logger, relay};

#[derive(Parser)]
#[command(name = "modelgate", version, about = "Multi-tenant LLM API gateway and relay")]
struct Cli {
    /// Port to listen on; overrides the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Directory for the SQLite database and persisted logs.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Path to the TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut cfg = config::init(cli.config.as_deref());
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(dir) = &cli.log_dir {
        cfg.data_dir = Some(dir.to_string_lossy().to_string());
    }
    config::install(cfg.clone());

    logger::init(cli.log_dir.as_deref());
    install_panic_hook();

    let state = match default_state(cli.log_dir.as_deref()) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("failed to open the data store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let app = relay::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    logger::info("app", &format!("modelgate listening on {}", addr));

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            logger::info("app", "shutdown signal received");
        })
        .await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logger::error("app", &format!("server error: {}", e));
            ExitCode::FAILURE
        }
    }
}
