//! OpenRouter Proxy CLI - Serve the upstream API behind a rotating key pool.

use clap::{Parser, Subcommand};
use openrouter_proxy::config::{Config, LogFormat, ServerConfig};
use openrouter_proxy::proxy::{create_router, AppState};
use std::path::PathBuf;
use tokio::signal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "openrouter-proxy")]
#[command(about = "Reverse proxy that rotates upstream API keys around rate limits")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show current configuration (secrets masked)
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { port, config }) => {
            run_server(port, config).await?;
        }
        Some(Commands::Config { path }) => {
            show_config(path)?;
        }
        None => {
            // Default: run server
            run_server(None, None).await?;
        }
    }

    Ok(())
}

fn init_tracing(server: &ServerConfig) {
    // RUST_LOG wins over the configured levels
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,{}={},tower_http={}",
            env!("CARGO_CRATE_NAME"),
            server.log_level,
            server.http_log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    match server.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).init(),
    }
}

async fn run_server(port_override: Option<u16>, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    // Load config
    let config = match config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let mut config = config.with_env_overrides();
    if let Some(port) = port_override {
        config.server.port = port;
    }

    init_tracing(&config.server);
    config.validate()?;

    let state = AppState::from_config(&config)?;
    for key in state.pool.status() {
        tracing::info!("Loaded API key {} (available: {})", key.key, key.available);
    }
    tracing::info!(
        "Key pool ready: {} keys, strategy {}, cooldown {}s",
        state.pool.len(),
        state.pool.strategy(),
        config.keys.cooldown_secs
    );

    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("────────────────────────────────────────");
    println!("OpenRouter Proxy v{}", env!("CARGO_PKG_VERSION"));
    println!("────────────────────────────────────────");
    println!("Proxy:      http://{}/api/v1", addr);
    println!("Upstream:   {}", config.upstream.base_url);
    println!("Health:     http://{}/health", addr);
    if config.upstream.free_only {
        println!("Models:     free only");
    }
    println!("────────────────────────────────────────");

    tracing::info!("Proxy listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    println!("\nProxy stopped.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

fn show_config(show_path: bool) -> anyhow::Result<()> {
    if show_path {
        println!("{}", Config::default_path().display());
        return Ok(());
    }

    let config = Config::load()?.with_env_overrides();
    println!("{}", toml::to_string_pretty(&config.redacted())?);
    Ok(())
}
