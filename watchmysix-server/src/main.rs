use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use watchmysix_core::{ReconEngine, ToolCatalog};
use watchmysix_server::{
    AppState,
    infra::config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions},
    routes,
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "watchmysix-server")]
#[command(about = "Recon job orchestration: queue tool runs, stream their logs, collect results")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to a TOML configuration file
    #[arg(long, env = "WATCHMYSIX_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Data root for job working directories (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of jobs allowed to run at once (overrides config)
    #[arg(long)]
    max_concurrency: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the tool catalog with executable availability and exit
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Tools) => print_tools(&cli.serve),
        None => run_server(cli.serve).await,
    }
}

fn load_config(args: &ServeArgs) -> anyhow::Result<ConfigLoad> {
    let mut load = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    let config = &mut load.config;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }
    if let Some(data_dir) = args.data_dir.clone() {
        config.engine.data_dir = data_dir;
    }
    if let Some(max_concurrency) = args.max_concurrency {
        anyhow::ensure!(max_concurrency > 0, "--max-concurrency must be at least 1");
        config.engine.max_concurrency = max_concurrency;
    }
    Ok(load)
}

fn build_catalog(config: &Config) -> ToolCatalog {
    let mut catalog = ToolCatalog::builtin();
    for key in config.tools.apply(&mut catalog) {
        warn!(tool = %key, "executable override does not match any tool");
    }
    catalog
}

fn print_tools(args: &ServeArgs) -> anyhow::Result<()> {
    let ConfigLoad { config, .. } = load_config(args)?;
    let catalog = build_catalog(&config);

    println!("{:<20} {:<10} {:<40} DESCRIPTION", "TOOL", "STATUS", "EXECUTABLE");
    for tool in catalog.availability() {
        let status = if tool.available { "ok" } else { "missing" };
        let executable = match (&tool.resolved_path, &tool.program) {
            (Some(path), _) => path.display().to_string(),
            (None, Some(program)) => program.clone(),
            (None, None) => "(built in)".to_string(),
        };
        println!(
            "{:<20} {:<10} {:<40} {}",
            tool.id, status, executable, tool.description
        );
    }
    Ok(())
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let ConfigLoad { config, warnings } = load_config(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "loaded configuration file");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    let addr = config
        .server
        .socket_addr()
        .with_context(|| format!("invalid server host '{}'", config.server.host))?;
    std::fs::create_dir_all(&config.engine.data_dir).with_context(|| {
        format!(
            "failed to create data directory {}",
            config.engine.data_dir.display()
        )
    })?;

    let catalog = build_catalog(&config);
    let missing: Vec<String> = catalog
        .availability()
        .into_iter()
        .filter(|tool| !tool.available)
        .map(|tool| tool.id)
        .collect();
    if !missing.is_empty() {
        warn!(tools = %missing.join(","), "some tool executables are not on PATH; their steps will fail");
    }

    let engine = ReconEngine::start(config.engine_settings(), catalog)
        .await
        .context("failed to start recon engine")?;

    let config = Arc::new(config);
    let state = AppState::new(Arc::clone(&engine), Arc::clone(&config));
    let streams_shutdown = state.shutdown.clone();
    let router = routes::create_app(state);

    info!(
        "Starting WatchMySix API on {}:{}",
        config.server.host, config.server.port
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            streams_shutdown.cancel();
        })
        .await
        .context("server error")?;

    engine.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}
