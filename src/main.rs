use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use feedmill::api;
use feedmill::app::App;
use feedmill::config::{Config, ConfigError, DispatchMode};

/// Get the config directory path (~/.config/feedmill/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedmill"))
}

#[derive(Parser, Debug)]
#[command(name = "feedmill", version, about = "Feed ingestion and article enrichment pipeline")]
struct Args {
    /// Config file (default: ~/.config/feedmill/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register publishers from an OPML outline (file, URL, or the configured URL)
    ImportOpml {
        #[arg(long, value_name = "FILE", conflicts_with = "url")]
        file: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
    },
    /// Remove publishers whose feed cannot be fetched
    Prune,
    /// Fetch every publisher's feed and dispatch new articles
    Collect {
        /// Store and enrich inline instead of queueing chunk jobs
        #[arg(long)]
        sequential: bool,
    },
    /// Consume queued chunk jobs
    Work {
        /// Exit once the queue is empty instead of waiting for Ctrl-C
        #[arg(long)]
        drain: bool,
    },
    /// Enrich every stored article not yet attempted
    Enrich,
    /// Remove all jobs from the queue
    Flush,
    /// Print queue and store counts
    Status,
    /// Import the configured outline, prune, then collect
    Update,
    /// Serve the HTTP trigger routes and run the worker pool
    Serve {
        /// Listen address (overrides `listen_addr`)
        #[arg(long)]
        listen: Option<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let path = match path {
        Some(path) => path,
        None => get_config_dir()?.join("config.toml"),
    };
    let config = Config::load(&path)
        .with_context(|| format!("Failed to load config from '{}'", path.display()))?;
    Ok(config.apply_env())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }
    tracing::info!("Shutdown requested");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feedmill=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config)?;

    let app = match App::open(config).await {
        Ok(app) => Arc::new(app),
        Err(e) => {
            if let Some(ConfigError::StoreUnreachable { path, reason }) = e.downcast_ref::<ConfigError>() {
                eprintln!("Error: item store unreachable at '{path}': {reason}");
                eprintln!("Check `database_path` in the config file or the FEEDMILL_DATABASE variable.");
                std::process::exit(1);
            }
            return Err(e);
        }
    };

    match args.command {
        Command::ImportOpml { file, url } => {
            let report = match file {
                Some(file) => {
                    // SEC-008: Canonicalize to resolve symlinks and prevent path traversal
                    let canonical = file
                        .canonicalize()
                        .with_context(|| format!("Failed to resolve outline file: {}", file.display()))?;
                    if !std::fs::metadata(&canonical)?.is_file() {
                        anyhow::bail!("Outline path must be a regular file");
                    }
                    let content = std::fs::read_to_string(&canonical).with_context(|| {
                        format!("Failed to read outline file: {}", canonical.display())
                    })?;
                    app.ingest_outline_document(&content).await
                }
                None => app.ingest_outline_url(url.as_deref()).await,
            };
            print_json(&report)?;
        }
        Command::Prune => print_json(&app.prune_publishers().await?)?,
        Command::Collect { sequential } => {
            let mode = sequential.then_some(DispatchMode::Sequential);
            print_json(&app.collect(mode).await?)?;
        }
        Command::Work { drain } => {
            let pool = app.worker_pool();
            let report = if drain {
                pool.drain().await
            } else {
                let cancel = CancellationToken::new();
                tokio::spawn(shutdown_signal(cancel.clone()));
                pool.run(cancel).await
            };
            print_json(&report)?;
        }
        Command::Enrich => print_json(&app.enrich_backlog().await?)?,
        Command::Flush => {
            let removed = app.flush_queue().await?;
            println!("Removed {removed} jobs");
        }
        Command::Status => print_json(&app.status().await?)?,
        Command::Update => print_json(&app.update().await?)?,
        Command::Serve { listen } => {
            let addr = listen.unwrap_or_else(|| app.config().listen_addr.clone());
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            tracing::info!(addr = %addr, "Listening");

            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_signal(cancel.clone()));

            let pool = app.worker_pool();
            let workers = tokio::spawn({
                let cancel = cancel.clone();
                async move { pool.run(cancel).await }
            });

            let router = api::build_router(Arc::clone(&app));
            axum::serve(listener, router)
                .with_graceful_shutdown(cancel.clone().cancelled_owned())
                .await
                .context("HTTP server failed")?;

            cancel.cancel();
            match workers.await {
                Ok(report) => tracing::info!(
                    jobs_completed = report.jobs_completed,
                    saved = report.saved,
                    "Worker pool drained"
                ),
                Err(e) => tracing::error!(error = %e, "Worker pool task failed"),
            }
        }
    }

    Ok(())
}
