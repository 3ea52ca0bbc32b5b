//! Warden - real-time safety monitor for LLM conversations.
//!
//! This binary runs the network monitor: it loads the configuration
//! and detection rules, wires up the core pipeline, and serves the
//! line-delimited JSON protocol until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warden_core::dispatch::{AlertCounters, AlertLog};
use warden_core::{
    AlertDispatcher, DetectionEngine, PatternStore, SessionRegistry, WardenConfig,
};
use warden_monitor::{MonitorConfig, MonitorServer};

/// Warden - real-time safety monitor for LLM conversations
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
struct Args {
    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Directory of rule files (overrides config)
    #[arg(long)]
    patterns: Option<PathBuf>,

    /// Statistics snapshot path (overrides config)
    #[arg(long)]
    stats_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "warden", "Warden").map(|dirs| dirs.data_dir().join("logs"))
}

/// Get the default configuration file path.
fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "warden", "Warden").map(|dirs| dirs.config_dir().join("warden.json"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warden={log_level},warn")));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("warden")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only.
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    tracing::warn!("file logging unavailable, using console only");
    None
}

/// Loads the configuration and applies command-line overrides.
fn load_config(args: &Args) -> WardenConfig {
    let mut config = match args.config.clone().or_else(default_config_path) {
        Some(path) => WardenConfig::load(&path),
        None => WardenConfig::default(),
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(patterns) = &args.patterns {
        config.patterns_path = patterns.clone();
    }
    if let Some(stats_file) = &args.stats_file {
        config.stats_path = stats_file.clone();
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    let config = load_config(&args);

    let store = PatternStore::load_dir(&config.patterns_path);
    if store.is_empty() {
        tracing::warn!(
            path = %config.patterns_path.display(),
            "no detection rules loaded, every turn will be allowed"
        );
    }

    let engine = Arc::new(
        DetectionEngine::new(Arc::new(store))
            .with_safeguards(config.active_safeguards.clone()),
    );
    let dispatcher = Arc::new(
        AlertDispatcher::new(config.policy())
            .with_channel(Arc::new(AlertLog::new(&config.alert_log_path)))
            .with_channel(Arc::new(AlertCounters::new())),
    );
    let registry = SessionRegistry::new();

    let server = MonitorServer::bind(
        MonitorConfig::from_warden(&config),
        engine,
        dispatcher,
        registry,
    )
    .await
    .context("failed to start monitor")?;

    server.run().await.context("monitor terminated abnormally")?;
    Ok(())
}
