//! Warden Monitor - network-facing safety monitor.
//!
//! Accepts persistent TCP connections speaking line-delimited JSON,
//! drives each turn through the core pipeline (evaluate, record,
//! decide, dispatch), and replies with the detections and the verdict.
//! Background tasks persist statistics on a fixed interval and reap
//! idle sessions.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use warden_core::{AlertDispatcher, DetectionEngine, PatternStore, Policy, SessionRegistry};
//! use warden_monitor::{MonitorConfig, MonitorServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Arc::new(DetectionEngine::new(Arc::new(PatternStore::new())));
//!     let dispatcher = Arc::new(AlertDispatcher::new(Policy::default()));
//!     let registry = SessionRegistry::new();
//!
//!     let server = MonitorServer::bind(MonitorConfig::default(), engine, dispatcher, registry)
//!         .await
//!         .unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

mod connection;
mod persist;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

use warden_core::config::{DEFAULT_HOST, DEFAULT_PORT};
use warden_core::{AlertDispatcher, DetectionEngine, SessionRegistry, WardenConfig};

/// Monitor server configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to (0 picks an ephemeral port).
    pub port: u16,
    /// Where statistics snapshots are written.
    pub stats_path: PathBuf,
    /// Interval between statistics flushes.
    pub stats_interval: Duration,
    /// How long a session may sit idle before eviction.
    pub idle_timeout: Duration,
    /// Interval between eviction sweeps.
    pub sweep_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            stats_path: PathBuf::from("./warden_stats.json"),
            stats_interval: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl MonitorConfig {
    /// Derives a monitor config from the shared configuration.
    pub fn from_warden(config: &WardenConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            stats_path: config.stats_path.clone(),
            stats_interval: Duration::from_secs(config.stats_interval_secs),
            idle_timeout: Duration::from_secs(config.session_idle_timeout_secs),
            sweep_interval: Duration::from_secs(config.eviction_sweep_secs),
        }
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Monitor server errors.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Failed to bind the listening endpoint. The only fatal error.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Listener I/O error.
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared per-server state handed to every connection task.
#[derive(Clone)]
pub(crate) struct MonitorState {
    pub(crate) engine: Arc<DetectionEngine>,
    pub(crate) dispatcher: Arc<AlertDispatcher>,
    pub(crate) registry: SessionRegistry,
    pub(crate) connections: Arc<AtomicUsize>,
    pub(crate) started_at: Instant,
}

/// The line-delimited JSON monitor server.
pub struct MonitorServer {
    listener: TcpListener,
    config: MonitorConfig,
    state: MonitorState,
}

impl MonitorServer {
    /// Binds the listening endpoint.
    ///
    /// A bind failure is fatal; everything after this point degrades
    /// per message, per rule, or per channel instead.
    pub async fn bind(
        config: MonitorConfig,
        engine: Arc<DetectionEngine>,
        dispatcher: Arc<AlertDispatcher>,
        registry: SessionRegistry,
    ) -> Result<Self, MonitorError> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| MonitorError::Bind { addr, source })?;

        Ok(Self {
            listener,
            config,
            state: MonitorState {
                engine,
                dispatcher,
                registry,
                connections: Arc::new(AtomicUsize::new(0)),
                started_at: Instant::now(),
            },
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, MonitorError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs until interrupted (Ctrl+C / SIGTERM), then flushes
    /// statistics one final time.
    pub async fn run(self) -> Result<(), MonitorError> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until the given future resolves, then flushes statistics
    /// one final time.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), MonitorError>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let addr = self.local_addr()?;
        info!(%addr, "monitor listening");

        let flusher = persist::spawn_stats_flusher(
            self.state.clone(),
            self.config.stats_path.clone(),
            self.config.stats_interval,
        );
        let reaper = persist::spawn_session_reaper(
            self.state.registry.clone(),
            self.config.idle_timeout,
            self.config.sweep_interval,
        );

        let mut connections = tokio::task::JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let state = self.state.clone();
                            connections.spawn(async move {
                                connection::handle_connection(stream, peer, state).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }
                // Reap finished connection tasks so the set stays small.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => {
                    info!("monitor shutting down");
                    break;
                }
            }
        }

        flusher.abort();
        reaper.abort();
        connections.shutdown().await;

        // Final flush so the last session contributions land on disk.
        if let Err(e) = persist::flush(&self.state, &self.config.stats_path) {
            error!(error = %e, "final statistics flush failed");
        }

        Ok(())
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("received terminate signal, initiating graceful shutdown");
        }
    }
}
