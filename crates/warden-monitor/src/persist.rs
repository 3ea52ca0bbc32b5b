//! Background persistence and session reaping.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use warden_core::stats::{StatsError, StatsSnapshot};
use warden_core::SessionRegistry;

use crate::MonitorState;

/// Writes the current statistics snapshot to `path`, atomically.
pub(crate) fn flush(state: &MonitorState, path: &Path) -> Result<(), StatsError> {
    let snapshot = StatsSnapshot::new(
        state.registry.snapshot_stats(),
        state.started_at.elapsed(),
        state.connections.load(Ordering::Relaxed),
    );
    snapshot.save(path)?;
    debug!(path = %path.display(), "statistics saved");
    Ok(())
}

/// Spawns the periodic statistics flusher.
pub(crate) fn spawn_stats_flusher(
    state: MonitorState,
    path: PathBuf,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so the first real
        // flush happens one interval in.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = flush(&state, &path) {
                error!(path = %path.display(), error = %e, "statistics flush failed");
            }
        }
    })
}

/// Spawns the idle-session reaper. Eviction runs on its own schedule,
/// never synchronously with message traffic.
pub(crate) fn spawn_session_reaper(
    registry: SessionRegistry,
    idle_timeout: Duration,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.evict_idle(idle_timeout);
        }
    })
}
