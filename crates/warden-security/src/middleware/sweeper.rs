//! Background eviction of idle rate limit entries

use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::rate_limit::ClientMap;
use crate::stats::SecurityStats;
use crate::{SecurityError, SecurityResult};

/// Remove every client that is unblocked and idle for longer than `idle`.
/// Returns the number of evicted entries.
pub(crate) fn sweep_clients(
    clients: &Mutex<ClientMap>,
    now: OffsetDateTime,
    idle: time::Duration,
) -> SecurityResult<usize> {
    let mut clients = clients.lock().map_err(|_| SecurityError::LockPoisoned)?;
    let before = clients.len();
    clients.retain(|_, state| !state.is_evictable_at(now, idle));
    Ok(before - clients.len())
}

/// Handle to the running sweeper task
#[derive(Debug)]
pub(crate) struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Spawn the sweeper on the current tokio runtime
    pub(crate) fn spawn(
        clients: Arc<Mutex<ClientMap>>,
        idle: time::Duration,
        interval: std::time::Duration,
        stats: Arc<SecurityStats>,
    ) -> SecurityResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            SecurityError::ConfigError {
                message: "rate limit sweeper requires a running tokio runtime".to_string(),
            }
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = runtime.spawn(run(clients, idle, interval, stats, shutdown_rx));

        Ok(Self {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Signal shutdown and wait until the task has exited
    pub(crate) async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Rate limit sweeper terminated abnormally: {}", e);
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        // Dropped without stop(): tell the task to exit on its next poll
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn run(
    clients: Arc<Mutex<ClientMap>>,
    idle: time::Duration,
    interval: std::time::Duration,
    stats: Arc<SecurityStats>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(interval_secs = interval.as_secs(), "Rate limit sweeper started");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                match sweep_clients(&clients, OffsetDateTime::now_utc(), idle) {
                    Ok(0) => {}
                    Ok(evicted) => {
                        stats.record_evictions(evicted);
                        tracing::debug!(evicted, "Evicted idle rate limit entries");
                    }
                    Err(e) => tracing::error!("Rate limit sweep failed: {}", e),
                }
            }
        }
    }

    tracing::debug!("Rate limit sweeper stopped");
}
