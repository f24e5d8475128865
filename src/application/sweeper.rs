use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::domain::Credits;

use super::store::{LedgerStore, SweepOutcome};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically returns expired holds to the available balance.
///
/// A sweep releases every expired hold in one store mutation; a second sweep at the
/// same instant finds nothing. Holds with a confirm or cancel in flight are skipped.
#[derive(Debug, Clone)]
pub struct Sweeper {
    store: Arc<LedgerStore>,
    period: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<LedgerStore>, period: Duration) -> Self {
        Self {
            store,
            period: period.max(Duration::from_millis(1)),
        }
    }

    /// Run a single sweep at the current time.
    pub fn sweep_once(&self) -> SweepOutcome {
        let outcome = self.store.sweep_expired(Utc::now());
        if !outcome.released.is_empty() {
            info!(
                released = outcome.released.len(),
                restored = outcome.restored,
                "expired reservations released"
            );
        }
        outcome
    }

    /// Start sweeping on a background task. The first sweep runs immediately.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut restored: Credits = 0;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        restored += self.sweep_once().restored;
                    }
                }
            }
            debug!(restored, "sweeper stopped");
            restored
        });

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running [`Sweeper`].
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Credits>,
}

impl SweeperHandle {
    /// Stop the sweeper and return the credits it restored over its lifetime.
    pub async fn shutdown(mut self) -> Credits {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match (&mut self.task).await {
            Ok(restored) => restored,
            Err(err) => {
                warn!(reason = %err, "sweeper task failed");
                0
            }
        }
    }
}
