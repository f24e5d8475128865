//! Push channel for out-of-band balance changes.
//!
//! Every notification is treated as an authoritative replace of the settled balance,
//! never as a delta, so duplicated or reordered deliveries converge on the server's
//! latest view.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::domain::{Balance, Credits};

use super::StoreError;
use super::store::LedgerStore;

const CREDIT_BALANCE_UPDATED: &str = "credit_balance_updated";

/// Balance carried by a push notification: either the full balance object or only
/// the settled amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BalanceUpdate {
    Full(Balance),
    Available(Credits),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    CreditBalanceUpdated { balance: BalanceUpdate },
}

#[derive(Debug, Deserialize)]
struct EventName {
    event: String,
}

/// Decode one push message. Events this client does not handle decode to `None`.
pub fn parse_push_message(text: &str) -> Result<Option<PushEvent>, serde_json::Error> {
    let name: EventName = serde_json::from_str(text)?;
    if name.event != CREDIT_BALANCE_UPDATED {
        debug!(event = %name.event, "ignoring push event");
        return Ok(None);
    }
    serde_json::from_str(text).map(Some)
}

/// Counters reported when a subscription ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub applied: u64,
    pub rejected: u64,
}

/// Applies push events to a [`LedgerStore`].
#[derive(Debug, Clone)]
pub struct SyncChannel {
    store: Arc<LedgerStore>,
}

impl SyncChannel {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    /// Apply one event through the store's balance path.
    pub fn apply(&self, event: &PushEvent) -> Result<(), StoreError> {
        match event {
            PushEvent::CreditBalanceUpdated {
                balance: BalanceUpdate::Full(balance),
            } => self.store.set_balance(balance.clone()),
            PushEvent::CreditBalanceUpdated {
                balance: BalanceUpdate::Available(settled),
            } => self.store.update_balance(*settled),
        }
    }

    /// Consume `events` on a background task until the stream ends or the returned
    /// subscription is dropped or unsubscribed.
    pub fn subscribe<S>(&self, events: S) -> SyncSubscription
    where
        S: Stream<Item = PushEvent> + Send + Unpin + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let channel = self.clone();
        let mut events = events;

        let task = tokio::spawn(async move {
            let mut stats = SyncStats::default();
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    next = events.next() => {
                        let Some(event) = next else {
                            debug!("push stream ended");
                            break;
                        };
                        match channel.apply(&event) {
                            Ok(()) => stats.applied += 1,
                            Err(err) => {
                                stats.rejected += 1;
                                warn!(reason = %err, "push balance rejected");
                            }
                        }
                    }
                }
            }
            info!(applied = stats.applied, rejected = stats.rejected, "sync subscription closed");
            stats
        });

        SyncSubscription {
            shutdown: Some(shutdown_tx),
            task: Some(task),
            stats: SyncStats::default(),
        }
    }
}

/// Handle to a running subscription.
#[derive(Debug)]
pub struct SyncSubscription {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<SyncStats>>,
    stats: SyncStats,
}

impl SyncSubscription {
    /// Stop consuming events and wait for the task to finish.
    pub async fn unsubscribe(mut self) -> SyncStats {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.join().await
    }

    /// Wait for the stream to end on its own. Cancel safe: if this future is dropped
    /// the subscription keeps running and can still be unsubscribed.
    pub async fn finished(&mut self) -> SyncStats {
        self.join().await
    }

    async fn join(&mut self) -> SyncStats {
        if let Some(task) = self.task.as_mut() {
            self.stats = match task.await {
                Ok(stats) => stats,
                Err(err) => {
                    warn!(reason = %err, "sync task failed");
                    SyncStats::default()
                }
            };
            self.task = None;
        }
        self.stats
    }
}
