//! Client-side ledger state.
//!
//! One `LedgerStore` exists per authenticated session. Every mutation goes through the
//! primitives below, each of which runs under a single lock and either applies fully
//! or not at all. After each mutation a [`LedgerSnapshot`] is published on a watch
//! channel, so readers never take the mutation lock.
//!
//! Invariant after every operation:
//! `available + Σ held == settled balance + Σ pending optimistic deltas`, and `available >= 0`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{
    Balance, CreditTransaction, Credits, ExpiringCredits, Reservation, ReservationId,
};

use super::StoreError;

/// Number of recent transactions kept for display.
pub const DEFAULT_TRANSACTION_WINDOW: usize = 50;

/// Token returned by [`LedgerStore::optimistic_adjust`]. It captures the snapshot taken
/// before the tentative change so the change can be compensated exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    id: u64,
    previous_available: Credits,
    applied: Credits,
    version: u64,
}

impl Adjustment {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn previous_available(&self) -> Credits {
        self.previous_available
    }

    /// Delta actually applied, after the zero floor.
    pub fn applied(&self) -> Credits {
        self.applied
    }
}

/// Reservations released by a sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub released: Vec<Reservation>,
    pub restored: Credits,
}

/// Read-only view of the ledger, published after every mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    /// Spendable now: settled balance minus holds, plus tentative adjustments
    pub available: Credits,
    pub held: Credits,
    /// Sum of optimistic deltas not yet confirmed or rolled back
    pub pending: Credits,
    pub lifetime: Credits,
    pub expiring: Vec<ExpiringCredits>,
    /// Active holds, soonest expiry first
    pub reservations: Vec<Reservation>,
    /// Most recent first
    pub transactions: Vec<CreditTransaction>,
    pub updating: bool,
    pub synced_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl LedgerSnapshot {
    /// Settled balance as last confirmed by the server.
    pub fn balance(&self) -> Balance {
        Balance {
            available: self.available + self.held - self.pending,
            lifetime: self.lifetime,
            expiring: self.expiring.clone(),
        }
    }
}

#[derive(Debug)]
struct Hold {
    reservation: Reservation,
    /// A confirm or cancel is in flight; sweeps must leave it alone
    claimed: bool,
}

#[derive(Debug, Default)]
struct LedgerState {
    available: Credits,
    lifetime: Credits,
    expiring: Vec<ExpiringCredits>,
    holds: HashMap<ReservationId, Hold>,
    transactions: VecDeque<CreditTransaction>,
    pending: HashMap<u64, Credits>,
    next_adjustment: u64,
    version: u64,
    synced_at: Option<DateTime<Utc>>,
}

impl LedgerState {
    fn held(&self) -> Credits {
        self.holds.values().map(|h| h.reservation.amount).sum()
    }

    fn pending_total(&self) -> Credits {
        self.pending.values().sum()
    }

    /// Spendable credits implied by a settled balance under the current holds and pending deltas.
    fn available_for(&self, settled: Credits, held: Credits) -> Result<Credits, StoreError> {
        let available = settled - held + self.pending_total();
        if available < 0 {
            return Err(StoreError::HoldsExceedBalance {
                balance: settled,
                held,
            });
        }
        Ok(available)
    }

    fn to_snapshot(&self) -> LedgerSnapshot {
        let mut reservations: Vec<Reservation> =
            self.holds.values().map(|h| h.reservation.clone()).collect();
        reservations.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.id.cmp(&b.id)));

        LedgerSnapshot {
            available: self.available,
            held: self.held(),
            pending: self.pending_total(),
            lifetime: self.lifetime,
            expiring: self.expiring.clone(),
            reservations,
            transactions: self.transactions.iter().cloned().collect(),
            updating: !self.pending.is_empty() || self.holds.values().any(|h| h.claimed),
            synced_at: self.synced_at,
            version: self.version,
        }
    }
}

#[derive(Debug)]
pub struct LedgerStore {
    state: Mutex<LedgerState>,
    notifier: watch::Sender<LedgerSnapshot>,
    window: usize,
}

impl LedgerStore {
    pub fn new(window: usize) -> Self {
        let (notifier, _) = watch::channel(LedgerSnapshot::default());
        Self {
            state: Mutex::new(LedgerState::default()),
            notifier,
            window: window.max(1),
        }
    }

    /// Start a session from a previously persisted balance. Nothing is marked as synced.
    pub fn hydrated(balance: Balance, window: usize) -> Self {
        let store = Self::new(window);
        {
            let mut state = store.lock();
            state.available = balance.available.max(0);
            state.lifetime = balance.lifetime;
            state.expiring = balance.expiring;
            store.publish(&mut state);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &mut LedgerState) {
        debug_assert!(state.available >= 0, "available went negative");
        state.version += 1;
        self.notifier.send_replace(state.to_snapshot());
    }

    // ========================
    // Readers
    // ========================

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.notifier.borrow().clone()
    }

    /// Receive a new snapshot after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<LedgerSnapshot> {
        self.notifier.subscribe()
    }

    pub fn available(&self) -> Credits {
        self.notifier.borrow().available
    }

    pub fn is_synced(&self) -> bool {
        self.notifier.borrow().synced_at.is_some()
    }

    pub fn reservation(&self, id: &str) -> Option<Reservation> {
        self.notifier
            .borrow()
            .reservations
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    // ========================
    // Balance
    // ========================

    /// Replace the balance wholesale with a server-confirmed one.
    ///
    /// Rejected, leaving the state unchanged, if the balance cannot cover active holds.
    pub fn set_balance(&self, balance: Balance) -> Result<(), StoreError> {
        let mut state = self.lock();
        let available = state.available_for(balance.available, state.held())?;

        state.available = available;
        state.lifetime = balance.lifetime;
        state.expiring = balance.expiring;
        state.synced_at = Some(Utc::now());
        self.publish(&mut state);
        debug!(available, lifetime = state.lifetime, "balance replaced");
        Ok(())
    }

    /// Update only the settled amount, keeping lifetime and expiring credits.
    pub fn update_balance(&self, settled: Credits) -> Result<(), StoreError> {
        let mut state = self.lock();
        let available = state.available_for(settled, state.held())?;

        state.available = available;
        state.synced_at = Some(Utc::now());
        self.publish(&mut state);
        debug!(available, "balance updated");
        Ok(())
    }

    /// Apply a completed purchase: new settled balance, lifetime growth and its transaction.
    pub fn record_purchase(
        &self,
        settled: Credits,
        credits_added: Credits,
        tx: CreditTransaction,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let available = state.available_for(settled, state.held())?;

        state.available = available;
        state.lifetime += credits_added;
        state.synced_at = Some(Utc::now());
        self.push_transaction(&mut state, tx);
        self.publish(&mut state);
        Ok(())
    }

    // ========================
    // Optimistic updates
    // ========================

    /// Apply a tentative delta to the available balance, floored at zero.
    pub fn optimistic_adjust(&self, delta: Credits) -> Adjustment {
        let mut state = self.lock();
        let previous_available = state.available;
        let target = previous_available + delta;
        if target < 0 {
            warn!(
                available = previous_available,
                delta, "optimistic adjustment floored at zero"
            );
        }
        let applied = target.max(0) - previous_available;

        state.next_adjustment += 1;
        let id = state.next_adjustment;
        state.available += applied;
        state.pending.insert(id, applied);
        self.publish(&mut state);

        Adjustment {
            id,
            previous_available,
            applied,
            version: state.version,
        }
    }

    /// Undo a tentative adjustment after its remote call failed.
    ///
    /// Restores the captured snapshot when nothing else touched the store meanwhile,
    /// otherwise compensates exactly the applied delta. Rolling back an adjustment that
    /// was already settled or rolled back is an error and changes nothing.
    pub fn rollback(&self, adjustment: &Adjustment) -> Result<(), StoreError> {
        let mut state = self.lock();
        if !state.pending.contains_key(&adjustment.id) {
            return Err(StoreError::AdjustmentSettled(adjustment.id));
        }

        let restored = if state.version == adjustment.version {
            adjustment.previous_available
        } else {
            state.available - adjustment.applied
        };
        if restored < 0 {
            return Err(StoreError::HoldsExceedBalance {
                balance: state.available,
                held: state.held(),
            });
        }

        state.pending.remove(&adjustment.id);
        state.available = restored;
        self.publish(&mut state);
        debug!(adjustment = adjustment.id, available = restored, "adjustment rolled back");
        Ok(())
    }

    /// Confirm a tentative adjustment with the server's resulting settled balance.
    ///
    /// Responses can arrive in a different order than the server applied them, so the
    /// settled balance may only lower available, never raise it above local accounting.
    pub fn settle_adjustment(
        &self,
        adjustment: &Adjustment,
        settled: Credits,
        tx: Option<CreditTransaction>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let Some(applied) = state.pending.remove(&adjustment.id) else {
            return Err(StoreError::AdjustmentSettled(adjustment.id));
        };

        let available = match state.available_for(settled, state.held()) {
            Ok(available) => available,
            Err(err) => {
                state.pending.insert(adjustment.id, applied);
                return Err(err);
            }
        };

        // a settled balance from an earlier server state must not hand back spent credits
        state.available = available.min(state.available);
        state.synced_at = Some(Utc::now());
        if let Some(tx) = tx {
            self.push_transaction(&mut state, tx);
        }
        self.publish(&mut state);
        Ok(())
    }

    /// Keep a tentative adjustment as applied without a usable settled balance.
    ///
    /// Used when the server confirmed the change but its reported balance cannot be
    /// reconciled with local holds; the caller re-syncs afterwards.
    pub fn commit_adjustment(
        &self,
        adjustment: &Adjustment,
        tx: Option<CreditTransaction>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.pending.remove(&adjustment.id).is_none() {
            return Err(StoreError::AdjustmentSettled(adjustment.id));
        }
        if let Some(tx) = tx {
            self.push_transaction(&mut state, tx);
        }
        self.publish(&mut state);
        debug!(adjustment = adjustment.id, available = state.available, "adjustment committed");
        Ok(())
    }

    // ========================
    // Reservations
    // ========================

    /// Hold credits: decrements available and records the reservation in one step.
    pub fn add_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        let mut state = self.lock();
        if reservation.amount <= 0 {
            return Err(StoreError::InvalidAmount(reservation.amount));
        }
        if state.holds.contains_key(&reservation.id) {
            return Err(StoreError::DuplicateReservation(reservation.id));
        }
        if state.available < reservation.amount {
            return Err(StoreError::InsufficientCredits {
                available: state.available,
                requested: reservation.amount,
            });
        }

        state.available -= reservation.amount;
        info!(
            reservation = %reservation.id,
            amount = reservation.amount,
            service_id = %reservation.service_id,
            expires_at = %reservation.expires_at,
            "credits reserved"
        );
        state.holds.insert(
            reservation.id.clone(),
            Hold {
                reservation,
                claimed: false,
            },
        );
        self.publish(&mut state);
        Ok(())
    }

    /// Take the exclusive right to terminate a hold (test-and-set).
    ///
    /// Fails with `ReservationNotFound` if the hold is gone or another termination is in
    /// flight. An expired hold is released on the spot and reported as expired.
    pub fn claim_reservation(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        let mut state = self.lock();
        let (expired, claimed) = match state.holds.get(id) {
            None => return Err(StoreError::ReservationNotFound(id.to_string())),
            Some(hold) => (hold.reservation.is_expired(now), hold.claimed),
        };
        if claimed {
            return Err(StoreError::ReservationNotFound(id.to_string()));
        }

        if expired {
            if let Some(hold) = state.holds.remove(id) {
                state.available += hold.reservation.amount;
                info!(
                    reservation = %id,
                    amount = hold.reservation.amount,
                    "expired reservation released on claim"
                );
            }
            self.publish(&mut state);
            return Err(StoreError::ReservationExpired(id.to_string()));
        }

        let reservation = match state.holds.get_mut(id) {
            Some(hold) => {
                hold.claimed = true;
                hold.reservation.clone()
            }
            None => return Err(StoreError::ReservationNotFound(id.to_string())),
        };
        self.publish(&mut state);
        Ok(reservation)
    }

    /// Give a claimed hold back after the terminating remote call failed.
    pub fn unclaim_reservation(&self, id: &str) {
        let mut state = self.lock();
        if let Some(hold) = state.holds.get_mut(id) {
            hold.claimed = false;
            self.publish(&mut state);
        }
    }

    /// Remove a hold and restore its amount to available (test-and-delete).
    pub fn release_reservation(&self, id: &str) -> Result<Reservation, StoreError> {
        let mut state = self.lock();
        let hold = state
            .holds
            .remove(id)
            .ok_or_else(|| StoreError::ReservationNotFound(id.to_string()))?;

        state.available += hold.reservation.amount;
        self.publish(&mut state);
        info!(reservation = %id, amount = hold.reservation.amount, "reservation released");
        Ok(hold.reservation)
    }

    /// Turn a hold into a deduction: the hold is consumed, the balance becomes the
    /// server's settled balance and the deduction is recorded.
    pub fn settle_reservation(
        &self,
        id: &str,
        settled: Credits,
        tx: Option<CreditTransaction>,
    ) -> Result<Reservation, StoreError> {
        let mut state = self.lock();
        let amount = state
            .holds
            .get(id)
            .map(|hold| hold.reservation.amount)
            .ok_or_else(|| StoreError::ReservationNotFound(id.to_string()))?;
        let available = state.available_for(settled, state.held() - amount)?;

        let hold = state
            .holds
            .remove(id)
            .ok_or_else(|| StoreError::ReservationNotFound(id.to_string()))?;
        state.available = available.min(state.available);
        state.synced_at = Some(Utc::now());
        if let Some(tx) = tx {
            self.push_transaction(&mut state, tx);
        }
        self.publish(&mut state);
        info!(reservation = %id, amount, available = state.available, "reservation confirmed");
        Ok(hold.reservation)
    }

    /// Drop a hold the server has already charged, leaving its amount spent.
    pub fn consume_reservation(
        &self,
        id: &str,
        tx: Option<CreditTransaction>,
    ) -> Result<Reservation, StoreError> {
        let mut state = self.lock();
        let hold = state
            .holds
            .remove(id)
            .ok_or_else(|| StoreError::ReservationNotFound(id.to_string()))?;
        if let Some(tx) = tx {
            self.push_transaction(&mut state, tx);
        }
        self.publish(&mut state);
        info!(reservation = %id, amount = hold.reservation.amount, "reservation consumed");
        Ok(hold.reservation)
    }

    /// Release every unclaimed hold whose expiry is at or before `now`, in one pass.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> SweepOutcome {
        let mut state = self.lock();
        let expired: Vec<ReservationId> = state
            .holds
            .iter()
            .filter(|(_, hold)| !hold.claimed && hold.reservation.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return SweepOutcome::default();
        }

        let released: Vec<Reservation> = expired
            .iter()
            .filter_map(|id| state.holds.remove(id))
            .map(|hold| hold.reservation)
            .collect();
        let restored: Credits = released.iter().map(|r| r.amount).sum();
        state.available += restored;
        self.publish(&mut state);

        SweepOutcome { released, restored }
    }

    // ========================
    // Transactions
    // ========================

    /// Prepend a transaction to the bounded recent window.
    pub fn record_transaction(&self, tx: CreditTransaction) {
        let mut state = self.lock();
        self.push_transaction(&mut state, tx);
        self.publish(&mut state);
    }

    /// Replace the recent window with a page fetched from the server (most recent first).
    pub fn replace_transactions(&self, transactions: Vec<CreditTransaction>) {
        let mut state = self.lock();
        state.transactions = transactions.into_iter().take(self.window).collect();
        self.publish(&mut state);
    }

    fn push_transaction(&self, state: &mut LedgerState, tx: CreditTransaction) {
        state.transactions.push_front(tx);
        state.transactions.truncate(self.window);
    }
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSACTION_WINDOW)
    }
}
