use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::domain::{
    CreditPackage, CreditTransaction, Credits, PricingCalculator, PricingRequest, PricingResult,
    Reservation, ReservationId, TransactionFilter, TransactionId, TransactionType,
    default_packages, default_reservation_ttl, find_package,
};
use crate::remote::{
    DeductRequest, DynCreditsApi, PurchaseRequest, RemoteError, ReserveRequest,
};
use crate::storage::Repository;

use super::store::{LedgerSnapshot, LedgerStore};
use super::{LedgerError, Operation};

/// Application service for credit spending.
///
/// The only component that calls the remote ledger and the only one that turns a
/// price into an actual spend. Every remote wrapper follows the same shape: validate
/// locally, call the server, then mutate the store on success or leave it untouched
/// (rolling back any optimistic change) on failure.
pub struct LedgerService {
    api: DynCreditsApi,
    store: Arc<LedgerStore>,
    repo: Option<Repository>,
    pricing: PricingCalculator,
    packages: Vec<CreditPackage>,
    reservation_ttl: Duration,
}

/// A request to spend credits immediately
#[derive(Debug, Clone)]
pub struct DeductionRequest {
    pub amount: Credits,
    pub description: String,
    pub service_id: String,
    pub service_type: String,
}

/// Result of a completed spend (direct deduction or confirmed reservation)
#[derive(Debug, Clone)]
pub struct SpendReceipt {
    pub transaction_id: TransactionId,
    pub amount: Credits,
    /// Settled balance reported by the server
    pub new_balance: Credits,
    /// Spendable credits after the spend, net of other holds
    pub available: Credits,
}

/// Result of a completed purchase
#[derive(Debug, Clone)]
pub struct PurchaseReceipt {
    pub package: CreditPackage,
    pub credits_added: Credits,
    pub new_balance: Credits,
    pub transaction_id: TransactionId,
}

impl LedgerService {
    /// Create a service over a fresh, empty store.
    pub fn new(api: DynCreditsApi) -> Self {
        Self::with_store(api, Arc::new(LedgerStore::default()))
    }

    /// Create a service over an existing store.
    pub fn with_store(api: DynCreditsApi, store: Arc<LedgerStore>) -> Self {
        Self {
            api,
            store,
            repo: None,
            pricing: PricingCalculator::default(),
            packages: default_packages(),
            reservation_ttl: default_reservation_ttl(),
        }
    }

    /// Start a session backed by a persisted balance: the store is hydrated from the
    /// repository and every confirmed balance change is written back.
    pub async fn open(
        api: DynCreditsApi,
        repo: Repository,
        window: usize,
    ) -> Result<Self, LedgerError> {
        let store = match repo.load_balance().await? {
            Some(stored) => {
                debug!(
                    available = stored.balance.available,
                    updated_at = %stored.updated_at,
                    "hydrating from persisted balance"
                );
                LedgerStore::hydrated(stored.balance, window)
            }
            None => LedgerStore::new(window),
        };

        let mut service = Self::with_store(api, Arc::new(store));
        service.repo = Some(repo);
        Ok(service)
    }

    pub fn with_pricing(mut self, pricing: PricingCalculator) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    pub fn with_packages(mut self, packages: Vec<CreditPackage>) -> Self {
        self.packages = packages;
        self
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn packages(&self) -> &[CreditPackage] {
        &self.packages
    }

    /// End the session: persist the final balance, or forget it entirely.
    pub async fn close(self, forget: bool) -> Result<LedgerSnapshot, LedgerError> {
        let snapshot = self.store.snapshot();
        if let Some(repo) = &self.repo {
            if forget {
                repo.clear_balance().await?;
            } else if snapshot.synced_at.is_some() {
                repo.save_balance(&snapshot.balance()).await?;
            }
        }
        Ok(snapshot)
    }

    // ========================
    // Balance
    // ========================

    /// Return the cached balance, fetching it first if the session never synced or
    /// `force_refresh` is set.
    pub async fn get_balance(&self, force_refresh: bool) -> Result<LedgerSnapshot, LedgerError> {
        if !force_refresh && self.store.is_synced() {
            return Ok(self.store.snapshot());
        }

        let balance = self
            .api
            .fetch_balance()
            .await
            .map_err(|err| self.remote_failure(Operation::FetchBalance, String::new(), err, None))?;
        self.store.set_balance(balance)?;
        self.persist().await;
        Ok(self.store.snapshot())
    }

    pub async fn refresh_balance(&self) -> Result<LedgerSnapshot, LedgerError> {
        self.get_balance(true).await
    }

    /// Advisory check against the freshest available balance.
    ///
    /// Prefers a live fetch; if that fails the last cached value is used instead of
    /// failing the caller.
    pub async fn check_sufficient_credits(&self, amount: Credits) -> bool {
        let available = match self.refresh_balance().await {
            Ok(snapshot) => snapshot.available,
            Err(err) => {
                let cached = self.store.available();
                warn!(reason = %err, cached, "balance refresh failed, using cached balance");
                cached
            }
        };
        available >= amount
    }

    // ========================
    // Transactions
    // ========================

    /// Fetch transaction history from the server. An unfiltered first page also
    /// refreshes the store's recent window.
    pub async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        let transactions = self.api.list_transactions(filter).await.map_err(|err| {
            self.remote_failure(Operation::ListTransactions, String::new(), err, None)
        })?;

        if filter.is_recent_window() {
            self.store.replace_transactions(transactions.clone());
        }
        Ok(transactions)
    }

    pub fn recent_transactions(&self) -> Vec<CreditTransaction> {
        self.store.snapshot().transactions
    }

    // ========================
    // Purchase and deduction
    // ========================

    /// Buy a credit package. No optimistic update: the store only changes once the
    /// server confirms.
    pub async fn purchase_credits(
        &self,
        package_id: &str,
        payment_method_id: &str,
    ) -> Result<PurchaseReceipt, LedgerError> {
        let package = find_package(&self.packages, package_id)
            .cloned()
            .ok_or_else(|| LedgerError::Validation(format!("unknown package '{}'", package_id)))?;
        if payment_method_id.trim().is_empty() {
            return Err(LedgerError::Validation(
                "payment method is required".to_string(),
            ));
        }

        let request = PurchaseRequest {
            package_id: package.id.clone(),
            payment_method_id: payment_method_id.to_string(),
        };
        let response = self.api.purchase(&request).await.map_err(|err| {
            self.remote_failure(
                Operation::Purchase,
                format!("package {}", package.id),
                err,
                None,
            )
        })?;

        let tx = CreditTransaction::new(
            response.transaction_id.clone(),
            TransactionType::Purchase,
            response.credits_added,
            response.new_balance,
            format!("{} package", package.name),
        );
        if let Err(err) =
            self.store
                .record_purchase(response.new_balance, response.credits_added, tx)
        {
            warn!(reason = %err, "purchase confirmed but local balance was not updated");
        }
        self.persist().await;

        info!(
            package = %package.id,
            credits = response.credits_added,
            balance = response.new_balance,
            "credits purchased"
        );
        Ok(PurchaseReceipt {
            package,
            credits_added: response.credits_added,
            new_balance: response.new_balance,
            transaction_id: response.transaction_id,
        })
    }

    /// Spend credits now. Fails fast without a round trip when the balance is short;
    /// the local balance is lowered optimistically and restored if the server refuses.
    pub async fn deduct_credits(
        &self,
        request: DeductionRequest,
    ) -> Result<SpendReceipt, LedgerError> {
        validate_spend(request.amount, &request.service_id)?;
        if !self.check_sufficient_credits(request.amount).await {
            return Err(LedgerError::InsufficientCredits {
                required: request.amount,
                available: self.store.available(),
            });
        }

        let adjustment = self.store.optimistic_adjust(-request.amount);
        let payload = DeductRequest {
            amount: request.amount,
            description: request.description.clone(),
            service_id: request.service_id.clone(),
            service_type: request.service_type.clone(),
        };

        let response = match self.api.deduct(&payload).await {
            Ok(response) => response,
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback(&adjustment) {
                    warn!(reason = %rollback_err, "rollback after failed deduction was refused");
                }
                return Err(self.remote_failure(
                    Operation::Deduct,
                    spend_context(request.amount, &request.service_id),
                    err,
                    Some(request.amount),
                ));
            }
        };

        let tx = CreditTransaction::new(
            response.transaction_id.clone(),
            TransactionType::Deduction,
            request.amount,
            response.new_balance,
            request.description,
        )
        .with_service_type(request.service_type);
        if let Err(err) =
            self.store
                .settle_adjustment(&adjustment, response.new_balance, Some(tx.clone()))
        {
            warn!(reason = %err, "deduction confirmed but balance could not be settled locally");
            if let Err(err) = self.store.commit_adjustment(&adjustment, Some(tx)) {
                warn!(reason = %err, "deduction could not be committed locally");
            }
            self.resync().await;
        }
        self.persist().await;

        info!(
            amount = request.amount,
            service_id = %request.service_id,
            balance = response.new_balance,
            "credits deducted"
        );
        Ok(SpendReceipt {
            transaction_id: response.transaction_id,
            amount: request.amount,
            new_balance: response.new_balance,
            available: self.store.available(),
        })
    }

    // ========================
    // Reservations
    // ========================

    /// Place a hold on credits for an operation whose cost is settled later.
    pub async fn reserve_credits(
        &self,
        amount: Credits,
        service_id: &str,
    ) -> Result<Reservation, LedgerError> {
        validate_spend(amount, service_id)?;
        if !self.check_sufficient_credits(amount).await {
            return Err(LedgerError::InsufficientCredits {
                required: amount,
                available: self.store.available(),
            });
        }

        let payload = ReserveRequest {
            amount,
            service_id: service_id.to_string(),
        };
        let response = self.api.reserve(&payload).await.map_err(|err| {
            self.remote_failure(
                Operation::Reserve,
                spend_context(amount, service_id),
                err,
                Some(amount),
            )
        })?;

        let mut reservation = Reservation::new(
            response.reservation_id,
            amount,
            service_id,
            Utc::now(),
            self.reservation_ttl,
        );
        if let Some(expires_at) = response.expires_at {
            reservation = reservation.with_expires_at(expires_at);
        }

        if let Err(err) = self.store.add_reservation(reservation.clone()) {
            // balance moved between the check and the hold; give the server hold back
            warn!(reservation = %reservation.id, reason = %err, "local hold refused, cancelling remote reservation");
            if let Err(cancel_err) = self.api.cancel(&reservation.id).await {
                warn!(reservation = %reservation.id, reason = %cancel_err, "remote cancel failed");
            }
            return Err(err.into());
        }
        Ok(reservation)
    }

    /// Convert a hold into a deduction. A second confirm, or a confirm after cancel or
    /// expiry, fails with `ReservationNotFound`/`ReservationExpired` and changes nothing.
    pub async fn confirm_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<SpendReceipt, LedgerError> {
        let reservation = self.store.claim_reservation(reservation_id, Utc::now())?;
        let id: ReservationId = reservation.id.clone();

        let response = match self.api.confirm(&id).await {
            Ok(response) => response,
            Err(err) => return Err(self.terminate_failed(Operation::Confirm, &reservation, err)),
        };

        let tx = CreditTransaction::new(
            response.transaction_id.clone(),
            TransactionType::Deduction,
            reservation.amount,
            response.new_balance,
            format!("Reserved usage for {}", reservation.service_id),
        );
        if let Err(err) = self
            .store
            .settle_reservation(&id, response.new_balance, Some(tx.clone()))
        {
            warn!(reservation = %id, reason = %err, "confirmation applied remotely but not settled locally");
            if let Err(err) = self.store.consume_reservation(&id, Some(tx)) {
                warn!(reservation = %id, reason = %err, "confirmed hold could not be consumed locally");
            }
            self.resync().await;
        }
        self.persist().await;

        Ok(SpendReceipt {
            transaction_id: response.transaction_id,
            amount: reservation.amount,
            new_balance: response.new_balance,
            available: self.store.available(),
        })
    }

    /// Release a hold without spending it.
    pub async fn cancel_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<Reservation, LedgerError> {
        let reservation = self.store.claim_reservation(reservation_id, Utc::now())?;

        if let Err(err) = self.api.cancel(&reservation.id).await {
            return Err(self.terminate_failed(Operation::Cancel, &reservation, err));
        }

        Ok(self.store.release_reservation(&reservation.id)?)
    }

    /// Handle a failed confirm/cancel on a claimed hold. If the server no longer knows
    /// the hold it is released locally too; otherwise the claim is returned.
    fn terminate_failed(
        &self,
        operation: Operation,
        reservation: &Reservation,
        err: RemoteError,
    ) -> LedgerError {
        match err {
            RemoteError::NotFound(_) => {
                let _ = self.store.release_reservation(&reservation.id);
                LedgerError::ReservationNotFound(reservation.id.clone())
            }
            RemoteError::Expired(_) => {
                let _ = self.store.release_reservation(&reservation.id);
                LedgerError::ReservationExpired(reservation.id.clone())
            }
            err => {
                self.store.unclaim_reservation(&reservation.id);
                self.remote_failure(
                    operation,
                    format!(
                        "reservation {}, {}",
                        reservation.id,
                        spend_context(reservation.amount, &reservation.service_id)
                    ),
                    err,
                    Some(reservation.amount),
                )
            }
        }
    }

    // ========================
    // Pricing
    // ========================

    pub fn calculate_service_cost(
        &self,
        request: &PricingRequest,
    ) -> Result<PricingResult, LedgerError> {
        Ok(self.pricing.calculate(request)?)
    }

    pub fn pricing(&self) -> &PricingCalculator {
        &self.pricing
    }

    // ========================
    // Helpers
    // ========================

    fn remote_failure(
        &self,
        operation: Operation,
        context: String,
        err: RemoteError,
        required: Option<Credits>,
    ) -> LedgerError {
        warn!(%operation, context = %context, reason = %err, "ledger call failed");
        match err {
            RemoteError::InsufficientCredits(_) => LedgerError::InsufficientCredits {
                required: required.unwrap_or_default(),
                available: self.store.available(),
            },
            RemoteError::Validation(message) => LedgerError::Validation(message),
            err if err.is_transient() => LedgerError::RemoteUnavailable {
                operation,
                context,
                source: err,
            },
            err => LedgerError::Rejected {
                operation,
                context,
                source: err,
            },
        }
    }

    /// Re-fetch the balance after a settlement that could not be reconciled locally.
    async fn resync(&self) {
        if let Err(err) = self.refresh_balance().await {
            warn!(reason = %err, "balance resync failed, keeping local accounting");
        }
    }

    async fn persist(&self) {
        let Some(repo) = &self.repo else {
            return;
        };
        let balance = self.store.snapshot().balance();
        if let Err(err) = repo.save_balance(&balance).await {
            warn!(reason = %err, "failed to persist balance");
        }
    }
}

fn validate_spend(amount: Credits, service_id: &str) -> Result<(), LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::Validation(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    if service_id.trim().is_empty() {
        return Err(LedgerError::Validation("service id is required".to_string()));
    }
    Ok(())
}

fn spend_context(amount: Credits, service_id: &str) -> String {
    format!("amount {}, service {}", amount, service_id)
}

impl std::fmt::Debug for LedgerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerService")
            .field("available", &self.store.available())
            .field("persisted", &self.repo.is_some())
            .field("reservation_ttl", &self.reservation_ttl)
            .finish()
    }
}

