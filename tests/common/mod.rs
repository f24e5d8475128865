// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{Duration, Utc};
use credit_ledger::application::LedgerService;
use credit_ledger::domain::{
    Balance, CreditTransaction, Credits, ReservationId, TransactionFilter, TransactionType,
    default_packages, find_package,
};
use credit_ledger::remote::{
    CreditsApi, DeductRequest, PurchaseRequest, PurchaseResponse, RemoteError, RemoteResult,
    ReserveRequest, ReserveResponse, SettlementResponse,
};
use credit_ledger::storage::Repository;
use tempfile::TempDir;
use tokio::sync::Notify;

#[derive(Default)]
struct FakeLedger {
    settled: Credits,
    lifetime: Credits,
    holds: HashMap<ReservationId, Credits>,
    transactions: Vec<CreditTransaction>,
    next_id: u64,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, VecDeque<RemoteError>>,
    gates: HashMap<&'static str, Arc<Gate>>,
    offline: bool,
}

/// Holds a call's response back after the server has applied it.
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    /// Wait until the parked call has been applied server-side.
    pub async fn applied(&self) {
        self.entered.notified().await;
    }

    /// Let the parked call return its response.
    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

impl FakeLedger {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn spendable(&self) -> Credits {
        self.settled - self.holds.values().sum::<Credits>()
    }

    /// Record the call and return an injected failure, if any.
    fn enter(&mut self, op: &'static str) -> RemoteResult<()> {
        *self.calls.entry(op).or_default() += 1;
        if self.offline {
            return Err(RemoteError::Unavailable("connection refused".into()));
        }
        if let Some(err) = self.failures.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }
}

/// In-memory ledger server. Balances are settled: holds are tracked separately and
/// only limit what can be spent or reserved.
#[derive(Clone, Default)]
pub struct FakeCreditsApi {
    state: Arc<Mutex<FakeLedger>>,
}

impl FakeCreditsApi {
    pub fn with_balance(settled: Credits) -> Self {
        let api = Self::default();
        {
            let mut state = api.state.lock().unwrap();
            state.settled = settled;
            state.lifetime = settled;
        }
        api
    }

    /// Make the next call to `op` fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: RemoteError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Park the next call to `op` after it is applied, until the gate is released.
    pub fn park_next(&self, op: &'static str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.state.lock().unwrap().gates.insert(op, gate.clone());
        gate
    }

    fn take_gate(&self, op: &'static str) -> Option<Arc<Gate>> {
        self.state.lock().unwrap().gates.remove(op)
    }

    fn apply_deduct(&self, request: &DeductRequest) -> RemoteResult<SettlementResponse> {
        let mut state = self.state.lock().unwrap();
        state.enter("deduct")?;
        if state.spendable() < request.amount {
            return Err(RemoteError::InsufficientCredits("balance too low".into()));
        }

        state.settled -= request.amount;
        let id = state.next_id("tx");
        let tx = CreditTransaction::new(
            id.clone(),
            TransactionType::Deduction,
            request.amount,
            state.settled,
            request.description.clone(),
        )
        .with_service_type(request.service_type.clone());
        state.transactions.push(tx);

        Ok(SettlementResponse {
            new_balance: state.settled,
            transaction_id: id,
        })
    }

    fn apply_reserve(&self, request: &ReserveRequest) -> RemoteResult<ReserveResponse> {
        let mut state = self.state.lock().unwrap();
        state.enter("reserve")?;
        if state.spendable() < request.amount {
            return Err(RemoteError::InsufficientCredits("balance too low".into()));
        }

        let id = state.next_id("res");
        state.holds.insert(id.clone(), request.amount);
        Ok(ReserveResponse {
            reservation_id: id,
            expires_at: Some(Utc::now() + Duration::minutes(15)),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().unwrap().calls.get(op).copied().unwrap_or(0)
    }

    pub fn settled(&self) -> Credits {
        self.state.lock().unwrap().settled
    }

    pub fn held(&self) -> Credits {
        self.state.lock().unwrap().holds.values().sum()
    }

    /// Change the balance behind the client's back (another device, an admin grant).
    pub fn set_settled(&self, settled: Credits) {
        self.state.lock().unwrap().settled = settled;
    }

    /// Drop a hold server-side as if it had expired there.
    pub fn expire_hold(&self, id: &str) {
        self.state.lock().unwrap().holds.remove(id);
    }
}

#[async_trait::async_trait]
impl CreditsApi for FakeCreditsApi {
    async fn fetch_balance(&self) -> RemoteResult<Balance> {
        let mut state = self.state.lock().unwrap();
        state.enter("fetch_balance")?;
        Ok(Balance::new(state.settled, state.lifetime))
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> RemoteResult<Vec<CreditTransaction>> {
        let mut state = self.state.lock().unwrap();
        state.enter("list_transactions")?;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|tx| filter.tx_type.is_none_or(|t| t == tx.tx_type))
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn purchase(&self, request: &PurchaseRequest) -> RemoteResult<PurchaseResponse> {
        let mut state = self.state.lock().unwrap();
        state.enter("purchase")?;
        let catalog = default_packages();
        let package = find_package(&catalog, &request.package_id)
            .ok_or_else(|| RemoteError::Validation("unknown package".into()))?;

        state.settled += package.credits;
        state.lifetime += package.credits;
        let id = state.next_id("tx");
        let tx = CreditTransaction::new(
            id.clone(),
            TransactionType::Purchase,
            package.credits,
            state.settled,
            format!("{} package", package.name),
        );
        state.transactions.push(tx);

        Ok(PurchaseResponse {
            credits_added: package.credits,
            new_balance: state.settled,
            transaction_id: id,
        })
    }

    async fn deduct(&self, request: &DeductRequest) -> RemoteResult<SettlementResponse> {
        let response = self.apply_deduct(request);
        if let Some(gate) = self.take_gate("deduct") {
            gate.pass().await;
        }
        response
    }

    async fn reserve(&self, request: &ReserveRequest) -> RemoteResult<ReserveResponse> {
        let response = self.apply_reserve(request);
        if let Some(gate) = self.take_gate("reserve") {
            gate.pass().await;
        }
        response
    }

    async fn confirm(&self, reservation_id: &ReservationId) -> RemoteResult<SettlementResponse> {
        let mut state = self.state.lock().unwrap();
        state.enter("confirm")?;
        let amount = state
            .holds
            .remove(reservation_id)
            .ok_or_else(|| RemoteError::NotFound(reservation_id.clone()))?;

        state.settled -= amount;
        let id = state.next_id("tx");
        let tx = CreditTransaction::new(
            id.clone(),
            TransactionType::Deduction,
            amount,
            state.settled,
            "Reserved usage",
        );
        state.transactions.push(tx);

        Ok(SettlementResponse {
            new_balance: state.settled,
            transaction_id: id,
        })
    }

    async fn cancel(&self, reservation_id: &ReservationId) -> RemoteResult<()> {
        let mut state = self.state.lock().unwrap();
        state.enter("cancel")?;
        state
            .holds
            .remove(reservation_id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(reservation_id.clone()))
    }
}

/// Helper to create a test service with a temporary database
pub async fn test_service(settled: Credits) -> Result<(LedgerService, FakeCreditsApi, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let repo = Repository::open(db_path.to_str().unwrap()).await?;

    let api = FakeCreditsApi::with_balance(settled);
    let service = LedgerService::open(Arc::new(api.clone()), repo, 50).await?;
    Ok((service, api, temp_dir))
}

/// Helper to reopen the database of a previous test service
pub async fn reopen(temp_dir: &TempDir, api: &FakeCreditsApi) -> Result<LedgerService> {
    let db_path = temp_dir.path().join("test.db");
    let repo = Repository::open(db_path.to_str().unwrap()).await?;
    Ok(LedgerService::open(Arc::new(api.clone()), repo, 50).await?)
}
