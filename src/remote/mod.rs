//! Port to the remote credit ledger, the system of record.
//!
//! The service only talks to the server through [`CreditsApi`], so tests and
//! alternative transports can stand in for [`HttpCreditsApi`].

use std::sync::Arc;

use thiserror::Error;

use crate::domain::{Balance, CreditTransaction, ReservationId, TransactionFilter};

mod dto;
mod http;

pub use dto::*;
pub use http::HttpCreditsApi;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("insufficient credits: {0}")]
    InsufficientCredits(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rejected request: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("ledger unreachable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    /// Transient failures worth retrying as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Unavailable(_) => true,
            RemoteError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[async_trait::async_trait]
pub trait CreditsApi: Send + Sync {
    async fn fetch_balance(&self) -> RemoteResult<Balance>;

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> RemoteResult<Vec<CreditTransaction>>;

    async fn purchase(&self, request: &PurchaseRequest) -> RemoteResult<PurchaseResponse>;

    async fn deduct(&self, request: &DeductRequest) -> RemoteResult<SettlementResponse>;

    async fn reserve(&self, request: &ReserveRequest) -> RemoteResult<ReserveResponse>;

    async fn confirm(&self, reservation_id: &ReservationId) -> RemoteResult<SettlementResponse>;

    async fn cancel(&self, reservation_id: &ReservationId) -> RemoteResult<()>;
}

pub type DynCreditsApi = Arc<dyn CreditsApi>;
