use thiserror::Error;

use crate::domain::{Credits, PricingError, ReservationId};
use crate::remote::RemoteError;

/// Failures of the ledger store's mutation primitives. A failed primitive never
/// leaves a partial update behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Insufficient credits: available {available}, requested {requested}")]
    InsufficientCredits {
        available: Credits,
        requested: Credits,
    },

    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    #[error("Reservation expired: {0}")]
    ReservationExpired(ReservationId),

    #[error("Reservation already exists: {0}")]
    DuplicateReservation(ReservationId),

    #[error("Balance {balance} cannot cover {held} credits on hold")]
    HoldsExceedBalance { balance: Credits, held: Credits },

    #[error("Adjustment {0} was already settled or rolled back")]
    AdjustmentSettled(u64),

    #[error("Invalid amount: {0}")]
    InvalidAmount(Credits),
}

/// The remote operation a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    FetchBalance,
    ListTransactions,
    Purchase,
    Deduct,
    Reserve,
    Confirm,
    Cancel,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::FetchBalance => "fetch balance",
            Operation::ListTransactions => "list transactions",
            Operation::Purchase => "purchase",
            Operation::Deduct => "deduct",
            Operation::Reserve => "reserve",
            Operation::Confirm => "confirm",
            Operation::Cancel => "cancel",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient credits: available {available}, required {required}")]
    InsufficientCredits {
        required: Credits,
        available: Credits,
    },

    #[error("Reservation not found (already confirmed, cancelled or expired): {0}")]
    ReservationNotFound(ReservationId),

    #[error("Reservation expired: {0}")]
    ReservationExpired(ReservationId),

    #[error("Ledger unavailable during {operation} ({context}): {source}")]
    RemoteUnavailable {
        operation: Operation,
        context: String,
        #[source]
        source: RemoteError,
    },

    #[error("Ledger rejected {operation} ({context}): {source}")]
    Rejected {
        operation: Operation,
        context: String,
        #[source]
        source: RemoteError,
    },

    #[error("Unknown service type: {0}")]
    InvalidServiceType(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Local state error: {0}")]
    Store(StoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl LedgerError {
    /// The caller should offer to add credits.
    pub fn needs_credits(&self) -> bool {
        matches!(self, LedgerError::InsufficientCredits { .. })
    }

    /// The caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::RemoteUnavailable { .. })
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientCredits {
                available,
                requested,
            } => LedgerError::InsufficientCredits {
                required: requested,
                available,
            },
            StoreError::ReservationNotFound(id) => LedgerError::ReservationNotFound(id),
            StoreError::ReservationExpired(id) => LedgerError::ReservationExpired(id),
            StoreError::InvalidAmount(amount) => {
                LedgerError::Validation(format!("amount must be positive, got {}", amount))
            }
            other => LedgerError::Store(other),
        }
    }
}

impl From<PricingError> for LedgerError {
    fn from(err: PricingError) -> Self {
        match err {
            PricingError::UnknownService(key) => LedgerError::InvalidServiceType(key),
            PricingError::UnknownSubtype {
                service_type,
                subtype,
            } => LedgerError::InvalidServiceType(format!("{}:{}", service_type, subtype)),
            other => LedgerError::Validation(other.to_string()),
        }
    }
}
