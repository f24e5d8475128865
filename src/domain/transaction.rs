use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Credits;

/// Server-issued transaction identifier.
pub type TransactionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Credits bought with a payment method
    Purchase,
    /// Credits spent on a service
    Deduction,
    /// Credits returned after a failed or cancelled service
    Refund,
    /// Credits granted for free (promotions, compensation)
    Bonus,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Deduction => "deduction",
            TransactionType::Refund => "refund",
            TransactionType::Bonus => "bonus",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "purchase" => Some(TransactionType::Purchase),
            "deduction" => Some(TransactionType::Deduction),
            "refund" => Some(TransactionType::Refund),
            "bonus" => Some(TransactionType::Bonus),
            _ => None,
        }
    }

    /// Returns true if this transaction type removes credits from the balance
    pub fn is_debit(&self) -> bool {
        matches!(self, TransactionType::Deduction)
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An entry of the credit ledger. Transactions are immutable; the client only keeps
/// a bounded recent window, the server holds the full history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditTransaction {
    pub id: TransactionId,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    /// Magnitude as sent by the server; some servers sign deductions, some don't
    pub amount: Credits,
    pub balance_after: Credits,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CreditTransaction {
    pub fn new(
        id: impl Into<TransactionId>,
        tx_type: TransactionType,
        amount: Credits,
        balance_after: Credits,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tx_type,
            amount,
            balance_after,
            description: description.into(),
            service_type: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = Some(service_type.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Amount with the sign of its effect on the balance, regardless of how the server sent it.
    pub fn signed_amount(&self) -> Credits {
        if self.tx_type.is_debit() {
            -self.amount.abs()
        } else {
            self.amount.abs()
        }
    }
}

/// Filter for querying the remote transaction history
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub tx_type: Option<TransactionType>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    /// True when the filter selects the most recent page of the unfiltered history.
    pub fn is_recent_window(&self) -> bool {
        self.offset.unwrap_or(0) == 0
            && self.tx_type.is_none()
            && self.start_date.is_none()
            && self.end_date.is_none()
    }
}
