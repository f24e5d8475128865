use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::Credits;

/// A bucket of credits that lapses at a fixed instant (promotional grants, bonuses).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiringCredits {
    pub amount: Credits,
    pub expires_at: DateTime<Utc>,
}

/// Credit balance as reported by the ledger server.
///
/// `available` is the settled balance: active reservations are not subtracted here.
/// The store derives spendable credits from it by removing the held amounts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub available: Credits,
    pub lifetime: Credits,
    #[serde(default)]
    pub expiring: Vec<ExpiringCredits>,
}

impl Balance {
    pub fn new(available: Credits, lifetime: Credits) -> Self {
        Self {
            available,
            lifetime,
            expiring: Vec::new(),
        }
    }

    pub fn with_expiring(mut self, amount: Credits, expires_at: DateTime<Utc>) -> Self {
        self.expiring.push(ExpiringCredits { amount, expires_at });
        self
    }

    /// Credits in buckets that lapse within `window` from `now` (already lapsed buckets excluded).
    pub fn expiring_within(&self, now: DateTime<Utc>, window: Duration) -> Credits {
        let horizon = now + window;
        self.expiring
            .iter()
            .filter(|bucket| bucket.expires_at > now && bucket.expires_at <= horizon)
            .map(|bucket| bucket.amount)
            .sum()
    }

    /// The next bucket to lapse after `now`.
    pub fn next_expiry(&self, now: DateTime<Utc>) -> Option<&ExpiringCredits> {
        self.expiring
            .iter()
            .filter(|bucket| bucket.expires_at > now)
            .min_by_key(|bucket| bucket.expires_at)
    }
}
