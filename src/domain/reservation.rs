use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::Credits;

/// Server-issued reservation identifier.
pub type ReservationId = String;

/// How long the server keeps a hold before releasing it on its own.
pub const DEFAULT_RESERVATION_TTL_SECS: i64 = 15 * 60;

/// A time-bounded hold on credits for an operation whose final cost is not known yet.
/// It terminates exactly once: confirmed into a deduction, cancelled, or swept after expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: ReservationId,
    pub amount: Credits,
    pub service_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(
        id: impl Into<ReservationId>,
        amount: Credits,
        service_id: impl Into<String>,
        created_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            amount,
            service_id: service_id.into(),
            created_at,
            expires_at: created_at + ttl,
        }
    }

    /// Use the server-reported expiry instead of the local TTL.
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

pub fn default_reservation_ttl() -> Duration {
    Duration::seconds(DEFAULT_RESERVATION_TTL_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_expiry_from_ttl() {
        let created = Utc::now();
        let reservation = Reservation::new("r1", 100, "svc-1", created, default_reservation_ttl());

        assert_eq!(reservation.expires_at - created, Duration::minutes(15));
        assert!(!reservation.is_expired(created));
        assert!(reservation.is_expired(created + Duration::minutes(15)));
    }

    #[test]
    fn test_remaining_never_negative() {
        let created = Utc::now();
        let reservation = Reservation::new("r1", 100, "svc-1", created, Duration::seconds(30));

        assert_eq!(reservation.remaining(created), Duration::seconds(30));
        assert_eq!(
            reservation.remaining(created + Duration::minutes(5)),
            Duration::zero()
        );
    }
}
