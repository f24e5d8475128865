use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::domain::{Balance, ExpiringCredits};

use super::MIGRATION_001_BALANCE;

/// A balance as last persisted, with the time it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBalance {
    pub balance: Balance,
    pub updated_at: DateTime<Utc>,
}

/// Repository for the client-side persisted balance.
///
/// Only the settled balance, lifetime credits and expiring buckets are kept. Transactions
/// and reservations are session state and are always rehydrated from the server.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database at the given URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_BALANCE)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Open (creating if needed) the database file at `path` and migrate it.
    pub async fn open(path: &str) -> Result<Self> {
        let repo = Self::connect(&format!("sqlite:{}?mode=rwc", path)).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    /// Persist the settled balance, replacing any previous one.
    pub async fn save_balance(&self, balance: &Balance) -> Result<()> {
        let expiring_json = serde_json::to_string(&balance.expiring)?;

        sqlx::query(
            r#"
            INSERT INTO balance_snapshot (id, available, lifetime, expiring, updated_at)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                available = excluded.available,
                lifetime = excluded.lifetime,
                expiring = excluded.expiring,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(balance.available)
        .bind(balance.lifetime)
        .bind(&expiring_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save balance")?;
        Ok(())
    }

    /// Load the persisted balance, if any.
    pub async fn load_balance(&self) -> Result<Option<StoredBalance>> {
        let row = sqlx::query(
            "SELECT available, lifetime, expiring, updated_at FROM balance_snapshot WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch balance")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expiring_json: String = row.get("expiring");
        let expiring: Vec<ExpiringCredits> =
            serde_json::from_str(&expiring_json).context("Invalid expiring credits")?;
        let updated_at_str: String = row.get("updated_at");

        Ok(Some(StoredBalance {
            balance: Balance {
                available: row.get("available"),
                lifetime: row.get("lifetime"),
                expiring,
            },
            updated_at: DateTime::parse_from_rfc3339(&updated_at_str)
                .context("Invalid updated_at timestamp")?
                .with_timezone(&Utc),
        }))
    }

    /// Forget the persisted balance (session teardown).
    pub async fn clear_balance(&self) -> Result<()> {
        sqlx::query("DELETE FROM balance_snapshot")
            .execute(&self.pool)
            .await
            .context("Failed to clear balance")?;
        Ok(())
    }
}
