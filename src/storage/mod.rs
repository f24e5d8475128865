mod repository;

pub use repository::*;

/// SQL migration for the persisted balance
pub const MIGRATION_001_BALANCE: &str = include_str!("migrations/001_balance.sql");
