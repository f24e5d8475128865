//! Runtime configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML file
//! (`credit-ledger.toml` unless `--config` says otherwise), `CREDIT_LEDGER_*`
//! environment variables (nested keys split on `__`, e.g.
//! `CREDIT_LEDGER_API__BASE_URL`), then command-line overrides.

use std::time::Duration as StdDuration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::application::store::DEFAULT_TRANSACTION_WINDOW;
use crate::domain::{DEFAULT_RESERVATION_TTL_SECS, PriceSheet};

pub const DEFAULT_CONFIG_PATH: &str = "credit-ledger.toml";
const ENV_PREFIX: &str = "CREDIT_LEDGER";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Bearer token for the authenticated session
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000/api".to_string(),
            token: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub api: ApiConfig,
    /// SQLite file holding the persisted balance
    pub database: String,
    pub reservation_ttl_secs: i64,
    pub sweep_interval_secs: u64,
    pub transaction_window: usize,
    pub pricing: PriceSheet,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            database: "credit-ledger.db".to_string(),
            reservation_ttl_secs: DEFAULT_RESERVATION_TTL_SECS,
            sweep_interval_secs: 60,
            transaction_window: DEFAULT_TRANSACTION_WINDOW,
            pricing: PriceSheet::default(),
        }
    }
}

/// Values given on the command line; they win over every other source.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<String>,
    pub base_url: Option<String>,
    pub database: Option<String>,
    pub token: Option<String>,
}

impl LedgerConfig {
    pub fn load(overrides: ConfigOverrides) -> Result<Self> {
        let config_path = overrides
            .config_path
            .as_deref()
            .unwrap_or(DEFAULT_CONFIG_PATH);
        // an explicitly named file must exist, the default one is optional
        let required = overrides.config_path.is_some();

        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", config_path))?;

        let mut loaded: LedgerConfig = settings
            .try_deserialize()
            .context("Invalid configuration")?;

        if let Some(base_url) = overrides.base_url {
            loaded.api.base_url = base_url;
        }
        if let Some(database) = overrides.database {
            loaded.database = database;
        }
        if let Some(token) = overrides.token {
            loaded.api.token = Some(token);
        }

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            bail!("api.base_url must not be empty");
        }
        if self.api.timeout_secs == 0 {
            bail!("api.timeout_secs must be positive");
        }
        if self.reservation_ttl_secs <= 0 {
            bail!("reservation_ttl_secs must be positive");
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be positive");
        }
        if self.transaction_window == 0 {
            bail!("transaction_window must be positive");
        }
        Ok(())
    }

    pub fn timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.api.timeout_secs)
    }

    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_ttl_secs)
    }

    pub fn sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reservation_ttl(), chrono::Duration::minutes(15));
        assert_eq!(config.transaction_window, 50);
        assert_eq!(config.pricing.fleet_per_vessel_day, 10);
    }

    #[test]
    fn test_file_values_and_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
database = "from-file.db"
reservation_ttl_secs = 300

[api]
base_url = "https://ledger.example.com/api"
timeout_secs = 5

[pricing]
fleet_per_vessel_month = 200
"#
        )
        .unwrap();

        let config = LedgerConfig::load(ConfigOverrides {
            config_path: Some(file.path().to_string_lossy().into_owned()),
            database: Some("override.db".to_string()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(config.api.base_url, "https://ledger.example.com/api");
        assert_eq!(config.api.timeout_secs, 5);
        assert_eq!(config.database, "override.db");
        assert_eq!(config.reservation_ttl_secs, 300);
        assert_eq!(config.pricing.fleet_per_vessel_month, 200);
        // untouched keys keep their defaults
        assert_eq!(config.pricing.vessel_tracking_per_criteria_day, 5);
        assert_eq!(config.sweep_interval_secs, 60);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = LedgerConfig::load(ConfigOverrides {
            config_path: Some("/nonexistent/credit-ledger.toml".to_string()),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let config = LedgerConfig {
            transaction_window: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = LedgerConfig {
            reservation_ttl_secs: -5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
