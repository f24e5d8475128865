use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;

use crate::application::LedgerService;
use crate::domain::{Balance, CreditTransaction, PricingRequest, PricingResult, TransactionFilter};

/// Transaction history export with the balance it was taken against
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionExport {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub balance: Balance,
    pub transactions: Vec<CreditTransaction>,
}

/// Writes ledger data in machine-readable formats
pub struct Exporter<'a> {
    service: &'a LedgerService,
}

impl<'a> Exporter<'a> {
    pub fn new(service: &'a LedgerService) -> Self {
        Self { service }
    }

    /// Export the matching transactions as CSV
    pub async fn export_transactions_csv<W: Write>(
        &self,
        filter: &TransactionFilter,
        writer: W,
    ) -> Result<usize> {
        let transactions = self.service.list_transactions(filter).await?;
        write_transactions_csv(&transactions, writer)
    }

    /// Export the matching transactions as a JSON document
    pub async fn export_transactions_json<W: Write>(
        &self,
        filter: &TransactionFilter,
        mut writer: W,
    ) -> Result<TransactionExport> {
        let transactions = self.service.list_transactions(filter).await?;
        let balance = self.service.get_balance(false).await?.balance();

        let export = TransactionExport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: Utc::now(),
            balance,
            transactions,
        };

        let json = serde_json::to_string_pretty(&export)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(export)
    }

    /// Price a request and write the full breakdown as JSON
    pub fn export_quote_json<W: Write>(
        &self,
        request: &PricingRequest,
        mut writer: W,
    ) -> Result<PricingResult> {
        let result = self.service.calculate_service_cost(request)?;
        let json = serde_json::to_string_pretty(&result)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;
        Ok(result)
    }
}

/// Write transactions as CSV, one row per transaction, amounts signed by effect.
pub fn write_transactions_csv<W: Write>(
    transactions: &[CreditTransaction],
    writer: W,
) -> Result<usize> {
    let mut csv_writer = csv::Writer::from_writer(writer);

    csv_writer.write_record([
        "id",
        "timestamp",
        "type",
        "amount",
        "balance_after",
        "service_type",
        "description",
    ])?;

    let mut count = 0;
    for tx in transactions {
        csv_writer.write_record([
            tx.id.clone(),
            tx.timestamp.to_rfc3339(),
            tx.tx_type.as_str().to_string(),
            tx.signed_amount().to_string(),
            tx.balance_after.to_string(),
            tx.service_type.clone().unwrap_or_default(),
            tx.description.clone(),
        ])?;
        count += 1;
    }

    csv_writer.flush()?;
    Ok(count)
}
