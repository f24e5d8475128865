use serde::{Deserialize, Serialize};

use super::Credits;

/// A purchasable bundle of credits.
///
/// `savings_percent` is the figure shown on the price list. It is a marketing label
/// relative to the starter package's unit price and is not derived from the
/// service discount rules in [`super::pricing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditPackage {
    pub id: String,
    pub name: String,
    pub credits: Credits,
    /// Price in the payment currency's minor unit
    pub price_cents: i64,
    pub savings_percent: u32,
}

impl CreditPackage {
    fn new(id: &str, name: &str, credits: Credits, price_cents: i64, savings_percent: u32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            credits,
            price_cents,
            savings_percent,
        }
    }

    /// Price per credit in minor units, for display
    pub fn unit_price(&self) -> f64 {
        self.price_cents as f64 / self.credits as f64
    }
}

/// The standard catalog offered to every account.
pub fn default_packages() -> Vec<CreditPackage> {
    vec![
        CreditPackage::new("starter", "Starter", 100, 10_000, 0),
        CreditPackage::new("standard", "Standard", 500, 45_000, 10),
        CreditPackage::new("professional", "Professional", 1000, 80_000, 20),
        CreditPackage::new("enterprise", "Enterprise", 5000, 350_000, 30),
    ]
}

/// Look up a package by id in the given catalog.
pub fn find_package<'a>(catalog: &'a [CreditPackage], id: &str) -> Option<&'a CreditPackage> {
    catalog.iter().find(|p| p.id.eq_ignore_ascii_case(id))
}
