//! Credit pricing for tracking, monitoring, report and investigation services.
//!
//! Rates are data (see [`PriceSheet`]); this module owns how a request turns into a
//! base price and how independent discounts combine. Discounts compose on the retained
//! fraction: `round(base * (1 - d_duration) * (1 - d_bulk) * (1 - d_package))`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Credits;

const DAYS_PER_MONTH: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    VesselTracking,
    AreaMonitoring,
    FleetTracking,
    Report,
    Investigation,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::VesselTracking => "vessel_tracking",
            ServiceType::AreaMonitoring => "area_monitoring",
            ServiceType::FleetTracking => "fleet_tracking",
            ServiceType::Report => "report",
            ServiceType::Investigation => "investigation",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "vessel_tracking" => Some(ServiceType::VesselTracking),
            "area_monitoring" => Some(ServiceType::AreaMonitoring),
            "fleet_tracking" => Some(ServiceType::FleetTracking),
            "report" => Some(ServiceType::Report),
            "investigation" => Some(ServiceType::Investigation),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Package tier of the customer's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl PricingTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingTier::Bronze => "bronze",
            PricingTier::Silver => "silver",
            PricingTier::Gold => "gold",
            PricingTier::Platinum => "platinum",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bronze" => Some(PricingTier::Bronze),
            "silver" => Some(PricingTier::Silver),
            "gold" => Some(PricingTier::Gold),
            "platinum" => Some(PricingTier::Platinum),
            _ => None,
        }
    }

    pub fn discount_percent(&self) -> u32 {
        match self {
            PricingTier::Bronze => 0,
            PricingTier::Silver => 5,
            PricingTier::Gold => 10,
            PricingTier::Platinum => 15,
        }
    }
}

impl std::fmt::Display for PricingTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountKind {
    Duration,
    Bulk,
    Package,
}

impl DiscountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountKind::Duration => "duration",
            DiscountKind::Bulk => "bulk",
            DiscountKind::Package => "package",
        }
    }
}

/// A discount that actually reduced the price (percent > 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub kind: DiscountKind,
    pub percent: u32,
}

impl AppliedDiscount {
    pub fn retained_percent(&self) -> u32 {
        100 - self.percent
    }
}

impl std::fmt::Display for AppliedDiscount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -{}%", self.kind.as_str(), self.percent)
    }
}

/// Duration discount by billed days.
pub fn duration_discount_percent(days: f64) -> u32 {
    if days <= 7.0 {
        0
    } else if days <= 30.0 {
        5
    } else if days < 90.0 {
        10
    } else if days < 180.0 {
        20
    } else {
        30
    }
}

/// Volume discount by vessel count.
pub fn bulk_discount_percent(vessel_count: u32) -> u32 {
    match vessel_count {
        0..=4 => 0,
        5..=9 => 10,
        10..=24 => 15,
        25..=49 => 20,
        _ => 25,
    }
}

/// Volume discount for month-based fleet subscriptions.
pub fn fleet_subscription_discount_percent(vessel_count: u32) -> u32 {
    if vessel_count >= 50 {
        20
    } else if vessel_count >= 20 {
        10
    } else {
        0
    }
}

/// Apply discounts multiplicatively on the retained fraction, rounding half up.
///
/// Integer arithmetic keeps the result exact: 450 at 5% off is 427.5, which rounds to 428.
pub fn apply_discounts(base: Credits, discounts: &[AppliedDiscount]) -> Credits {
    let mut numerator = i128::from(base.max(0));
    let mut denominator: i128 = 1;
    for discount in discounts {
        numerator *= i128::from(discount.retained_percent());
        denominator *= 100;
    }
    ((2 * numerator + denominator) / (2 * denominator)) as Credits
}

/// Retained fraction of the combined discounts, for display.
pub fn combined_retained(discounts: &[AppliedDiscount]) -> f64 {
    discounts
        .iter()
        .map(|d| f64::from(d.retained_percent()) / 100.0)
        .product()
}

/// Per-day surcharge band for area monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaBand {
    /// Upper bound of the band in km², inclusive. `None` is the open-ended last band.
    pub max_km2: Option<f64>,
    pub multiplier: f64,
}

/// Rates used by the calculator. Loaded from configuration; defaults match the public price list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceSheet {
    pub vessel_tracking_per_criteria_day: Credits,
    pub fleet_per_vessel_day: Credits,
    pub fleet_per_vessel_month: Credits,
    pub area_base_per_day: f64,
    pub area_bands: Vec<AreaBand>,
    pub report_rates: BTreeMap<String, Credits>,
    pub investigation_rates: BTreeMap<String, Credits>,
}

impl Default for PriceSheet {
    fn default() -> Self {
        let report_rates = [
            ("compliance", 50),
            ("risk_assessment", 75),
            ("sanctions_screening", 40),
            ("voyage_history", 30),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let investigation_rates = [("basic", 200), ("standard", 500), ("comprehensive", 1000)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        Self {
            vessel_tracking_per_criteria_day: 5,
            fleet_per_vessel_day: 10,
            fleet_per_vessel_month: 250,
            area_base_per_day: 10.0,
            area_bands: vec![
                AreaBand {
                    max_km2: Some(100.0),
                    multiplier: 0.10,
                },
                AreaBand {
                    max_km2: Some(500.0),
                    multiplier: 0.08,
                },
                AreaBand {
                    max_km2: Some(1000.0),
                    multiplier: 0.06,
                },
                AreaBand {
                    max_km2: None,
                    multiplier: 0.05,
                },
            ],
            report_rates,
            investigation_rates,
        }
    }
}

impl PriceSheet {
    fn area_multiplier(&self, area_km2: f64) -> f64 {
        self.area_bands
            .iter()
            .find(|band| band.max_km2.is_none_or(|max| area_km2 <= max))
            .or_else(|| self.area_bands.last())
            .map(|band| band.multiplier)
            .unwrap_or(0.0)
    }
}

/// A pricing request as submitted by callers. Which parameters are required depends on
/// the service type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingRequest {
    pub service_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_size_km2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vessel_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_days: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_months: Option<f64>,
    /// Report or investigation kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_tier: Option<PricingTier>,
}

impl PricingRequest {
    pub fn vessel_tracking(criteria_count: u32, duration_days: f64) -> Self {
        Self {
            service_type: ServiceType::VesselTracking.as_str().to_string(),
            criteria_count: Some(criteria_count),
            duration_days: Some(duration_days),
            ..Default::default()
        }
    }

    pub fn area_monitoring(area_size_km2: f64, duration_days: f64) -> Self {
        Self {
            service_type: ServiceType::AreaMonitoring.as_str().to_string(),
            area_size_km2: Some(area_size_km2),
            duration_days: Some(duration_days),
            ..Default::default()
        }
    }

    pub fn fleet_tracking(vessel_count: u32, duration_days: f64) -> Self {
        Self {
            service_type: ServiceType::FleetTracking.as_str().to_string(),
            vessel_count: Some(vessel_count),
            duration_days: Some(duration_days),
            ..Default::default()
        }
    }

    pub fn fleet_subscription(vessel_count: u32, duration_months: f64) -> Self {
        Self {
            service_type: ServiceType::FleetTracking.as_str().to_string(),
            vessel_count: Some(vessel_count),
            duration_months: Some(duration_months),
            ..Default::default()
        }
    }

    pub fn report(kind: impl Into<String>) -> Self {
        Self {
            service_type: ServiceType::Report.as_str().to_string(),
            subtype: Some(kind.into()),
            ..Default::default()
        }
    }

    pub fn investigation(kind: impl Into<String>) -> Self {
        Self {
            service_type: ServiceType::Investigation.as_str().to_string(),
            subtype: Some(kind.into()),
            ..Default::default()
        }
    }

    pub fn with_tier(mut self, tier: PricingTier) -> Self {
        self.pricing_tier = Some(tier);
        self
    }
}

/// Outcome of a pricing calculation. Pure derivation, nothing is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingResult {
    pub service_type: ServiceType,
    pub base_price: Credits,
    pub discounted_price: Credits,
    pub total_credits: Credits,
    pub price_per_vessel: Option<f64>,
    pub price_per_day: Option<f64>,
    pub applied_discounts: Vec<AppliedDiscount>,
    pub billed_days: Option<f64>,
    pub unit_count: Option<u32>,
}

impl PricingResult {
    fn zero(service_type: ServiceType) -> Self {
        Self {
            service_type,
            base_price: 0,
            discounted_price: 0,
            total_credits: 0,
            price_per_vessel: None,
            price_per_day: None,
            applied_discounts: Vec::new(),
            billed_days: None,
            unit_count: None,
        }
    }

    pub fn savings(&self) -> Credits {
        self.base_price - self.total_credits
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PricingError {
    UnknownService(String),
    UnknownSubtype {
        service_type: ServiceType,
        subtype: String,
    },
    MissingParameter {
        service_type: ServiceType,
        parameter: &'static str,
    },
    InvalidParameter {
        parameter: &'static str,
        value: f64,
    },
}

impl std::fmt::Display for PricingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PricingError::UnknownService(key) => write!(f, "unknown service type '{}'", key),
            PricingError::UnknownSubtype {
                service_type,
                subtype,
            } => write!(f, "unknown {} kind '{}'", service_type, subtype),
            PricingError::MissingParameter {
                service_type,
                parameter,
            } => write!(f, "{} pricing requires '{}'", service_type, parameter),
            PricingError::InvalidParameter { parameter, value } => write!(
                f,
                "'{}' must be a finite, non-negative number (got {})",
                parameter, value
            ),
        }
    }
}

impl std::error::Error for PricingError {}

fn quantity(parameter: &'static str, value: f64) -> Result<f64, PricingError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(PricingError::InvalidParameter { parameter, value })
    }
}

fn required<T>(
    service_type: ServiceType,
    parameter: &'static str,
    value: Option<T>,
) -> Result<T, PricingError> {
    value.ok_or(PricingError::MissingParameter {
        service_type,
        parameter,
    })
}

/// Round a computed price to whole credits. `value` is the input reported if it does not fit.
fn whole_credits(parameter: &'static str, value: f64, price: f64) -> Result<Credits, PricingError> {
    let price = price.round();
    if price.is_finite() && price >= 0.0 && price < Credits::MAX as f64 {
        Ok(price as Credits)
    } else {
        Err(PricingError::InvalidParameter { parameter, value })
    }
}

/// `days` times the integer rates, refusing products that overflow.
fn checked_base(
    parameter: &'static str,
    days: f64,
    rates: &[Credits],
) -> Result<Credits, PricingError> {
    let overflow = PricingError::InvalidParameter {
        parameter,
        value: days,
    };
    let days = whole_credits(parameter, days, days)?;
    rates
        .iter()
        .try_fold(days, |acc, rate| acc.checked_mul(*rate))
        .ok_or(overflow)
}

/// Days actually billed for day-based services: partial days round up, minimum one.
fn billed_days(days: f64) -> f64 {
    days.max(1.0).ceil()
}

/// Computes credit costs from a [`PriceSheet`].
#[derive(Debug, Clone, Default)]
pub struct PricingCalculator {
    sheet: PriceSheet,
}

impl PricingCalculator {
    pub fn new(sheet: PriceSheet) -> Self {
        Self { sheet }
    }

    pub fn sheet(&self) -> &PriceSheet {
        &self.sheet
    }

    pub fn calculate(&self, request: &PricingRequest) -> Result<PricingResult, PricingError> {
        let service_type = ServiceType::from_str(&request.service_type)
            .ok_or_else(|| PricingError::UnknownService(request.service_type.clone()))?;
        let package = request
            .pricing_tier
            .map(|tier| tier.discount_percent())
            .unwrap_or(0);

        match service_type {
            ServiceType::VesselTracking => {
                let criteria = required(service_type, "criteriaCount", request.criteria_count)?;
                let days = quantity(
                    "durationDays",
                    required(service_type, "durationDays", request.duration_days)?,
                )?;
                if criteria == 0 || days == 0.0 {
                    return Ok(PricingResult::zero(service_type));
                }

                let days = billed_days(days);
                let base = checked_base(
                    "durationDays",
                    days,
                    &[i64::from(criteria), self.sheet.vessel_tracking_per_criteria_day],
                )?;
                let discounts = collect_discounts(duration_discount_percent(days), 0, package);
                Ok(finish(service_type, base, discounts, Some(days), None))
            }
            ServiceType::AreaMonitoring => {
                let area = quantity(
                    "areaSizeKm2",
                    required(service_type, "areaSizeKm2", request.area_size_km2)?,
                )?;
                let days = quantity(
                    "durationDays",
                    required(service_type, "durationDays", request.duration_days)?,
                )?;
                if area == 0.0 || days == 0.0 {
                    return Ok(PricingResult::zero(service_type));
                }

                let per_day = self.sheet.area_base_per_day + area * self.sheet.area_multiplier(area);
                let base = whole_credits("areaSizeKm2", area, per_day * days)?;
                let discounts = collect_discounts(duration_discount_percent(days), 0, package);
                Ok(finish(service_type, base, discounts, Some(days), None))
            }
            ServiceType::FleetTracking => {
                let vessels = required(service_type, "vesselCount", request.vessel_count)?;
                match (request.duration_days, request.duration_months) {
                    (Some(days), _) => {
                        let days = quantity("durationDays", days)?;
                        if vessels == 0 || days == 0.0 {
                            return Ok(PricingResult::zero(service_type));
                        }

                        let days = billed_days(days);
                        let base = checked_base(
                            "durationDays",
                            days,
                            &[i64::from(vessels), self.sheet.fleet_per_vessel_day],
                        )?;
                        let discounts = collect_discounts(
                            duration_discount_percent(days),
                            bulk_discount_percent(vessels),
                            package,
                        );
                        Ok(finish(service_type, base, discounts, Some(days), Some(vessels)))
                    }
                    (None, Some(months)) => {
                        let months = quantity("durationMonths", months)?;
                        if vessels == 0 || months == 0.0 {
                            return Ok(PricingResult::zero(service_type));
                        }

                        let base = whole_credits(
                            "durationMonths",
                            months,
                            f64::from(vessels) * self.sheet.fleet_per_vessel_month as f64 * months,
                        )?;
                        let discounts = collect_discounts(
                            0,
                            fleet_subscription_discount_percent(vessels),
                            package,
                        );
                        Ok(finish(
                            service_type,
                            base,
                            discounts,
                            Some(months * DAYS_PER_MONTH),
                            Some(vessels),
                        ))
                    }
                    (None, None) => Err(PricingError::MissingParameter {
                        service_type,
                        parameter: "durationDays",
                    }),
                }
            }
            ServiceType::Report | ServiceType::Investigation => {
                let subtype = required(service_type, "subtype", request.subtype.as_deref())?;
                let rates = if service_type == ServiceType::Report {
                    &self.sheet.report_rates
                } else {
                    &self.sheet.investigation_rates
                };
                let base = *rates.get(&subtype.to_lowercase()).ok_or_else(|| {
                    PricingError::UnknownSubtype {
                        service_type,
                        subtype: subtype.to_string(),
                    }
                })?;
                let discounts = collect_discounts(0, 0, package);
                Ok(finish(service_type, base, discounts, None, None))
            }
        }
    }
}

/// Keep only the discounts that reduce the price, in duration, bulk, package order.
fn collect_discounts(duration: u32, bulk: u32, package: u32) -> Vec<AppliedDiscount> {
    [
        (DiscountKind::Duration, duration),
        (DiscountKind::Bulk, bulk),
        (DiscountKind::Package, package),
    ]
    .into_iter()
    .filter(|(_, percent)| *percent > 0)
    .map(|(kind, percent)| AppliedDiscount { kind, percent })
    .collect()
}

fn finish(
    service_type: ServiceType,
    base: Credits,
    applied_discounts: Vec<AppliedDiscount>,
    billed_days: Option<f64>,
    vessels: Option<u32>,
) -> PricingResult {
    let total = apply_discounts(base, &applied_discounts);
    PricingResult {
        service_type,
        base_price: base,
        discounted_price: total,
        total_credits: total,
        price_per_vessel: vessels
            .filter(|v| *v > 0)
            .map(|v| total as f64 / f64::from(v)),
        price_per_day: billed_days
            .filter(|d| *d > 0.0)
            .map(|d| total as f64 / d),
        applied_discounts,
        billed_days,
        unit_count: vessels,
    }
}
