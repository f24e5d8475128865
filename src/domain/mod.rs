mod balance;
mod credits;
mod package;
pub mod pricing;
mod reservation;
mod transaction;

pub use balance::*;
pub use credits::*;
pub use package::*;
pub use pricing::{
    AppliedDiscount, DiscountKind, PriceSheet, PricingCalculator, PricingError, PricingRequest,
    PricingResult, PricingTier, ServiceType,
};
pub use reservation::*;
pub use transaction::*;
