//! Rating engine: versioned price books, pricing models, immutable charges.

pub mod catalog;
pub mod charge;
pub mod lineage;
pub mod rater;
pub mod rerating;

pub use catalog::{PriceBook, PriceRule, PricingModel, Tier};
pub use charge::{CalculationMetadata, RatedCharge, TierBreakdown};
pub use lineage::{LineageError, MAX_CHAIN_DEPTH, correction_chain};
pub use rater::{RatingError, RatingRequest, rate};
pub use rerating::delta_request;
