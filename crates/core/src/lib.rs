//! Core domain: identifiers, errors, time windows, decimal scales.

pub mod clock;
pub mod decimal;
pub mod error;
pub mod id;
pub mod versioned;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{
    AggregationId, ChargeId, CustomerId, EventId, PriceBookId, PriceRuleId, ReratingJobId,
};
pub use versioned::Versioned;
pub use window::TimeWindow;
