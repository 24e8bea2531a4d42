//! Fixed-point decimal scales for the money paths.
//!
//! Money is 2-decimal, quantities and unit prices 6-decimal. Intermediate
//! products carry full precision; rounding (half-up) happens only at the
//! target scale. No binary floating point anywhere in value/price/subtotal
//! arithmetic.

use rust_decimal::{Decimal, RoundingStrategy};

/// Scale of monetary amounts (subtotals, fees).
pub const MONEY_SCALE: u32 = 2;

/// Scale of usage quantities.
pub const QUANTITY_SCALE: u32 = 6;

/// Scale of unit prices.
pub const PRICE_SCALE: u32 = 6;

/// Round to money scale, half-up.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Round to quantity scale, half-up.
pub fn round_quantity(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(QUANTITY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Round to unit-price scale, half-up.
pub fn round_price(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_rounds_half_up() {
        assert_eq!(round_money(Decimal::new(12345, 3)), Decimal::new(1235, 2)); // 12.345 -> 12.35
        assert_eq!(round_money(Decimal::new(12344, 3)), Decimal::new(1234, 2)); // 12.344 -> 12.34
    }

    #[test]
    fn quantity_keeps_six_decimals() {
        let q = Decimal::new(8_000_000_5, 7); // 8.0000005
        assert_eq!(round_quantity(q), Decimal::new(8_000_001, 6));
    }

    #[test]
    fn rounding_is_stable_at_scale() {
        let exact = Decimal::new(11000, 2); // 110.00
        assert_eq!(round_money(exact), exact);
    }
}
