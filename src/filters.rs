// =============================================================================
// Symbol filters — lot / tick / notional constraints and order formatting
// =============================================================================
//
// Filters are immutable for the lifetime of a run: fetched lazily from
// exchangeInfo, cached by the executor, and consulted by every pricing and
// sizing path. All arithmetic is exact decimal; rounding is always *down*
// (toward zero) so an adjusted price/quantity never violates the filter it
// was adjusted for.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exchange trading constraints for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub symbol: String,
    pub price_tick: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
    pub price_precision: u32,
    pub quantity_precision: u32,
    pub base_asset: String,
    pub quote_asset: String,
}

impl SymbolFilters {
    /// Round `price` down to the symbol's tick grid. A non-positive tick
    /// leaves the price untouched.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        round_down_to_increment(price, self.price_tick)
    }

    /// Round `qty` down to the symbol's step grid. Returns `None` when the
    /// result falls below `min_qty` — a quantity that small must not trade.
    pub fn round_qty(&self, qty: Decimal) -> Option<Decimal> {
        if qty < self.min_qty {
            return None;
        }
        let adjusted = round_down_to_increment(qty, self.qty_step);
        if adjusted < self.min_qty {
            return None;
        }
        Some(adjusted)
    }

    /// Whether `qty * price` clears the exchange's minimum notional.
    pub fn meets_notional(&self, qty: Decimal, price: Decimal) -> bool {
        qty * price >= self.min_notional
    }

    /// Format a price for an order payload at the symbol's price precision.
    pub fn fmt_price(&self, price: Decimal) -> String {
        format!("{:.*}", self.price_precision as usize, price)
    }

    /// Format a quantity for an order payload at the symbol's quantity
    /// precision.
    pub fn fmt_qty(&self, qty: Decimal) -> String {
        format!("{:.*}", self.quantity_precision as usize, qty)
    }
}

/// Floor `value` to a multiple of `increment`. Non-positive increments pass
/// the value through unchanged.
fn round_down_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    let steps = (value / increment).floor();
    (steps * increment).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            symbol: "BTCUSDT".into(),
            price_tick: dec!(0.1),
            qty_step: dec!(0.01),
            min_qty: dec!(0.01),
            min_notional: dec!(5),
            price_precision: 1,
            quantity_precision: 2,
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
        }
    }

    #[test]
    fn price_rounds_down_to_tick() {
        let f = filters();
        assert_eq!(f.round_price(dec!(100.87)), dec!(100.8));
        assert_eq!(f.round_price(dec!(100.8)), dec!(100.8));
        assert_eq!(f.round_price(dec!(0.05)), dec!(0));
    }

    #[test]
    fn qty_rounds_down_to_step() {
        let f = filters();
        assert_eq!(f.round_qty(dec!(1.259)), Some(dec!(1.25)));
        assert_eq!(f.round_qty(dec!(0.01)), Some(dec!(0.01)));
    }

    #[test]
    fn qty_below_min_rejected() {
        let f = filters();
        assert_eq!(f.round_qty(dec!(0.005)), None);
        // 0.019 floors to 0.01 which equals min_qty — accepted.
        assert_eq!(f.round_qty(dec!(0.019)), Some(dec!(0.01)));
    }

    #[test]
    fn qty_that_floors_below_min_rejected() {
        let mut f = filters();
        f.min_qty = dec!(0.02);
        // 0.025 floors to 0.02 == min: accepted; 0.021 floors to 0.02 too.
        assert_eq!(f.round_qty(dec!(0.025)), Some(dec!(0.02)));
        // 0.02 is fine, but anything strictly below min before rounding fails.
        assert_eq!(f.round_qty(dec!(0.015)), None);
    }

    #[test]
    fn notional_check() {
        let f = filters();
        assert!(f.meets_notional(dec!(0.05), dec!(100.8)));
        assert!(!f.meets_notional(dec!(0.04), dec!(100.8)));
    }

    #[test]
    fn order_formatting_uses_precisions() {
        let f = filters();
        assert_eq!(f.fmt_price(dec!(100.8)), "100.8");
        assert_eq!(f.fmt_qty(dec!(1.25)), "1.25");
        assert_eq!(f.fmt_qty(dec!(1)), "1.00");
    }

    #[test]
    fn zero_increment_passes_through() {
        assert_eq!(round_down_to_increment(dec!(3.14), dec!(0)), dec!(3.14));
    }
}
