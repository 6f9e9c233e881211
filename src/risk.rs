// =============================================================================
// Risk Engine — monetary risk, martingale recovery, quantity sizing
// =============================================================================
//
// Sizing policy: the stop-loss price is the reference band itself; quantity
// is what adapts so the trade risks the effective monetary amount. With
// martingale enabled, the effective risk absorbs prior losses spread over the
// reward multiple:
//
//     R_eff = R_base + accumulated_loss / K
//
// A winning trade at reward K·R_eff then recovers the losses and still earns
// R_base.
// =============================================================================

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::config::RiskConfig;
use crate::filters::SymbolFilters;
use crate::signal::SignalCandidate;
use crate::types::Side;

/// A fully sized and validated bracket, ready to seed a pending slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedTrade {
    pub side: Side,
    pub entry: Decimal,
    pub sl: Decimal,
    pub tp: Decimal,
    pub quantity: Decimal,
    /// The monetary risk the quantity was derived for.
    pub r_effective: Decimal,
}

pub struct RiskEngine {
    cfg: RiskConfig,
}

impl RiskEngine {
    pub fn new(cfg: RiskConfig) -> Self {
        Self { cfg }
    }

    pub fn martingale_enabled(&self) -> bool {
        self.cfg.use_martingale
    }

    pub fn reward_multiplier(&self) -> Decimal {
        self.cfg.risk_reward_multiplier
    }

    /// Whether sizing needs the current quote balance.
    pub fn needs_balance(&self) -> bool {
        !self.cfg.use_fixed_monetary_risk && self.cfg.use_percentage_risk
    }

    // -------------------------------------------------------------------------
    // Monetary risk
    // -------------------------------------------------------------------------

    /// Resolve the base monetary risk from the configured source. Exactly one
    /// source applies; `None` when the selected source cannot be resolved or
    /// no monetary mode is configured at all.
    pub fn base_risk(&self, balance: Option<Decimal>) -> Option<Decimal> {
        if self.cfg.use_fixed_monetary_risk {
            return Some(self.cfg.fixed_monetary_risk_per_trade);
        }
        if self.cfg.use_percentage_risk {
            let bal = balance?;
            if bal <= Decimal::ZERO {
                return None;
            }
            return Some(bal * self.cfg.risk_percentage_per_trade / Decimal::ONE_HUNDRED);
        }
        None
    }

    /// Apply the bounded-martingale adjustment to a base risk.
    pub fn effective_risk(&self, base: Decimal, accumulated_loss: Decimal) -> Decimal {
        if !self.cfg.use_martingale || accumulated_loss <= Decimal::ZERO {
            return base;
        }
        if self.cfg.risk_reward_multiplier <= Decimal::ZERO {
            warn!(
                multiplier = %self.cfg.risk_reward_multiplier,
                "martingale active but reward multiplier <= 0 — using base risk"
            );
            return base;
        }
        base + accumulated_loss / self.cfg.risk_reward_multiplier
    }

    // -------------------------------------------------------------------------
    // Sizing + bracket validation
    // -------------------------------------------------------------------------

    /// Turn a signal candidate into a sized, validated bracket.
    ///
    /// * `accumulated_loss` — current martingale debt for the slot key.
    /// * `balance` — quote balance, required only in percentage mode.
    /// * `fixed_quantity` — per-symbol fallback when no monetary mode is
    ///   configured or the configured one cannot resolve.
    ///
    /// Returns `None` for any violation: no quantity source resolvable, SL
    /// distance below one tick, quantity under the lot minimum, notional
    /// under the exchange floor, or a directionally inconsistent bracket.
    pub fn size_and_validate(
        &self,
        candidate: &SignalCandidate,
        accumulated_loss: Decimal,
        balance: Option<Decimal>,
        fixed_quantity: Decimal,
        filters: &SymbolFilters,
    ) -> Option<ValidatedTrade> {
        let side = candidate.side;
        let entry = filters.round_price(candidate.entry_price_target);
        let sl = filters.round_price(candidate.stop_loss_price_ref);

        // Directional sanity of the stop before anything else.
        let sl_ok = match side {
            Side::Buy => sl < entry,
            Side::Sell => sl > entry,
        };
        if !sl_ok {
            debug!(%side, %entry, %sl, "stop loss on wrong side of entry — rejected");
            return None;
        }

        let distance = (entry - sl).abs();
        if distance < filters.price_tick {
            debug!(%distance, tick = %filters.price_tick, "SL distance below one tick — rejected");
            return None;
        }

        // Quantity: monetary mode first; when no monetary mode resolves a
        // quantity, fall through to the symbol's fixed quantity.
        let monetary_mode = self.cfg.use_fixed_monetary_risk || self.cfg.use_percentage_risk;
        let monetary = if monetary_mode {
            self.base_risk(balance)
                .map(|base| self.effective_risk(base, accumulated_loss))
                .filter(|r_eff| *r_eff > Decimal::ZERO)
                .map(|r_eff| (r_eff / distance, r_eff))
        } else {
            None
        };
        let (raw_qty, r_effective) = match monetary {
            Some(sized) => sized,
            None => {
                if monetary_mode {
                    debug!("monetary risk source unresolved — falling back to fixed quantity");
                }
                if fixed_quantity <= Decimal::ZERO {
                    debug!("no usable quantity source — rejected");
                    return None;
                }
                (fixed_quantity, fixed_quantity * distance)
            }
        };

        let quantity = filters.round_qty(raw_qty)?;
        if !filters.meets_notional(quantity, entry) {
            debug!(
                %quantity,
                %entry,
                min_notional = %filters.min_notional,
                "notional below exchange minimum — rejected"
            );
            return None;
        }

        // Take profit at K times the stop distance, tick-rounded.
        let k = self.cfg.risk_reward_multiplier;
        let tp_raw = match side {
            Side::Buy => entry + k * distance,
            Side::Sell => entry - k * distance,
        };
        let tp = filters.round_price(tp_raw);
        let tp_ok = match side {
            Side::Buy => tp > entry,
            Side::Sell => tp < entry,
        };
        if !tp_ok {
            debug!(%side, %entry, %tp, "take profit on wrong side of entry — rejected");
            return None;
        }

        debug!(
            %side, %entry, %sl, %tp, %quantity, r_effective = %r_effective,
            "trade sized and validated"
        );

        Some(ValidatedTrade {
            side,
            entry,
            sl,
            tp,
            quantity,
            r_effective,
        })
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine").field("cfg", &self.cfg).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
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

    fn risk_cfg() -> RiskConfig {
        RiskConfig {
            use_fixed_monetary_risk: true,
            fixed_monetary_risk_per_trade: dec!(1.00),
            use_percentage_risk: false,
            risk_percentage_per_trade: dec!(0.2),
            use_martingale: true,
            risk_reward_multiplier: dec!(10),
        }
    }

    fn buy_candidate() -> SignalCandidate {
        SignalCandidate {
            side: Side::Buy,
            entry_price_target: dec!(100.8),
            stop_loss_price_ref: dec!(100.0),
            trigger_ts: Utc::now(),
        }
    }

    #[test]
    fn sizes_buy_bracket_from_monetary_risk() {
        let engine = RiskEngine::new(risk_cfg());
        let trade = engine
            .size_and_validate(&buy_candidate(), dec!(0), None, dec!(0), &filters())
            .expect("trade");

        // d = 0.8, q = 1 / 0.8 = 1.25, tp = 100.8 + 10 * 0.8 = 108.8
        assert_eq!(trade.entry, dec!(100.8));
        assert_eq!(trade.sl, dec!(100.0));
        assert_eq!(trade.quantity, dec!(1.25));
        assert_eq!(trade.tp, dec!(108.8));
        assert_eq!(trade.r_effective, dec!(1.00));
    }

    #[test]
    fn martingale_raises_effective_risk() {
        let engine = RiskEngine::new(risk_cfg());
        // R_eff = 1.00 + 0.975 / 10 = 1.0975
        let trade = engine
            .size_and_validate(&buy_candidate(), dec!(0.975), None, dec!(0), &filters())
            .expect("trade");
        assert_eq!(trade.r_effective, dec!(1.0975));
        // q = 1.0975 / 0.8 = 1.371875 → floored to step 1.37
        assert_eq!(trade.quantity, dec!(1.37));
    }

    #[test]
    fn martingale_disabled_keeps_base_risk() {
        let mut cfg = risk_cfg();
        cfg.use_martingale = false;
        let engine = RiskEngine::new(cfg);
        assert_eq!(engine.effective_risk(dec!(1), dec!(5)), dec!(1));
    }

    #[test]
    fn zero_multiplier_disables_recovery() {
        let mut cfg = risk_cfg();
        cfg.risk_reward_multiplier = dec!(0);
        let engine = RiskEngine::new(cfg);
        assert_eq!(engine.effective_risk(dec!(1), dec!(5)), dec!(1));
    }

    #[test]
    fn percentage_mode_needs_balance() {
        let mut cfg = risk_cfg();
        cfg.use_fixed_monetary_risk = false;
        cfg.use_percentage_risk = true;
        let engine = RiskEngine::new(cfg);

        assert!(engine.base_risk(None).is_none());
        assert!(engine.base_risk(Some(dec!(0))).is_none());
        // 0.2 % of 1000 = 2
        assert_eq!(engine.base_risk(Some(dec!(1000))), Some(dec!(2)));

        // With the balance unavailable, sizing falls through to the symbol's
        // fixed quantity instead of rejecting the signal.
        let trade = engine
            .size_and_validate(&buy_candidate(), dec!(0), None, dec!(1), &filters())
            .expect("fixed-quantity fallback");
        assert_eq!(trade.quantity, dec!(1));
        assert_eq!(trade.r_effective, dec!(0.8));
    }

    #[test]
    fn unresolved_monetary_mode_without_fixed_quantity_rejected() {
        let mut cfg = risk_cfg();
        cfg.use_fixed_monetary_risk = false;
        cfg.use_percentage_risk = true;
        let engine = RiskEngine::new(cfg);

        // No balance and no fixed quantity: nothing can size the trade.
        assert!(engine
            .size_and_validate(&buy_candidate(), dec!(0), None, dec!(0), &filters())
            .is_none());
    }

    #[test]
    fn fixed_quantity_fallback_when_no_monetary_mode() {
        let mut cfg = risk_cfg();
        cfg.use_fixed_monetary_risk = false;
        cfg.use_percentage_risk = false;
        let engine = RiskEngine::new(cfg);

        let trade = engine
            .size_and_validate(&buy_candidate(), dec!(0), None, dec!(2.005), &filters())
            .expect("trade");
        assert_eq!(trade.quantity, dec!(2));

        assert!(engine
            .size_and_validate(&buy_candidate(), dec!(0), None, dec!(0), &filters())
            .is_none());
    }

    #[test]
    fn sl_collapsing_onto_entry_rejected() {
        let engine = RiskEngine::new(risk_cfg());
        // Both prices floor to the same tick: zero stop distance.
        let candidate = SignalCandidate {
            side: Side::Buy,
            entry_price_target: dec!(100.89),
            stop_loss_price_ref: dec!(100.81),
            trigger_ts: Utc::now(),
        };
        assert!(engine
            .size_and_validate(&candidate, dec!(0), None, dec!(0), &filters())
            .is_none());
    }

    #[test]
    fn wrong_side_sl_rejected() {
        let engine = RiskEngine::new(risk_cfg());
        let candidate = SignalCandidate {
            side: Side::Sell,
            entry_price_target: dec!(100.0),
            stop_loss_price_ref: dec!(99.0), // must be above entry for SELL
            trigger_ts: Utc::now(),
        };
        assert!(engine
            .size_and_validate(&candidate, dec!(0), None, dec!(0), &filters())
            .is_none());
    }

    #[test]
    fn sell_bracket_mirrors_buy() {
        let engine = RiskEngine::new(risk_cfg());
        let candidate = SignalCandidate {
            side: Side::Sell,
            entry_price_target: dec!(101.2),
            stop_loss_price_ref: dec!(102.0),
            trigger_ts: Utc::now(),
        };
        let trade = engine
            .size_and_validate(&candidate, dec!(0), None, dec!(0), &filters())
            .expect("trade");
        assert_eq!(trade.sl, dec!(102.0));
        // tp = 101.2 − 10 * 0.8 = 93.2
        assert_eq!(trade.tp, dec!(93.2));
        assert!(trade.tp < trade.entry && trade.sl > trade.entry);
    }

    #[test]
    fn quantity_below_min_rejected() {
        let mut f = filters();
        f.min_qty = dec!(10);
        let engine = RiskEngine::new(risk_cfg());
        assert!(engine
            .size_and_validate(&buy_candidate(), dec!(0), None, dec!(0), &f)
            .is_none());
    }

    #[test]
    fn notional_below_minimum_rejected() {
        let mut f = filters();
        f.min_notional = dec!(1_000_000);
        let engine = RiskEngine::new(risk_cfg());
        assert!(engine
            .size_and_validate(&buy_candidate(), dec!(0), None, dec!(0), &f)
            .is_none());
    }

    #[test]
    fn bracket_geometry_invariant() {
        // sign(entry − sl) == sign(tp − entry) and |tp − entry| == K·|entry − sl|
        let engine = RiskEngine::new(risk_cfg());
        let trade = engine
            .size_and_validate(&buy_candidate(), dec!(0), None, dec!(0), &filters())
            .unwrap();
        let d_sl = trade.entry - trade.sl;
        let d_tp = trade.tp - trade.entry;
        assert!(d_sl > dec!(0) && d_tp > dec!(0));
        assert_eq!(d_tp, dec!(10) * d_sl);
    }
}
