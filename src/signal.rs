// =============================================================================
// Signal Evaluator — tri-timeframe Bollinger entry detection
// =============================================================================
//
// BUY:  BBL_orig(P) > BBM_orig(S)   and   close(T) < BBM_orig(P)
// SELL: BBU_orig(P) < BBM_orig(S)   and   close(T) > BBM_orig(P)
//
// P = primary interval, T = trigger interval, S = SL-reference interval.
// Preconditions are strict inequalities; equality is no signal. The entry
// target is the tighter-band edge of the primary interval (BBL_new / BBU_new)
// and the SL reference is the SL-interval basis.
//
// Missing data from the cache is simply "no signal" — nothing here errors.
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::SL_REFERENCE_INTERVAL;
use crate::market_data::MarketDataCache;
use crate::symbols::SymbolConfig;
use crate::types::Side;

/// A raw directional trigger, before sizing and validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalCandidate {
    pub side: Side,
    pub entry_price_target: Decimal,
    pub stop_loss_price_ref: Decimal,
    pub trigger_ts: DateTime<Utc>,
}

/// Evaluate one symbol for one direction.
pub fn evaluate(
    cache: &MarketDataCache,
    symbol: &str,
    cfg: &SymbolConfig,
    side: Side,
) -> Option<SignalCandidate> {
    // 1. Trigger-interval price: close of the most recent candle, open or not.
    let trigger_candle = cache.latest_candle(symbol, &cfg.trigger_interval)?;
    let price_t = trigger_candle.close;

    // 2. Primary-interval context (last closed candle).
    let primary = cache.contextual_bands(symbol, &cfg.primary_interval)?;

    // 3. SL-reference basis.
    let bbm_sl_ref = cache
        .contextual_bands(symbol, SL_REFERENCE_INTERVAL)?
        .bbm_orig;

    let (precondition, trigger, entry) = match side {
        Side::Buy => (
            primary.bbl_orig > bbm_sl_ref,
            price_t < primary.bbm_orig,
            primary.bbl_new,
        ),
        Side::Sell => (
            primary.bbu_orig < bbm_sl_ref,
            price_t > primary.bbm_orig,
            primary.bbu_new,
        ),
    };

    debug!(
        symbol,
        %side,
        price_t = %price_t,
        bbm_primary = %primary.bbm_orig,
        bbm_sl_ref = %bbm_sl_ref,
        precondition,
        trigger,
        "signal check"
    );

    if !(precondition && trigger) {
        return None;
    }

    let trigger_ts = Utc
        .timestamp_millis_opt(trigger_candle.open_time)
        .single()
        .unwrap_or_else(Utc::now);

    Some(SignalCandidate {
        side,
        entry_price_target: entry,
        stop_loss_price_ref: bbm_sl_ref,
        trigger_ts,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::BinanceClient;
    use crate::indicators::BbParams;
    use crate::market_data::{Candle, CandleKey};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn cache() -> Arc<MarketDataCache> {
        Arc::new(MarketDataCache::new(Arc::new(BinanceClient::new("k", "s"))))
    }

    fn candle(open_time: i64, close: Decimal, closed: bool) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            is_closed: closed,
        }
    }

    /// Seed a series whose closed window is the two closes {a, b}, so with
    /// length 2: BBM = (a+b)/2 and σ = |a−b|/2. Band positions then follow
    /// directly from the multipliers.
    fn seed_window(
        cache: &Arc<MarketDataCache>,
        symbol: &str,
        interval: &str,
        a: Decimal,
        b: Decimal,
        mult_orig: f64,
        mult_new: f64,
    ) {
        cache.register_series_for_test(
            symbol,
            interval,
            Some(BbParams::new("SMA", 2, mult_orig, mult_new)),
            10,
        );
        let key = CandleKey::new(symbol, interval);
        cache.apply_update(&key, candle(0, a, true));
        cache.apply_update(&key, candle(60_000, b, true));
    }

    fn seed_trigger_close(cache: &Arc<MarketDataCache>, symbol: &str, close: Decimal) {
        cache.register_series_for_test(symbol, "1m", None, 10);
        let key = CandleKey::new(symbol, "1m");
        cache.apply_update(&key, candle(120_000, close, false));
    }

    fn default_cfg() -> SymbolConfig {
        serde_json::from_str("{}").unwrap()
    }

    #[test]
    fn buy_triggers_and_targets_tight_lower_band() {
        let c = cache();
        // Primary window {100.75, 101.25}: BBM = 101.0, σ = 0.25 — all
        // binary-exact, so the derived bands convert to exact decimals.
        // mult_orig 2.0 → BBL_orig 100.5 / BBU_orig 101.5;
        // mult_new 1.0 → BBL_new 100.75 / BBU_new 101.25.
        seed_window(&c, "BTCUSDT", "5m", dec!(100.75), dec!(101.25), 2.0, 1.0);
        // SL-reference basis pinned at 100.0 (< BBL_orig_P).
        seed_window(&c, "BTCUSDT", "15m", dec!(100.0), dec!(100.0), 2.0, 1.0);
        // Trigger close 100.9 < BBM_orig_P.
        seed_trigger_close(&c, "BTCUSDT", dec!(100.9));

        let sig = evaluate(&c, "BTCUSDT", &default_cfg(), Side::Buy).expect("buy signal");
        assert_eq!(sig.side, Side::Buy);
        assert_eq!(sig.entry_price_target, dec!(100.75));
        assert_eq!(sig.stop_loss_price_ref, dec!(100.0));
        assert_eq!(sig.trigger_ts.timestamp_millis(), 120_000);
    }

    #[test]
    fn buy_precondition_is_strict() {
        let c = cache();
        seed_window(&c, "BTCUSDT", "5m", dec!(100.75), dec!(101.25), 2.0, 1.0);
        // BBM_orig_S == BBL_orig_P == 100.5: equality means no signal.
        seed_window(&c, "BTCUSDT", "15m", dec!(100.5), dec!(100.5), 2.0, 1.0);
        seed_trigger_close(&c, "BTCUSDT", dec!(100.9));

        assert!(evaluate(&c, "BTCUSDT", &default_cfg(), Side::Buy).is_none());
    }

    #[test]
    fn buy_needs_trigger_below_primary_basis() {
        let c = cache();
        seed_window(&c, "BTCUSDT", "5m", dec!(100.75), dec!(101.25), 2.0, 1.0);
        seed_window(&c, "BTCUSDT", "15m", dec!(100.0), dec!(100.0), 2.0, 1.0);
        // 101.1 >= BBM_orig_P (101.0): no trigger.
        seed_trigger_close(&c, "BTCUSDT", dec!(101.1));

        assert!(evaluate(&c, "BTCUSDT", &default_cfg(), Side::Buy).is_none());
    }

    #[test]
    fn sell_is_symmetric() {
        let c = cache();
        seed_window(&c, "BTCUSDT", "5m", dec!(100.75), dec!(101.25), 2.0, 1.0);
        // Basis above BBU_orig_P (101.5).
        seed_window(&c, "BTCUSDT", "15m", dec!(102.0), dec!(102.0), 2.0, 1.0);
        // Trigger close above BBM_orig_P.
        seed_trigger_close(&c, "BTCUSDT", dec!(101.1));

        let sig = evaluate(&c, "BTCUSDT", &default_cfg(), Side::Sell).expect("sell signal");
        assert_eq!(sig.side, Side::Sell);
        assert_eq!(sig.entry_price_target, dec!(101.25));
        assert_eq!(sig.stop_loss_price_ref, dec!(102.0));
    }

    #[test]
    fn sell_rejected_when_band_overlaps_reference() {
        let c = cache();
        seed_window(&c, "BTCUSDT", "5m", dec!(100.75), dec!(101.25), 2.0, 1.0);
        // Basis below BBU_orig_P: precondition fails.
        seed_window(&c, "BTCUSDT", "15m", dec!(101.0), dec!(101.0), 2.0, 1.0);
        seed_trigger_close(&c, "BTCUSDT", dec!(101.1));

        assert!(evaluate(&c, "BTCUSDT", &default_cfg(), Side::Sell).is_none());
    }

    #[test]
    fn missing_data_is_no_signal() {
        let c = cache();
        assert!(evaluate(&c, "BTCUSDT", &default_cfg(), Side::Buy).is_none());

        // Trigger candle present but no primary/SL bands anywhere.
        seed_trigger_close(&c, "BTCUSDT", dec!(100.9));
        assert!(evaluate(&c, "BTCUSDT", &default_cfg(), Side::Buy).is_none());
    }
}
