// =============================================================================
// Pending-Order Manager — the working-entry state machine
// =============================================================================
//
// Runs once per control tick for every slot in PENDING_DYNAMIC_LIMIT, in
// four ordered phases; any phase may finalize the slot and stop the rest:
//
//   A. Primary-interval refresh — reprice entry/SL/TP and the gating zone
//      from fresh bands; replace a mispriced working order.
//   B. Precondition re-verification — the band relationship that justified
//      the signal must still hold or the slot is reaped.
//   C. Trigger-interval gating — the limit order only works while the
//      trigger candle's adverse extreme sits inside the active zone.
//   D. Fill detection — install the SL/TP bracket and move to POSITION_OPEN.
//
// The SL is mandatory: a fill whose bracket cannot be installed safely is
// unwound immediately with a reduce-only market order.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::config::SL_REFERENCE_INTERVAL;
use crate::control::ControlHandle;
use crate::execution::TradeExecutor;
use crate::market_data::MarketDataCache;
use crate::state::{OpenPosition, PendingTrade, TradeSlot, TradeStore};
use crate::symbols::SymbolConfig;
use crate::types::{interval_seconds, OrderStatus, Side};

/// Everything a pending-slot pass needs, borrowed from the orchestrator.
pub struct PendingContext<'a> {
    pub store: &'a TradeStore,
    pub executor: &'a TradeExecutor,
    pub cache: &'a MarketDataCache,
    pub control: &'a ControlHandle,
    pub symbol_cfg: &'a SymbolConfig,
    /// Reward multiplier K used when re-deriving the take profit.
    pub reward_multiplier: Decimal,
    /// Control-loop cadence, for the new-candle grace window.
    pub tick_seconds: u64,
}

// ---------------------------------------------------------------------------
// Pure decision helpers
// ---------------------------------------------------------------------------

/// Whether the primary-interval refresh is due: either most of a primary
/// candle has elapsed since the last refresh, or a new primary candle has
/// just opened (grace window of one tick plus a small margin).
pub(crate) fn refresh_due(
    now: DateTime<Utc>,
    last_update: DateTime<Utc>,
    primary_secs: u64,
    tick_secs: u64,
) -> bool {
    let elapsed = (now - last_update).num_seconds();
    if elapsed >= primary_secs as i64 - 30 {
        return true;
    }
    let into_candle = now.timestamp().rem_euclid(primary_secs as i64);
    into_candle < (tick_secs + 5) as i64 && elapsed > into_candle
}

/// Re-evaluate the side-specific signal precondition from the stored band
/// snapshot. `None` when the snapshot is incomplete (check skipped).
pub(crate) fn precondition_holds(
    side: Side,
    bbl_orig_primary: Option<Decimal>,
    bbu_orig_primary: Option<Decimal>,
    bbm_sl_ref: Option<Decimal>,
) -> Option<bool> {
    let bbm_s = bbm_sl_ref?;
    match side {
        Side::Buy => Some(bbl_orig_primary? > bbm_s),
        Side::Sell => Some(bbu_orig_primary? < bbm_s),
    }
}

/// What the gating phase should do with the working order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateAction {
    /// Probe in zone, no live order: place the limit entry.
    Place,
    /// Probe in zone but the live order sits at a stale price: cancel (the
    /// next tick re-places).
    CancelForReprice,
    /// Probe in zone and the live order is correctly priced.
    Keep,
    /// Probe out of zone with a live order: cancel it.
    CancelOutOfZone,
    /// Probe out of zone, nothing working: nothing to do.
    Stay,
}

/// Gating decision table. The active zone is the band half the entry hunts
/// in: [BBL_orig, BBM_orig] for BUY, [BBM_orig, BBU_orig] for SELL.
pub(crate) fn gate_action(
    side: Side,
    probe: Decimal,
    zone_lower: Decimal,
    zone_mid: Decimal,
    zone_upper: Decimal,
    live_order_price: Option<Decimal>,
    target_price: Decimal,
) -> GateAction {
    let in_zone = match side {
        Side::Buy => zone_lower <= probe && probe <= zone_mid,
        Side::Sell => zone_mid <= probe && probe <= zone_upper,
    };

    match (in_zone, live_order_price) {
        (true, None) => GateAction::Place,
        (true, Some(p)) if p != target_price => GateAction::CancelForReprice,
        (true, Some(_)) => GateAction::Keep,
        (false, Some(_)) => GateAction::CancelOutOfZone,
        (false, None) => GateAction::Stay,
    }
}

// ---------------------------------------------------------------------------
// Tick driver
// ---------------------------------------------------------------------------

/// Manage one pending slot for one tick.
pub async fn manage_pending(ctx: &PendingContext<'_>, key: &str, mut trade: PendingTrade) {
    let symbol = trade.symbol.clone();
    let now = Utc::now();

    // --- Phase A: primary-interval refresh --------------------------------
    let primary_secs =
        interval_seconds(&ctx.symbol_cfg.primary_interval).unwrap_or(300);

    if refresh_due(now, trade.last_primary_update, primary_secs, ctx.tick_seconds) {
        match refresh_primary(ctx, key, &mut trade, now).await {
            PhaseOutcome::Continue => {}
            PhaseOutcome::SlotFinalized => return,
        }
    }

    // --- Phase B: precondition re-verification ----------------------------
    match precondition_holds(
        trade.signal_type,
        trade.pre_check_bbl_orig_primary,
        trade.pre_check_bbu_orig_primary,
        trade.pre_check_bbm_sl_ref,
    ) {
        Some(true) => {}
        Some(false) => {
            warn!(key, symbol, "signal precondition no longer holds — reaping pending slot");
            if let Some(order_id) = trade.current_entry_order_id {
                ctx.executor.cancel_order_if_open(&symbol, order_id).await;
            }
            ctx.store.clear(key, "precondition invalidated");
            return;
        }
        None => {
            debug!(key, "band snapshot incomplete — precondition check skipped");
        }
    }

    // --- Phase C: trigger-interval gating ---------------------------------
    match gate_tick(ctx, key, &mut trade).await {
        PhaseOutcome::Continue => {}
        PhaseOutcome::SlotFinalized => return,
    }

    // --- Phase D: fill detection ------------------------------------------
    if let Some(order_id) = trade.current_entry_order_id {
        match ctx.executor.check_order(&symbol, order_id).await {
            Ok(info) => {
                if info.status == OrderStatus::Filled {
                    process_filled(ctx, key, trade, info.avg_price).await;
                } else if info.status.is_gone() {
                    debug!(key, order_id, status = ?info.status, "entry order gone — clearing id");
                    trade.current_entry_order_id = None;
                    ctx.store.set(key, TradeSlot::Pending(trade));
                }
            }
            Err(e) => {
                warn!(key, order_id, error = %e, "fill check failed — retrying next tick");
            }
        }
    }
}

enum PhaseOutcome {
    Continue,
    SlotFinalized,
}

/// Phase A body: refresh bands, reprice the bracket, refresh the gate zone,
/// and replace a mispriced working order.
async fn refresh_primary(
    ctx: &PendingContext<'_>,
    key: &str,
    trade: &mut PendingTrade,
    now: DateTime<Utc>,
) -> PhaseOutcome {
    let symbol = trade.symbol.clone();
    trade.last_primary_update = now;

    let primary = ctx
        .cache
        .contextual_bands(&symbol, &ctx.symbol_cfg.primary_interval);
    let sl_ref = ctx.cache.contextual_bands(&symbol, SL_REFERENCE_INTERVAL);

    let (Some(primary), Some(sl_ref)) = (primary, sl_ref) else {
        debug!(key, "primary/SL-reference bands unavailable — prices left untouched");
        ctx.store.set(key, TradeSlot::Pending(trade.clone()));
        return PhaseOutcome::SlotFinalized;
    };

    let filters = match ctx.executor.filters(&symbol).await {
        Ok(f) => f,
        Err(e) => {
            warn!(key, error = %e, "symbol filters unavailable — skipping refresh");
            ctx.store.set(key, TradeSlot::Pending(trade.clone()));
            return PhaseOutcome::SlotFinalized;
        }
    };

    // Precondition snapshot for phase B.
    trade.pre_check_bbl_orig_primary = Some(filters.round_price(primary.bbl_orig));
    trade.pre_check_bbu_orig_primary = Some(filters.round_price(primary.bbu_orig));
    trade.pre_check_bbm_sl_ref = Some(filters.round_price(sl_ref.bbm_orig));

    // Reprice the bracket: SL follows the reference basis, entry follows the
    // tighter primary band, TP keeps the reward multiple.
    let effective_sl = filters.round_price(sl_ref.bbm_orig);
    let new_entry = filters.round_price(match trade.signal_type {
        Side::Buy => primary.bbl_new,
        Side::Sell => primary.bbu_new,
    });

    let directionally_ok = match trade.signal_type {
        Side::Buy => new_entry > effective_sl,
        Side::Sell => new_entry < effective_sl,
    };
    let distance = (new_entry - effective_sl).abs();

    if directionally_ok && distance >= filters.price_tick {
        let tp_raw = match trade.signal_type {
            Side::Buy => new_entry + ctx.reward_multiplier * distance,
            Side::Sell => new_entry - ctx.reward_multiplier * distance,
        };
        let new_tp = filters.round_price(tp_raw);
        let tp_ok = match trade.signal_type {
            Side::Buy => new_tp > new_entry,
            Side::Sell => new_tp < new_entry,
        };
        if tp_ok {
            trade.target_entry_price = new_entry;
            trade.target_sl_price = effective_sl;
            trade.target_tp_price = new_tp;
            debug!(
                key,
                entry = %new_entry,
                sl = %effective_sl,
                tp = %new_tp,
                "pending bracket repriced"
            );
        }
    } else {
        debug!(
            key,
            entry = %new_entry,
            sl = %effective_sl,
            "repriced entry fails sanity against SL — keeping previous prices"
        );
    }

    // Gating zone for phase C.
    trade.gate_band_lower = Some(filters.round_price(primary.bbl_new));
    trade.gate_band_upper = Some(filters.round_price(primary.bbu_new));
    trade.gating_bbm_orig_primary = Some(filters.round_price(primary.bbm_orig));

    // Replace a working order whose price no longer matches the target.
    if let Some(order_id) = trade.current_entry_order_id {
        match ctx.executor.check_order(&symbol, order_id).await {
            Ok(info) if info.status.is_live() => {
                if info.price != trade.target_entry_price {
                    info!(
                        key,
                        order_id,
                        exchange_price = %info.price,
                        target = %trade.target_entry_price,
                        "entry order price stale — cancelling for re-placement"
                    );
                    if ctx.executor.cancel_order_if_open(&symbol, order_id).await {
                        trade.current_entry_order_id = None;
                    }
                }
            }
            Ok(info) if info.status == OrderStatus::Filled => {
                info!(key, order_id, "entry filled during primary refresh");
                ctx.store.set(key, TradeSlot::Pending(trade.clone()));
                process_filled(ctx, key, trade.clone(), info.avg_price).await;
                return PhaseOutcome::SlotFinalized;
            }
            Ok(info) => {
                debug!(key, order_id, status = ?info.status, "entry order gone — clearing id");
                trade.current_entry_order_id = None;
            }
            Err(e) => {
                warn!(key, order_id, error = %e, "order check failed during refresh");
            }
        }
    }

    ctx.store.set(key, TradeSlot::Pending(trade.clone()));
    PhaseOutcome::Continue
}

/// Phase C body: place / keep / cancel the working order according to where
/// the trigger candle's adverse extreme sits relative to the active zone.
async fn gate_tick(
    ctx: &PendingContext<'_>,
    key: &str,
    trade: &mut PendingTrade,
) -> PhaseOutcome {
    let symbol = trade.symbol.clone();

    let Some(trigger_candle) = ctx
        .cache
        .latest_candle(&symbol, &ctx.symbol_cfg.trigger_interval)
    else {
        debug!(key, "no trigger candle — gating skipped");
        return PhaseOutcome::Continue;
    };
    let probe = match trade.signal_type {
        Side::Buy => trigger_candle.low,
        Side::Sell => trigger_candle.high,
    };

    let (Some(zone_lower), Some(zone_mid), Some(zone_upper)) = (
        trade.pre_check_bbl_orig_primary,
        trade.gating_bbm_orig_primary,
        trade.pre_check_bbu_orig_primary,
    ) else {
        debug!(key, "gating bands incomplete — gating skipped");
        return PhaseOutcome::Continue;
    };

    // Establish the live-order picture first.
    let mut live_price: Option<Decimal> = None;
    if let Some(order_id) = trade.current_entry_order_id {
        match ctx.executor.check_order(&symbol, order_id).await {
            Ok(info) if info.status.is_live() => live_price = Some(info.price),
            Ok(info) if info.status == OrderStatus::Filled => {
                // Phase D picks the fill up this same tick.
                debug!(key, order_id, "entry already filled — leaving for fill handling");
                return PhaseOutcome::Continue;
            }
            Ok(info) => {
                debug!(key, order_id, status = ?info.status, "working order no longer active");
                trade.current_entry_order_id = None;
                ctx.store.set(key, TradeSlot::Pending(trade.clone()));
            }
            Err(e) => {
                warn!(key, order_id, error = %e, "gating order check failed — skipping gating");
                return PhaseOutcome::Continue;
            }
        }
    }

    let action = gate_action(
        trade.signal_type,
        probe,
        zone_lower,
        zone_mid,
        zone_upper,
        live_price,
        trade.target_entry_price,
    );
    debug!(key, probe = %probe, ?action, "gating decision");

    match action {
        GateAction::Place => {
            match ctx
                .executor
                .place_limit_entry(
                    &symbol,
                    trade.signal_type,
                    trade.quantity,
                    trade.target_entry_price,
                )
                .await
            {
                Ok(ack) => {
                    // Usually NEW; an immediate fill is picked up by phase D.
                    trade.current_entry_order_id = Some(ack.order_id);
                    ctx.store.set(key, TradeSlot::Pending(trade.clone()));
                }
                Err(e) => {
                    warn!(key, error = %e, "limit entry placement failed");
                }
            }
        }
        GateAction::CancelForReprice | GateAction::CancelOutOfZone => {
            if let Some(order_id) = trade.current_entry_order_id {
                if ctx.executor.cancel_order_if_open(&symbol, order_id).await {
                    trade.current_entry_order_id = None;
                    ctx.store.set(key, TradeSlot::Pending(trade.clone()));
                }
            }
        }
        GateAction::Keep | GateAction::Stay => {}
    }

    PhaseOutcome::Continue
}

/// Phase D body: the entry filled — validate and install the bracket, or
/// unwind the position immediately.
async fn process_filled(
    ctx: &PendingContext<'_>,
    key: &str,
    trade: PendingTrade,
    avg_fill_price: Decimal,
) {
    let symbol = trade.symbol.clone();
    info!(key, symbol, avg_fill = %avg_fill_price, "entry order FILLED");

    // 1. Actual entry price, falling back to the target when the exchange
    //    reports nothing usable.
    let entry_actual = if avg_fill_price > Decimal::ZERO {
        avg_fill_price
    } else {
        warn!(key, "fill without usable avgPrice — falling back to target entry");
        trade.target_entry_price
    };
    if entry_actual <= Decimal::ZERO {
        emergency_close(ctx, key, &trade, "invalid entry price after fill").await;
        return;
    }

    // 2. The stop must sit on the protective side of the actual entry, and
    //    the market must not have crossed it already.
    let sl = trade.target_sl_price;
    let sl_side_ok = match trade.signal_type {
        Side::Buy => sl < entry_actual,
        Side::Sell => sl > entry_actual,
    };
    if !sl_side_ok {
        emergency_close(ctx, key, &trade, "stop loss invalid against actual entry").await;
        return;
    }

    match ctx.executor.mark_price(&symbol).await {
        Ok(market) => {
            let sl_safe = match trade.signal_type {
                Side::Buy => market > sl,
                Side::Sell => market < sl,
            };
            if !sl_safe {
                emergency_close(ctx, key, &trade, "market already beyond stop price").await;
                return;
            }
        }
        Err(e) => {
            warn!(key, error = %e, "mark price unavailable for SL validation");
            emergency_close(ctx, key, &trade, "market price unavailable for SL validation").await;
            return;
        }
    }

    // 3. Stop loss is mandatory.
    let sl_order_id = match ctx
        .executor
        .place_stop_loss(&symbol, trade.signal_type, sl)
        .await
    {
        Ok(ack) => ack.order_id,
        Err(e) => {
            error!(key, error = %e, "stop-loss placement failed");
            emergency_close(ctx, key, &trade, "stop-loss placement failed").await;
            return;
        }
    };

    // 4. Take profit is best-effort.
    let tp = trade.target_tp_price;
    let tp_side_ok = match trade.signal_type {
        Side::Buy => tp > entry_actual,
        Side::Sell => tp < entry_actual,
    };
    let tp_order_id = if tp_side_ok {
        match ctx
            .executor
            .place_take_profit(&symbol, trade.signal_type, tp)
            .await
        {
            Ok(ack) => Some(ack.order_id),
            Err(e) => {
                error!(key, error = %e, "take-profit placement failed — position runs without TP");
                None
            }
        }
    } else {
        error!(key, tp = %tp, entry = %entry_actual, "take profit invalid against actual entry — skipped");
        None
    };

    // 5. Transition to POSITION_OPEN.
    let position = OpenPosition {
        symbol: symbol.clone(),
        side: trade.signal_type,
        position_side: trade.position_side,
        quantity: trade.quantity,
        entry_price_actual: entry_actual,
        sl_order_id: Some(sl_order_id),
        tp_order_id,
        accumulated_loss_at_entry: trade.accumulated_loss_at_entry,
    };
    ctx.store.set(key, TradeSlot::Open(position));
    info!(
        key,
        entry = %entry_actual,
        sl_order_id,
        ?tp_order_id,
        "bracket installed — slot transitioned to POSITION_OPEN"
    );
}

/// Close the just-filled position at market and destroy the slot. Accumulated
/// loss is deliberately untouched: fill details on this path are unreliable.
async fn emergency_close(ctx: &PendingContext<'_>, key: &str, trade: &PendingTrade, reason: &str) {
    error!(key, reason, "EMERGENCY CLOSE — unwinding position at market");
    match ctx
        .executor
        .market_close(&trade.symbol, trade.signal_type, trade.quantity)
        .await
    {
        Ok(ack) => info!(key, order_id = ack.order_id, "emergency close order placed"),
        Err(e) => error!(key, error = %e, "EMERGENCY CLOSE ORDER FAILED — manual intervention required"),
    }
    ctx.control.notify_notice(format!(
        "⚠️ {}: emergency close ({reason}) — martingale baseline not updated",
        trade.symbol
    ));
    ctx.store.clear(key, reason);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    // --- refresh scheduling -------------------------------------------------

    #[test]
    fn refresh_due_after_most_of_primary_candle() {
        // 5m primary: due once 270 s have passed since the last refresh.
        // (1_000_230 sits 30 s into its candle, outside the open window.)
        assert!(!refresh_due(at(1_000_230), at(1_000_030), 300, 15));
        assert!(refresh_due(at(1_000_300), at(1_000_030), 300, 15));
    }

    #[test]
    fn refresh_due_at_candle_open() {
        // 1_000_200 is exactly a 5m boundary; 10 s into the new candle with
        // the last update done during the previous candle.
        let boundary = 1_000_200; // divisible by 300
        assert_eq!(boundary % 300, 0);
        assert!(refresh_due(at(boundary + 10), at(boundary - 100), 300, 15));
        // Same window but the update already happened in this candle.
        assert!(!refresh_due(at(boundary + 10), at(boundary + 5), 300, 15));
    }

    // --- precondition -------------------------------------------------------

    #[test]
    fn precondition_buy_strict() {
        let p = |bbl, bbm| precondition_holds(Side::Buy, Some(bbl), Some(dec!(999)), Some(bbm));
        assert_eq!(p(dec!(100.5), dec!(100.0)), Some(true));
        assert_eq!(p(dec!(100.0), dec!(100.0)), Some(false));
        assert_eq!(p(dec!(99.9), dec!(100.0)), Some(false));
    }

    #[test]
    fn precondition_sell_strict() {
        let p = |bbu, bbm| precondition_holds(Side::Sell, Some(dec!(0)), Some(bbu), Some(bbm));
        assert_eq!(p(dec!(99.5), dec!(100.0)), Some(true));
        assert_eq!(p(dec!(100.0), dec!(100.0)), Some(false));
    }

    #[test]
    fn precondition_incomplete_snapshot_skips() {
        assert_eq!(
            precondition_holds(Side::Buy, None, Some(dec!(1)), Some(dec!(1))),
            None
        );
        assert_eq!(
            precondition_holds(Side::Sell, Some(dec!(1)), Some(dec!(1)), None),
            None
        );
    }

    // --- gating -------------------------------------------------------------

    const ZL: Decimal = dec!(100.5); // BBL_orig
    const ZM: Decimal = dec!(101.0); // BBM_orig
    const ZU: Decimal = dec!(101.5); // BBU_orig
    const TARGET: Decimal = dec!(100.8);

    #[test]
    fn gate_places_in_zone_without_order() {
        let a = gate_action(Side::Buy, dec!(100.7), ZL, ZM, ZU, None, TARGET);
        assert_eq!(a, GateAction::Place);
    }

    #[test]
    fn gate_keeps_correctly_priced_order() {
        let a = gate_action(Side::Buy, dec!(100.7), ZL, ZM, ZU, Some(TARGET), TARGET);
        assert_eq!(a, GateAction::Keep);
    }

    #[test]
    fn gate_replaces_mispriced_order() {
        let a = gate_action(Side::Buy, dec!(100.7), ZL, ZM, ZU, Some(dec!(100.6)), TARGET);
        assert_eq!(a, GateAction::CancelForReprice);
    }

    #[test]
    fn gate_cancels_when_probe_leaves_zone() {
        // Trigger low below BBL_orig: zone exited downward.
        let a = gate_action(Side::Buy, dec!(100.4), ZL, ZM, ZU, Some(TARGET), TARGET);
        assert_eq!(a, GateAction::CancelOutOfZone);
        // And above the basis: exited upward.
        let a = gate_action(Side::Buy, dec!(101.1), ZL, ZM, ZU, Some(TARGET), TARGET);
        assert_eq!(a, GateAction::CancelOutOfZone);
    }

    #[test]
    fn gate_idle_out_of_zone() {
        let a = gate_action(Side::Buy, dec!(100.4), ZL, ZM, ZU, None, TARGET);
        assert_eq!(a, GateAction::Stay);
    }

    #[test]
    fn gate_zone_boundaries_inclusive() {
        assert_eq!(
            gate_action(Side::Buy, ZL, ZL, ZM, ZU, None, TARGET),
            GateAction::Place
        );
        assert_eq!(
            gate_action(Side::Buy, ZM, ZL, ZM, ZU, None, TARGET),
            GateAction::Place
        );
    }

    #[test]
    fn gate_sell_uses_upper_half() {
        // SELL probes with the candle high against [BBM_orig, BBU_orig].
        assert_eq!(
            gate_action(Side::Sell, dec!(101.2), ZL, ZM, ZU, None, dec!(101.2)),
            GateAction::Place
        );
        assert_eq!(
            gate_action(Side::Sell, dec!(101.6), ZL, ZM, ZU, Some(dec!(101.2)), dec!(101.2)),
            GateAction::CancelOutOfZone
        );
        assert_eq!(
            gate_action(Side::Sell, dec!(100.9), ZL, ZM, ZU, None, dec!(101.2)),
            GateAction::Stay
        );
    }
}
