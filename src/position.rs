// =============================================================================
// Position Manager — protective-order lifecycle and closure accounting
// =============================================================================
//
// Runs once per control tick for every slot in POSITION_OPEN, in order:
//
//   1. Stop-loss fill   → realize P&L, cancel the TP, accrue martingale loss.
//   2. Take-profit fill → realize P&L, cancel the SL, reset martingale debt.
//   3. Position gone without either fill → unknown-closure alert, clean up.
//   4. Position alive but unprotected → one-shot "no SL" alert via sentinel.
//
// Only an exchange-reported FILLED status counts as a closure; any other
// terminal status means "order gone" and never moves the loss baseline.
// =============================================================================

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::control::{ControlHandle, Notification};
use crate::execution::{ClosureDetails, TradeExecutor};
use crate::state::{OpenPosition, TradeSlot, TradeStore};
use crate::types::{no_sl_sentinel_key, OrderStatus};

/// Everything an open-slot pass needs, borrowed from the orchestrator.
pub struct PositionContext<'a> {
    pub store: &'a TradeStore,
    pub executor: &'a TradeExecutor,
    pub control: &'a ControlHandle,
    pub martingale_enabled: bool,
}

/// Which protective order closed the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClosureKind {
    StopLoss,
    TakeProfit,
}

/// What a confirmed closure does to the slot's accumulated loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LossUpdate {
    Add(Decimal),
    Reset,
    Unchanged,
}

/// Martingale bookkeeping rule:
/// - a losing SL closure accrues |pnl|;
/// - a non-losing TP closure clears the debt, but only when the trade was
///   opened against a nonzero balance;
/// - everything else leaves the baseline alone.
pub(crate) fn loss_update(
    kind: ClosureKind,
    martingale_enabled: bool,
    pnl: Decimal,
    loss_at_entry: Decimal,
) -> LossUpdate {
    if !martingale_enabled {
        return LossUpdate::Unchanged;
    }
    match kind {
        ClosureKind::StopLoss if pnl < Decimal::ZERO => LossUpdate::Add(pnl.abs()),
        ClosureKind::TakeProfit if pnl >= Decimal::ZERO && loss_at_entry > Decimal::ZERO => {
            LossUpdate::Reset
        }
        _ => LossUpdate::Unchanged,
    }
}

// ---------------------------------------------------------------------------
// Tick driver
// ---------------------------------------------------------------------------

/// Manage one open position for one tick.
pub async fn manage_open(ctx: &PositionContext<'_>, key: &str, mut pos: OpenPosition) {
    let symbol = pos.symbol.clone();

    // --- 1. Stop-loss check -----------------------------------------------
    if let Some(sl_id) = pos.sl_order_id {
        match ctx.executor.check_order(&symbol, sl_id).await {
            Ok(info) if info.status == OrderStatus::Filled => {
                info!(key, sl_id, "STOP LOSS filled");
                handle_closure(ctx, key, &pos, sl_id, ClosureKind::StopLoss).await;
                return;
            }
            Ok(info) if !info.status.is_live() => {
                warn!(
                    key,
                    sl_id,
                    status = ?info.status,
                    "stop-loss order no longer active — position may be unprotected"
                );
                pos.sl_order_id = None;
                ctx.store.set(key, TradeSlot::Open(pos.clone()));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(key, sl_id, error = %e, "stop-loss status check failed — retrying next tick");
                return;
            }
        }
    }

    // --- 2. Take-profit check ---------------------------------------------
    if let Some(tp_id) = pos.tp_order_id {
        match ctx.executor.check_order(&symbol, tp_id).await {
            Ok(info) if info.status == OrderStatus::Filled => {
                info!(key, tp_id, "TAKE PROFIT filled");
                handle_closure(ctx, key, &pos, tp_id, ClosureKind::TakeProfit).await;
                return;
            }
            Ok(info) if !info.status.is_live() => {
                warn!(key, tp_id, status = ?info.status, "take-profit order no longer active");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(key, tp_id, error = %e, "take-profit status check failed");
            }
        }
    }

    // --- 3. Position-existence check --------------------------------------
    let live = match ctx.executor.position(&symbol, pos.position_side).await {
        Ok(Some(live)) => {
            debug!(
                key,
                amount = %live.amount,
                entry = %live.entry_price,
                upnl = %live.unrealized_pnl,
                "position alive on exchange"
            );
            live
        }
        Ok(None) => {
            warn!(
                key,
                "position vanished from the exchange without a protective fill — unknown closure"
            );
            ctx.control.notify(Notification::UnknownClosure {
                symbol: symbol.clone(),
                direction: pos.position_side,
            });
            if let Some(id) = pos.sl_order_id {
                ctx.executor.cancel_order_if_open(&symbol, id).await;
            }
            if let Some(id) = pos.tp_order_id {
                ctx.executor.cancel_order_if_open(&symbol, id).await;
            }
            ctx.store.clear(key, "position not found on exchange (unknown closure)");
            ctx.store
                .clear(&no_sl_sentinel_key(key), "position disappeared");
            return;
        }
        Err(e) => {
            warn!(key, error = %e, "position query failed — retrying next tick");
            return;
        }
    };

    // --- 4. Unprotected-position detection --------------------------------
    let sl_active = match pos.sl_order_id {
        Some(id) => match ctx.executor.check_order(&symbol, id).await {
            Ok(info) => info.status.is_live(),
            Err(e) => {
                warn!(key, error = %e, "SL re-check failed — assuming still active");
                true
            }
        },
        None => false,
    };

    let sentinel = no_sl_sentinel_key(key);
    if !sl_active {
        if ctx.store.get(&sentinel).is_none() {
            warn!(key, "open position without an active stop loss — alerting once");
            // Prefer the exchange's own view of the exposure in the alert.
            let alert_qty = if live.amount != Decimal::ZERO {
                live.amount.abs()
            } else {
                pos.quantity.abs()
            };
            let alert_entry = if live.entry_price > Decimal::ZERO {
                live.entry_price
            } else {
                pos.entry_price_actual
            };
            ctx.control.notify(Notification::PositionWithoutSl {
                symbol: symbol.clone(),
                direction: pos.position_side,
                quantity: alert_qty,
                entry_price: alert_entry,
            });
            ctx.store.set(
                &sentinel,
                TradeSlot::AlertSentinel {
                    alert_sent_at: chrono::Utc::now(),
                },
            );
        }
    } else if ctx.store.get(&sentinel).is_some() {
        info!(key, "stop loss active again — clearing no-SL alert sentinel");
        ctx.store.clear(&sentinel, "SL for position is active again");
    }
}

/// Shared closure path for both protective orders.
async fn handle_closure(
    ctx: &PositionContext<'_>,
    key: &str,
    pos: &OpenPosition,
    closing_order_id: u64,
    kind: ClosureKind,
) {
    let symbol = pos.symbol.clone();

    let closure = match ctx
        .executor
        .closure_details(
            &symbol,
            closing_order_id,
            pos.entry_price_actual,
            pos.position_side,
        )
        .await
    {
        Ok(Some(details)) => details,
        Ok(None) | Err(_) => {
            warn!(key, closing_order_id, "closure details unavailable — using zero P&L record");
            ClosureDetails {
                realized_pnl: Decimal::ZERO,
                avg_close_price: Decimal::ZERO,
                closed_quantity: pos.quantity.abs(),
                commission: Decimal::ZERO,
                commission_asset: "USDT".to_string(),
                close_time_ms: 0,
            }
        }
    };

    let quote_asset = match ctx.executor.filters(&symbol).await {
        Ok(f) => f.quote_asset.clone(),
        Err(_) => "USDT".to_string(),
    };
    let balance = ctx
        .executor
        .balance(&quote_asset)
        .await
        .unwrap_or(Decimal::ZERO);

    let pnl = closure.realized_pnl;
    info!(
        key,
        ?kind,
        pnl = %pnl,
        close = %closure.avg_close_price,
        qty = %closure.closed_quantity,
        commission = %closure.commission,
        commission_asset = %closure.commission_asset,
        close_time_ms = closure.close_time_ms,
        "position closed"
    );

    let notification = match kind {
        ClosureKind::StopLoss => Notification::SlFilled {
            symbol: symbol.clone(),
            direction: pos.position_side,
            quantity: closure.closed_quantity,
            entry_price: pos.entry_price_actual,
            close_price: closure.avg_close_price,
            pnl,
            balance,
            quote_asset,
        },
        ClosureKind::TakeProfit => Notification::TpFilled {
            symbol: symbol.clone(),
            direction: pos.position_side,
            quantity: closure.closed_quantity,
            entry_price: pos.entry_price_actual,
            close_price: closure.avg_close_price,
            pnl,
            balance,
            quote_asset,
        },
    };
    ctx.control.notify(notification);

    match loss_update(kind, ctx.martingale_enabled, pnl, pos.accumulated_loss_at_entry) {
        LossUpdate::Add(amount) => ctx.store.add_accumulated_loss(key, amount),
        LossUpdate::Reset => ctx.store.reset_accumulated_loss(key),
        LossUpdate::Unchanged => {
            debug!(key, "accumulated loss unchanged by this closure");
        }
    }

    // Cancel the surviving half of the bracket.
    let survivor = match kind {
        ClosureKind::StopLoss => pos.tp_order_id,
        ClosureKind::TakeProfit => pos.sl_order_id,
    };
    if let Some(id) = survivor {
        ctx.executor.cancel_order_if_open(&symbol, id).await;
    }

    let reason = match kind {
        ClosureKind::StopLoss => format!("SL hit @ {}", closure.avg_close_price),
        ClosureKind::TakeProfit => format!("TP hit @ {}", closure.avg_close_price),
    };
    ctx.store.clear(key, &reason);
    ctx.store
        .clear(&no_sl_sentinel_key(key), "position closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::fallback_pnl;
    use crate::types::PositionSide;
    use rust_decimal_macros::dec;

    #[test]
    fn sl_loss_accrues_absolute_pnl() {
        // Long 1.25 @ 100.78 stopped at 100.0: pnl = -0.975.
        let pnl = fallback_pnl(PositionSide::Long, dec!(100.78), dec!(100.0), dec!(1.25));
        assert_eq!(pnl, dec!(-0.975));
        assert_eq!(
            loss_update(ClosureKind::StopLoss, true, pnl, dec!(0)),
            LossUpdate::Add(dec!(0.975))
        );
    }

    #[test]
    fn tp_resets_only_with_prior_debt() {
        assert_eq!(
            loss_update(ClosureKind::TakeProfit, true, dec!(9.5), dec!(0.975)),
            LossUpdate::Reset
        );
        assert_eq!(
            loss_update(ClosureKind::TakeProfit, true, dec!(9.5), dec!(0)),
            LossUpdate::Unchanged
        );
    }

    #[test]
    fn breakeven_tp_counts_as_recovery() {
        assert_eq!(
            loss_update(ClosureKind::TakeProfit, true, dec!(0), dec!(1)),
            LossUpdate::Reset
        );
    }

    #[test]
    fn losing_tp_never_resets() {
        assert_eq!(
            loss_update(ClosureKind::TakeProfit, true, dec!(-0.1), dec!(1)),
            LossUpdate::Unchanged
        );
    }

    #[test]
    fn winning_sl_does_not_accrue() {
        // An SL that happens to close in profit must not add to the debt.
        assert_eq!(
            loss_update(ClosureKind::StopLoss, true, dec!(0.2), dec!(0)),
            LossUpdate::Unchanged
        );
    }

    #[test]
    fn martingale_disabled_never_touches_baseline() {
        assert_eq!(
            loss_update(ClosureKind::StopLoss, false, dec!(-5), dec!(0)),
            LossUpdate::Unchanged
        );
        assert_eq!(
            loss_update(ClosureKind::TakeProfit, false, dec!(5), dec!(3)),
            LossUpdate::Unchanged
        );
    }

    #[test]
    fn short_pnl_is_mirrored() {
        let pnl = fallback_pnl(PositionSide::Short, dec!(100.0), dec!(98.0), dec!(2));
        assert_eq!(pnl, dec!(4.0));
        let pnl = fallback_pnl(PositionSide::Short, dec!(100.0), dec!(101.0), dec!(2));
        assert_eq!(pnl, dec!(-2.0));
    }
}
