// =============================================================================
// Trade Executor — order-level operations over the exchange client
// =============================================================================
//
// Everything the trade lifecycle needs from the exchange lives behind this
// façade: filter-aware price/quantity conditioning, limit entries, the
// close-position protective orders, reduce-only market exits, status checks,
// tolerant cancellation, and realized-P&L reconstruction from account fills.
//
// Filters and the account's position mode are fetched once and cached for
// the run; both are immutable in practice.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::binance::{BinanceClient, OrderAck, OrderInfo, PositionInfo};
use crate::filters::SymbolFilters;
use crate::types::{OrderStatus, PositionSide, Side};

/// Reconstructed result of a position-closing order.
#[derive(Debug, Clone)]
pub struct ClosureDetails {
    pub realized_pnl: Decimal,
    pub avg_close_price: Decimal,
    pub closed_quantity: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
    pub close_time_ms: i64,
}

/// P&L from entry/close/quantity when no fill records are available.
pub(crate) fn fallback_pnl(
    side: PositionSide,
    entry: Decimal,
    close: Decimal,
    qty: Decimal,
) -> Decimal {
    match side {
        PositionSide::Long => (close - entry) * qty,
        PositionSide::Short => (entry - close) * qty,
    }
}

pub struct TradeExecutor {
    client: Arc<BinanceClient>,
    filters: RwLock<HashMap<String, Arc<SymbolFilters>>>,
    hedge_mode: RwLock<Option<bool>>,
}

impl TradeExecutor {
    pub fn new(client: Arc<BinanceClient>) -> Self {
        Self {
            client,
            filters: RwLock::new(HashMap::new()),
            hedge_mode: RwLock::new(None),
        }
    }

    pub fn client(&self) -> Arc<BinanceClient> {
        self.client.clone()
    }

    // -------------------------------------------------------------------------
    // Cached metadata
    // -------------------------------------------------------------------------

    /// Symbol filters, fetched once per symbol per run.
    pub async fn filters(&self, symbol: &str) -> Result<Arc<SymbolFilters>> {
        if let Some(f) = self.filters.read().get(symbol) {
            return Ok(f.clone());
        }
        let fetched = Arc::new(self.client.get_symbol_filters(symbol).await?);
        self.filters
            .write()
            .insert(symbol.to_string(), fetched.clone());
        Ok(fetched)
    }

    /// Whether the account runs in hedge mode. Queried once; a query failure
    /// is treated as one-way mode.
    pub async fn is_hedge_mode(&self) -> bool {
        if let Some(mode) = *self.hedge_mode.read() {
            return mode;
        }
        let mode = match self.client.is_hedge_mode().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "position-mode query failed — assuming one-way");
                false
            }
        };
        *self.hedge_mode.write() = Some(mode);
        mode
    }

    async fn position_side_param(&self, side: PositionSide) -> Option<&'static str> {
        if self.is_hedge_mode().await {
            Some(match side {
                PositionSide::Long => "LONG",
                PositionSide::Short => "SHORT",
            })
        } else {
            None
        }
    }

    /// Idempotent leverage setter.
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.client.set_leverage(symbol, leverage).await
    }

    // -------------------------------------------------------------------------
    // Order placement
    // -------------------------------------------------------------------------

    /// Place a GTC limit entry. Quantity and price are conditioned against
    /// the symbol filters before submission; a violation is an error, not a
    /// silently adjusted order.
    pub async fn place_limit_entry(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<OrderAck> {
        let filters = self.filters(symbol).await?;

        let qty = filters
            .round_qty(quantity)
            .context("entry quantity below symbol minimum")?;
        let price = filters.round_price(price);
        if price <= Decimal::ZERO {
            anyhow::bail!("entry price rounded to zero");
        }
        if !filters.meets_notional(qty, price) {
            anyhow::bail!(
                "entry notional {} below exchange minimum {}",
                qty * price,
                filters.min_notional
            );
        }

        let position_side = self.position_side_param(side.position_side()).await;
        let client_order_id = format!("bbe-{}", Uuid::new_v4().simple());

        let ack = self
            .client
            .place_limit_order(
                symbol,
                side.as_str(),
                &filters.fmt_qty(qty),
                &filters.fmt_price(price),
                position_side,
                Some(&client_order_id),
            )
            .await?;

        info!(
            symbol,
            %side,
            order_id = ack.order_id,
            status = ?ack.status,
            qty = %qty,
            price = %price,
            "limit entry placed"
        );
        Ok(ack)
    }

    /// Place the protective stop-loss as STOP_MARKET + closePosition. The
    /// order side is the opposite of the entry side.
    pub async fn place_stop_loss(
        &self,
        symbol: &str,
        entry_side: Side,
        sl_price: Decimal,
    ) -> Result<OrderAck> {
        let filters = self.filters(symbol).await?;
        let price = filters.round_price(sl_price);
        if price <= Decimal::ZERO {
            anyhow::bail!("stop price rounded to zero");
        }
        let position_side = self.position_side_param(entry_side.position_side()).await;

        let ack = self
            .client
            .place_stop_market(
                symbol,
                entry_side.opposite().as_str(),
                &filters.fmt_price(price),
                position_side,
            )
            .await?;

        info!(symbol, order_id = ack.order_id, stop = %price, "stop-loss placed");
        Ok(ack)
    }

    /// Place the take-profit as TAKE_PROFIT_MARKET + closePosition.
    pub async fn place_take_profit(
        &self,
        symbol: &str,
        entry_side: Side,
        tp_price: Decimal,
    ) -> Result<OrderAck> {
        let filters = self.filters(symbol).await?;
        let price = filters.round_price(tp_price);
        if price <= Decimal::ZERO {
            anyhow::bail!("take-profit price rounded to zero");
        }
        let position_side = self.position_side_param(entry_side.position_side()).await;

        let ack = self
            .client
            .place_take_profit_market(
                symbol,
                entry_side.opposite().as_str(),
                &filters.fmt_price(price),
                position_side,
            )
            .await?;

        info!(symbol, order_id = ack.order_id, target = %price, "take-profit placed");
        Ok(ack)
    }

    /// Immediate reduce-only market exit for the full position quantity.
    pub async fn market_close(
        &self,
        symbol: &str,
        entry_side: Side,
        quantity: Decimal,
    ) -> Result<OrderAck> {
        let filters = self.filters(symbol).await?;
        let qty = filters
            .round_qty(quantity.abs())
            .context("close quantity below symbol minimum")?;
        let position_side = self.position_side_param(entry_side.position_side()).await;

        let ack = self
            .client
            .place_market_order(
                symbol,
                entry_side.opposite().as_str(),
                &filters.fmt_qty(qty),
                true,
                position_side,
            )
            .await?;

        info!(symbol, order_id = ack.order_id, qty = %qty, "market close placed");
        Ok(ack)
    }

    // -------------------------------------------------------------------------
    // Order status / cancellation
    // -------------------------------------------------------------------------

    pub async fn check_order(&self, symbol: &str, order_id: u64) -> Result<OrderInfo> {
        self.client.get_order(symbol, order_id).await
    }

    /// Cancel an order when it is still live. Terminal states (filled,
    /// cancelled, expired, unknown) count as success — the order is gone
    /// either way. Returns `false` only when the exchange refused or the
    /// status could not be determined.
    pub async fn cancel_order_if_open(&self, symbol: &str, order_id: u64) -> bool {
        let info = match self.check_order(symbol, order_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(symbol, order_id, error = %e, "order status check failed — not cancelling");
                return false;
            }
        };

        if info.status.is_live() {
            match self.client.cancel_order(symbol, order_id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(symbol, order_id, error = %e, "cancel failed");
                    false
                }
            }
        } else {
            debug!(symbol, order_id = info.order_id, status = ?info.status, "order already terminal");
            true
        }
    }

    // -------------------------------------------------------------------------
    // Market / account reads
    // -------------------------------------------------------------------------

    pub async fn mark_price(&self, symbol: &str) -> Result<Decimal> {
        self.client.get_mark_price(symbol).await
    }

    pub async fn balance(&self, asset: &str) -> Result<Decimal> {
        self.client.get_balance(asset).await
    }

    /// The live position for a directional slot, or `None` when the exchange
    /// reports no (non-zero) position for that side.
    pub async fn position(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<PositionInfo>> {
        let positions = self.client.get_positions(symbol).await?;
        let hedge = self.is_hedge_mode().await;

        Ok(positions.into_iter().find(|p| {
            if p.amount == Decimal::ZERO {
                return false;
            }
            if hedge {
                p.position_side == side.as_str()
            } else {
                // One-way mode: the sign of the amount carries the direction.
                match side {
                    PositionSide::Long => p.amount > Decimal::ZERO,
                    PositionSide::Short => p.amount < Decimal::ZERO,
                }
            }
        }))
    }

    /// All non-zero positions for a symbol (force-close support).
    pub async fn open_positions(&self, symbol: &str) -> Result<Vec<PositionInfo>> {
        Ok(self
            .client
            .get_positions(symbol)
            .await?
            .into_iter()
            .filter(|p| p.amount != Decimal::ZERO)
            .collect())
    }

    // -------------------------------------------------------------------------
    // Closure reconstruction
    // -------------------------------------------------------------------------

    /// Reconstruct realized P&L, average close price, and closed quantity for
    /// a FILLED closing order. Account fills in a window around the fill time
    /// are preferred; when none are found the order's own average price and
    /// the recorded entry are used (commissions unknown on that path).
    pub async fn closure_details(
        &self,
        symbol: &str,
        closing_order_id: u64,
        entry_price: Decimal,
        position_side: PositionSide,
    ) -> Result<Option<ClosureDetails>> {
        let order = self.check_order(symbol, closing_order_id).await?;
        if order.status != OrderStatus::Filled {
            debug!(
                symbol,
                closing_order_id,
                status = ?order.status,
                "closure details requested for a non-filled order"
            );
            return Ok(None);
        }
        if order.executed_qty == Decimal::ZERO {
            warn!(symbol, closing_order_id, "filled order reports zero executed quantity");
            return Ok(None);
        }

        let start = order.update_time - 60_000;
        let end = order.update_time + 300_000;
        let fills = match self.client.get_account_trades(symbol, start, end).await {
            Ok(all) => all
                .into_iter()
                .filter(|f| f.order_id == closing_order_id)
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(symbol, error = %e, "account-trades query failed — using order fallback");
                Vec::new()
            }
        };

        if fills.is_empty() {
            let closed_qty = order.executed_qty;
            let close_price = order.avg_price;
            let pnl = fallback_pnl(position_side, entry_price, close_price, closed_qty);
            debug!(
                symbol,
                closing_order_id,
                pnl = %pnl,
                "closure reconstructed from order average price"
            );
            return Ok(Some(ClosureDetails {
                realized_pnl: pnl,
                avg_close_price: close_price,
                closed_quantity: closed_qty,
                commission: Decimal::ZERO,
                commission_asset: "USDT".to_string(),
                close_time_ms: order.update_time,
            }));
        }

        let mut pnl = Decimal::ZERO;
        let mut commission = Decimal::ZERO;
        let mut qty = Decimal::ZERO;
        let mut weighted = Decimal::ZERO;
        let mut commission_asset = String::new();
        let mut last_time = 0i64;
        for f in &fills {
            pnl += f.realized_pnl;
            commission += f.commission;
            qty += f.qty;
            weighted += f.price * f.qty;
            if commission_asset.is_empty() && !f.commission_asset.is_empty() {
                commission_asset = f.commission_asset.clone();
            }
            last_time = last_time.max(f.time);
        }
        if qty == Decimal::ZERO {
            warn!(symbol, closing_order_id, "fills sum to zero quantity");
            return Ok(None);
        }

        let details = ClosureDetails {
            realized_pnl: pnl,
            avg_close_price: weighted / qty,
            closed_quantity: qty,
            commission,
            commission_asset: if commission_asset.is_empty() {
                "USDT".to_string()
            } else {
                commission_asset
            },
            close_time_ms: if last_time > 0 {
                last_time
            } else {
                order.update_time
            },
        };
        debug!(
            symbol,
            closing_order_id,
            pnl = %details.realized_pnl,
            avg = %details.avg_close_price,
            qty = %details.closed_quantity,
            fills = fills.len(),
            "closure reconstructed from account fills"
        );
        Ok(Some(details))
    }
}

impl std::fmt::Debug for TradeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeExecutor")
            .field("cached_filters", &self.filters.read().len())
            .field("hedge_mode", &*self.hedge_mode.read())
            .finish()
    }
}
