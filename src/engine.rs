// =============================================================================
// Orchestrator — the per-tick control loop
// =============================================================================
//
// Every tick (default 15 s):
//   1. reload the symbols file (≤ every 5 min) and publish the view;
//   2. ensure market-data subscriptions for each active symbol's intervals;
//   3. dispatch both directional slots of every active symbol — pending and
//      open slots are always managed, new signals only while trading is
//      globally enabled;
//   4. drain operator commands (force-close), so a cleared slot stays empty
//      until at least the next tick;
//   5. sleep whatever remains of the tick, stretched when the exchange
//      reports rate-limit pressure.
//
// Per-symbol failures are contained: an error on one symbol never stops the
// loop or the other symbols.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::binance::ApiError;
use crate::config::{AppConfig, SL_REFERENCE_INTERVAL};
use crate::control::{ControlCommand, ControlHandle};
use crate::execution::TradeExecutor;
use crate::indicators::BbParams;
use crate::market_data::{BandName, MarketDataCache};
use crate::pending::{self, PendingContext};
use crate::position::{self, PositionContext};
use crate::risk::RiskEngine;
use crate::signal;
use crate::state::{PendingTrade, TradeSlot, TradeStore};
use crate::symbols::{self, SymbolConfig, SymbolsMap};
use crate::types::{no_sl_sentinel_key, slot_key, PositionSide, Side};

/// How often the symbols file is re-read.
const CONFIG_RELOAD_SECS: u64 = 300;

/// Extra sleep applied when the request-weight budget is nearly exhausted.
const RATE_LIMIT_BACKOFF_SECS: u64 = 60;

pub struct Orchestrator {
    cfg: AppConfig,
    store: Arc<TradeStore>,
    executor: Arc<TradeExecutor>,
    cache: Arc<MarketDataCache>,
    control: Arc<ControlHandle>,
    risk: RiskEngine,
    symbols: SymbolsMap,
    last_reload: Instant,
}

impl Orchestrator {
    pub fn new(
        cfg: AppConfig,
        store: Arc<TradeStore>,
        executor: Arc<TradeExecutor>,
        cache: Arc<MarketDataCache>,
        control: Arc<ControlHandle>,
    ) -> Self {
        let risk = RiskEngine::new(cfg.risk.clone());
        let symbols = symbols::load_or_default(&cfg.symbols_file, &cfg);
        control.publish_symbols(symbols.clone());
        Self {
            cfg,
            store,
            executor,
            cache,
            control,
            risk,
            symbols,
            last_reload: Instant::now(),
        }
    }

    /// Run the control loop until the task is aborted.
    pub async fn run(mut self) {
        info!(tick_seconds = self.cfg.tick_seconds, "control loop started");
        self.control.notify_notice("engine started — monitoring symbols");

        loop {
            let tick_started = Instant::now();

            if self.last_reload.elapsed() >= Duration::from_secs(CONFIG_RELOAD_SECS) {
                self.reload_symbols();
            }

            let active = symbols::active_symbols(&self.symbols);
            if active.is_empty() {
                debug!("no active symbols this tick");
            } else {
                self.ensure_subscriptions(&active);

                let trading_enabled = self.control.is_trading_enabled();
                if !trading_enabled {
                    debug!("trading disabled — managing existing slots only");
                }

                for (symbol, sym_cfg) in &active {
                    self.process_symbol(symbol, sym_cfg, trading_enabled).await;
                }

                // Commands drain after dispatch: a slot cleared by a
                // force-close stays empty until at least the next tick.
                self.handle_commands(&active).await;
            }

            // Honor the tick cadence; never a negative sleep.
            let elapsed = tick_started.elapsed();
            let tick = Duration::from_secs(self.cfg.tick_seconds);
            let mut sleep_for = tick.saturating_sub(elapsed);
            if self.executor.client().rate_limits().is_saturated() {
                warn!("request-weight budget nearly exhausted — stretching tick sleep");
                sleep_for += Duration::from_secs(RATE_LIMIT_BACKOFF_SECS);
            }
            debug!(
                work_ms = elapsed.as_millis() as u64,
                sleep_ms = sleep_for.as_millis() as u64,
                "tick complete"
            );
            tokio::time::sleep(sleep_for).await;
        }
    }

    // -------------------------------------------------------------------------
    // Configuration / subscriptions
    // -------------------------------------------------------------------------

    fn reload_symbols(&mut self) {
        self.last_reload = Instant::now();
        let reloaded = symbols::load_or_default(&self.cfg.symbols_file, &self.cfg);
        if reloaded != self.symbols {
            info!(count = reloaded.len(), "symbols configuration changed on reload");
        }
        self.symbols = reloaded;
        self.control.publish_symbols(self.symbols.clone());
    }

    fn ensure_subscriptions(&self, active: &SymbolsMap) {
        for (symbol, cfg) in active {
            let bb = BbParams::new(
                cfg.ma_type.clone(),
                cfg.length,
                cfg.mult_orig,
                cfg.mult_new,
            );
            // Primary and SL-reference intervals need derivable bands; the
            // trigger interval only supplies raw candles.
            if !self.cache.is_subscribed(symbol, &cfg.primary_interval) {
                self.cache.clone().subscribe(
                    symbol,
                    &cfg.primary_interval,
                    cfg.data_limit,
                    Some(bb.clone()),
                );
            }
            if !self.cache.is_subscribed(symbol, SL_REFERENCE_INTERVAL) {
                self.cache
                    .clone()
                    .subscribe(symbol, SL_REFERENCE_INTERVAL, cfg.data_limit, Some(bb));
            }
            if !self.cache.is_subscribed(symbol, &cfg.trigger_interval) {
                self.cache.clone().subscribe(
                    symbol,
                    &cfg.trigger_interval,
                    cfg.data_limit.min(100),
                    None,
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Operator commands
    // -------------------------------------------------------------------------

    async fn handle_commands(&self, active: &SymbolsMap) {
        for cmd in self.control.drain_commands() {
            match cmd {
                ControlCommand::ForceCloseSymbol(symbol) => {
                    let symbol = symbol.to_uppercase();
                    if !active.contains_key(&symbol) {
                        warn!(symbol, "force-close for a symbol not currently active");
                    }
                    self.force_close_symbol(&symbol).await;
                }
            }
        }
    }

    /// Market-close every live position of a symbol and clear its slots.
    async fn force_close_symbol(&self, symbol: &str) {
        info!(symbol, "force-closing all positions");

        for side in [PositionSide::Long, PositionSide::Short] {
            let key = slot_key(symbol, side);

            // Cancel whatever orders the slot is tracking.
            match self.store.get(&key) {
                Some(TradeSlot::Pending(t)) => {
                    if let Some(id) = t.current_entry_order_id {
                        self.executor.cancel_order_if_open(symbol, id).await;
                    }
                }
                Some(TradeSlot::Open(p)) => {
                    if let Some(id) = p.sl_order_id {
                        self.executor.cancel_order_if_open(symbol, id).await;
                    }
                    if let Some(id) = p.tp_order_id {
                        self.executor.cancel_order_if_open(symbol, id).await;
                    }
                }
                _ => {}
            }

            self.store.clear(&key, "force-close requested by operator");
            self.store
                .clear(&no_sl_sentinel_key(&key), "force-close requested by operator");
        }

        match self.executor.open_positions(symbol).await {
            Ok(positions) => {
                for p in positions {
                    let entry_side = if p.amount > Decimal::ZERO {
                        Side::Buy
                    } else {
                        Side::Sell
                    };
                    match self.executor.market_close(symbol, entry_side, p.amount).await {
                        Ok(ack) => info!(
                            symbol = %p.symbol,
                            position_side = %p.position_side,
                            order_id = ack.order_id,
                            "force-close order placed"
                        ),
                        Err(e) => {
                            error!(symbol, error = %e, "force-close market order failed")
                        }
                    }
                }
            }
            Err(e) => error!(symbol, error = %e, "force-close position query failed"),
        }

        self.control
            .notify_notice(format!("{symbol}: force-close executed"));
    }

    // -------------------------------------------------------------------------
    // Per-symbol dispatch
    // -------------------------------------------------------------------------

    async fn process_symbol(&self, symbol: &str, sym_cfg: &SymbolConfig, trading_enabled: bool) {
        if let Err(e) = self.executor.set_leverage(symbol, sym_cfg.leverage).await {
            warn!(symbol, leverage = sym_cfg.leverage, error = %e, "leverage setup failed — skipping symbol this tick");
            if let Some(api) = e.downcast_ref::<ApiError>() {
                if api.code == ApiError::TOO_MANY_REQUESTS {
                    warn!("exchange rate limit hit — backing off before the next symbol");
                    tokio::time::sleep(Duration::from_secs(RATE_LIMIT_BACKOFF_SECS)).await;
                }
            }
            return;
        }

        // Contextual snapshot of the market data feeding this symbol.
        if let Some(series) = self.cache.series(symbol, &sym_cfg.trigger_interval) {
            if let Some(last) = series.last() {
                debug!(
                    symbol,
                    trigger_candles = series.len(),
                    primary_candles = self.cache.len(symbol, &sym_cfg.primary_interval),
                    last_low = %last.low,
                    last_high = %last.high,
                    bbm_primary = ?self.cache.band(symbol, &sym_cfg.primary_interval, BandName::BbmOrig),
                    bbm_sl_ref = ?self.cache.band(symbol, SL_REFERENCE_INTERVAL, BandName::BbmOrig),
                    "market snapshot"
                );
            }
        }

        // The two directional slots are processed strictly one after the
        // other; cross-symbol ordering carries no guarantee.
        for side in [PositionSide::Long, PositionSide::Short] {
            let key = slot_key(symbol, side);
            match self.store.get(&key) {
                Some(TradeSlot::Pending(trade)) => {
                    let ctx = PendingContext {
                        store: &self.store,
                        executor: &self.executor,
                        cache: &self.cache,
                        control: &self.control,
                        symbol_cfg: sym_cfg,
                        reward_multiplier: self.risk.reward_multiplier(),
                        tick_seconds: self.cfg.tick_seconds,
                    };
                    pending::manage_pending(&ctx, &key, trade).await;
                }
                Some(TradeSlot::Open(pos)) => {
                    let ctx = PositionContext {
                        store: &self.store,
                        executor: &self.executor,
                        control: &self.control,
                        martingale_enabled: self.risk.martingale_enabled(),
                    };
                    position::manage_open(&ctx, &key, pos).await;
                }
                Some(TradeSlot::AlertSentinel { .. }) => {
                    // A sentinel under a slot key is leftover noise; the real
                    // sentinels live under their derived keys.
                    warn!(key, "sentinel payload found under a slot key — clearing");
                    self.store.clear(&key, "sentinel under slot key");
                }
                None => {
                    if trading_enabled {
                        self.try_open_pending(symbol, sym_cfg, side, &key).await;
                    }
                }
            }
        }
    }

    /// Evaluate, size, and seed a fresh pending slot for an empty key.
    async fn try_open_pending(
        &self,
        symbol: &str,
        sym_cfg: &SymbolConfig,
        side: PositionSide,
        key: &str,
    ) {
        let Some(candidate) = signal::evaluate(&self.cache, symbol, sym_cfg, side.entry_side())
        else {
            return;
        };
        info!(
            symbol,
            %side,
            entry = %candidate.entry_price_target,
            sl_ref = %candidate.stop_loss_price_ref,
            "signal candidate detected"
        );

        let filters = match self.executor.filters(symbol).await {
            Ok(f) => f,
            Err(e) => {
                warn!(symbol, error = %e, "filters unavailable — signal skipped");
                return;
            }
        };

        let balance = if self.risk.needs_balance() {
            match self.executor.balance(&filters.quote_asset).await {
                Ok(b) => Some(b),
                Err(e) => {
                    warn!(symbol, error = %e, "balance unavailable for percentage sizing");
                    None
                }
            }
        } else {
            None
        };

        let accumulated_loss = self.store.accumulated_loss(key);
        let Some(validated) = self.risk.size_and_validate(
            &candidate,
            accumulated_loss,
            balance,
            sym_cfg.fixed_quantity,
            &filters,
        ) else {
            info!(symbol, %side, "signal did not survive sizing/validation");
            return;
        };

        // Snapshot the bands backing the precondition and the gating zone.
        let primary = self
            .cache
            .contextual_bands(symbol, &sym_cfg.primary_interval);

        let trade = PendingTrade {
            symbol: symbol.to_string(),
            signal_type: validated.side,
            position_side: side,
            target_entry_price: validated.entry,
            target_sl_price: validated.sl,
            target_tp_price: validated.tp,
            quantity: validated.quantity,
            leverage: sym_cfg.leverage,
            signal_ts: candidate.trigger_ts,
            last_primary_update: Utc::now(),
            current_entry_order_id: None,
            pre_check_bbl_orig_primary: primary
                .as_ref()
                .map(|b| filters.round_price(b.bbl_orig)),
            pre_check_bbu_orig_primary: primary
                .as_ref()
                .map(|b| filters.round_price(b.bbu_orig)),
            pre_check_bbm_sl_ref: Some(validated.sl),
            gate_band_lower: primary.as_ref().map(|b| filters.round_price(b.bbl_new)),
            gate_band_upper: primary.as_ref().map(|b| filters.round_price(b.bbu_new)),
            gating_bbm_orig_primary: primary
                .as_ref()
                .map(|b| filters.round_price(b.bbm_orig)),
            target_monetary_risk: validated.r_effective,
            accumulated_loss_at_entry: accumulated_loss,
        };

        info!(
            key,
            entry = %trade.target_entry_price,
            sl = %trade.target_sl_price,
            tp = %trade.target_tp_price,
            qty = %trade.quantity,
            risk = %trade.target_monetary_risk,
            "pending slot seeded"
        );
        self.store.set(key, TradeSlot::Pending(trade));
    }
}
