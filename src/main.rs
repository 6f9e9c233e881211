// =============================================================================
// Bollinger Engine — Main Entry Point
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod config;
mod control;
mod engine;
mod execution;
mod filters;
mod indicators;
mod market_data;
mod pending;
mod position;
mod risk;
mod signal;
mod state;
mod symbols;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::BinanceClient;
use crate::config::AppConfig;
use crate::control::{ControlHandle, Notification};
use crate::engine::Orchestrator;
use crate::execution::TradeExecutor;
use crate::market_data::MarketDataCache;
use crate::state::TradeStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Missing credentials are the only fatal startup condition.
    let cfg = AppConfig::from_env()?;
    info!(
        tick_seconds = cfg.tick_seconds,
        state_file = %cfg.state_file,
        symbols_file = %cfg.symbols_file,
        "bollinger engine starting"
    );

    // ── 2. Long-lived subsystems ─────────────────────────────────────────
    let store = Arc::new(TradeStore::load(&cfg.state_file));
    let client = Arc::new(BinanceClient::new(
        cfg.api_key.clone(),
        cfg.api_secret.clone(),
    ));
    let executor = Arc::new(TradeExecutor::new(client.clone()));
    let cache = Arc::new(MarketDataCache::new(client));
    let (control, mut notifications) = ControlHandle::new(true);

    // ── 3. Notification drain ────────────────────────────────────────────
    // The chat bot owns this receiver in production; without one attached
    // the engine logs every outbound notification instead.
    tokio::spawn(async move {
        while let Some(n) = notifications.recv().await {
            match n {
                Notification::SlFilled {
                    symbol,
                    direction,
                    quantity,
                    entry_price,
                    close_price,
                    pnl,
                    balance,
                    quote_asset,
                } => warn!(
                    %symbol, %direction, %quantity, %entry_price, %close_price,
                    %pnl, %balance, %quote_asset,
                    "notification: stop loss filled"
                ),
                Notification::TpFilled {
                    symbol,
                    direction,
                    quantity,
                    entry_price,
                    close_price,
                    pnl,
                    balance,
                    quote_asset,
                } => info!(
                    %symbol, %direction, %quantity, %entry_price, %close_price,
                    %pnl, %balance, %quote_asset,
                    "notification: take profit filled"
                ),
                Notification::SlUpdated {
                    symbol,
                    direction,
                    entry_price,
                    old_sl_price,
                    new_sl_price,
                } => info!(
                    %symbol, %direction, %entry_price, %old_sl_price, %new_sl_price,
                    "notification: stop loss updated"
                ),
                Notification::PositionWithoutSl {
                    symbol,
                    direction,
                    quantity,
                    entry_price,
                } => error!(
                    %symbol, %direction, %quantity, %entry_price,
                    "notification: POSITION WITHOUT STOP LOSS"
                ),
                Notification::UnknownClosure { symbol, direction } => warn!(
                    %symbol, %direction,
                    "notification: position closed outside the bracket"
                ),
                Notification::Notice { message } => info!(%message, "notification"),
            }
        }
    });

    // ── 4. Control loop ──────────────────────────────────────────────────
    let orchestrator = Orchestrator::new(
        cfg,
        store,
        executor,
        cache.clone(),
        control.clone(),
    );
    let loop_handle = tokio::spawn(orchestrator.run());

    info!("engine running — press Ctrl+C to stop");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    // Working exchange orders are intentionally left alone: persisted state
    // plus exchange queries reconcile them on the next start.
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");

    loop_handle.abort();
    cache.shutdown();
    control.notify_notice("engine stopped");

    info!("shutdown complete");
    Ok(())
}
