// =============================================================================
// Process configuration — credentials, risk flags, strategy defaults
// =============================================================================
//
// Everything here comes from the environment (optionally a .env file). Only
// the API credentials are fatal when absent; every other knob has a default.
// Per-symbol strategy parameters live in symbols_config.json (see symbols.rs).
// =============================================================================

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::warn;

/// Interval whose Bollinger basis defines the stop-loss reference. Pinned
/// globally, not per symbol.
pub const SL_REFERENCE_INTERVAL: &str = "15m";

/// How the base monetary risk of a trade is determined.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Risk a fixed quote amount per trade.
    pub use_fixed_monetary_risk: bool,
    /// The fixed amount, in quote asset, when `use_fixed_monetary_risk`.
    pub fixed_monetary_risk_per_trade: Decimal,
    /// Risk a percentage of the current quote balance per trade.
    pub use_percentage_risk: bool,
    /// The percentage (e.g. 0.2 means 0.2 %) when `use_percentage_risk`.
    pub risk_percentage_per_trade: Decimal,
    /// Scale the next trade's risk to recover accumulated losses.
    pub use_martingale: bool,
    /// Reward/risk multiplier K: TP distance = K * SL distance, and the
    /// martingale adjustment is accumulated_loss / K.
    pub risk_reward_multiplier: Decimal,
}

/// Default Bollinger parameters applied when a symbol entry omits them.
#[derive(Debug, Clone)]
pub struct BbDefaults {
    pub ma_type: String,
    pub length: usize,
    pub mult_orig: f64,
    pub mult_new: f64,
    pub data_limit: usize,
}

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub api_secret: String,
    /// Control-loop cadence in seconds.
    pub tick_seconds: u64,
    pub state_file: String,
    pub symbols_file: String,
    /// Seeded into symbols_config.json when no symbol file exists.
    pub default_symbol: String,
    pub default_leverage: u32,
    pub risk: RiskConfig,
    pub bb: BbDefaults,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable env value — using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl AppConfig {
    /// Read configuration from the environment. Missing credentials are the
    /// only fatal condition in the whole startup path.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
        if api_key.is_empty() || api_secret.is_empty() {
            bail!("BINANCE_API_KEY / BINANCE_API_SECRET are not set");
        }

        let risk = RiskConfig {
            use_fixed_monetary_risk: env_flag("USE_FIXED_MONETARY_RISK", true),
            fixed_monetary_risk_per_trade: env_or(
                "FIXED_MONETARY_RISK_PER_TRADE",
                Decimal::new(5, 1), // 0.5
            ),
            use_percentage_risk: env_flag("USE_PERCENTAGE_RISK", false),
            risk_percentage_per_trade: env_or("RISK_PERCENTAGE_PER_TRADE", Decimal::new(2, 1)),
            use_martingale: env_flag("USE_MARTINGALE_LOSS_RECOVERY", true),
            risk_reward_multiplier: env_or("RISK_REWARD_MULTIPLIER", Decimal::from(10)),
        };

        if risk.use_martingale && risk.risk_reward_multiplier <= Decimal::ZERO {
            warn!(
                multiplier = %risk.risk_reward_multiplier,
                "martingale enabled but risk_reward_multiplier <= 0 — recovery will not engage"
            );
        }

        let bb = BbDefaults {
            ma_type: std::env::var("BB_MA_TYPE").unwrap_or_else(|_| "SMA".into()),
            length: env_or("BB_LENGTH", 20usize),
            mult_orig: env_or("BB_MULT_ORIG", 2.0f64),
            mult_new: env_or("BB_MULT_NEW", 1.0f64),
            data_limit: env_or("BB_DATA_LIMIT", 300usize),
        };

        Ok(Self {
            api_key,
            api_secret,
            tick_seconds: env_or("TICK_SECONDS", 15u64),
            state_file: std::env::var("STATE_FILE")
                .unwrap_or_else(|_| "bot_trading_state.json".into()),
            symbols_file: std::env::var("SYMBOLS_CONFIG_FILE")
                .unwrap_or_else(|_| "symbols_config.json".into()),
            default_symbol: std::env::var("DEFAULT_SYMBOL").unwrap_or_else(|_| "BNBUSDT".into()),
            default_leverage: env_or("DEFAULT_LEVERAGE", 5u32),
            risk,
            bb,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_missing() {
        assert_eq!(env_or("DEFINITELY_NOT_SET_ANYWHERE_123", 42u64), 42);
    }

    #[test]
    fn env_flag_default_applies() {
        assert!(env_flag("ALSO_NOT_SET_ANYWHERE_123", true));
        assert!(!env_flag("ALSO_NOT_SET_ANYWHERE_456", false));
    }
}
