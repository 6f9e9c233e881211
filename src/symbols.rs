// =============================================================================
// Symbol configuration — per-symbol strategy parameters, hot-reloaded
// =============================================================================
//
// The symbols file is a JSON object keyed by symbol. Every field carries a
// serde default so older files keep loading after new fields are added.
// Saving uses the atomic tmp + rename pattern. When no file exists a
// single-symbol default is generated from the process config and written
// back so the operator has something to edit.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AppConfig;

fn default_interval_primary() -> String {
    "5m".into()
}

fn default_interval_trigger() -> String {
    "1m".into()
}

fn default_ma_type() -> String {
    "SMA".into()
}

fn default_length() -> usize {
    20
}

fn default_mult_orig() -> f64 {
    2.0
}

fn default_mult_new() -> f64 {
    1.0
}

fn default_data_limit() -> usize {
    300
}

fn default_leverage() -> u32 {
    5
}

fn default_active() -> bool {
    true
}

/// Strategy parameters for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolConfig {
    /// Primary interval carrying the strategy bands (field name kept from the
    /// on-disk schema; any interval string is accepted).
    #[serde(rename = "interval_5m", default = "default_interval_primary")]
    pub primary_interval: String,

    /// Trigger interval used for entry gating.
    #[serde(rename = "interval_1m", default = "default_interval_trigger")]
    pub trigger_interval: String,

    #[serde(default = "default_ma_type")]
    pub ma_type: String,

    #[serde(default = "default_length")]
    pub length: usize,

    #[serde(default = "default_mult_orig")]
    pub mult_orig: f64,

    #[serde(default = "default_mult_new")]
    pub mult_new: f64,

    /// Candles to backfill for the primary interval.
    #[serde(rename = "data_limit_5m", default = "default_data_limit")]
    pub data_limit: usize,

    /// Fallback order quantity when no monetary risk mode resolves one.
    #[serde(default)]
    pub fixed_quantity: Decimal,

    #[serde(default = "default_leverage")]
    pub leverage: u32,

    #[serde(default = "default_active")]
    pub active: bool,
}

impl SymbolConfig {
    /// Build the default entry for a symbol from process-level defaults.
    pub fn from_defaults(cfg: &AppConfig) -> Self {
        Self {
            primary_interval: default_interval_primary(),
            trigger_interval: default_interval_trigger(),
            ma_type: cfg.bb.ma_type.clone(),
            length: cfg.bb.length,
            mult_orig: cfg.bb.mult_orig,
            mult_new: cfg.bb.mult_new,
            data_limit: cfg.bb.data_limit,
            fixed_quantity: Decimal::ZERO,
            leverage: cfg.default_leverage,
            active: true,
        }
    }
}

/// The full symbols map. BTreeMap keeps the on-disk ordering stable.
pub type SymbolsMap = BTreeMap<String, SymbolConfig>;

/// Load the symbols map from `path`. A missing file yields a generated
/// single-symbol default (written back); a corrupt file yields an empty map
/// with a warning rather than an error.
pub fn load_or_default(path: impl AsRef<Path>, cfg: &AppConfig) -> SymbolsMap {
    let path = path.as_ref();

    if !path.exists() {
        let mut map = SymbolsMap::new();
        map.insert(
            cfg.default_symbol.to_uppercase(),
            SymbolConfig::from_defaults(cfg),
        );
        info!(
            path = %path.display(),
            symbol = %cfg.default_symbol,
            "no symbols file — generated single-symbol default"
        );
        if let Err(e) = save(path, &map) {
            warn!(error = %e, "failed to write generated symbols file");
        }
        return map;
    }

    match load(path) {
        Ok(map) => map,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "symbols file unreadable — starting empty");
            SymbolsMap::new()
        }
    }
}

pub fn load(path: impl AsRef<Path>) -> Result<SymbolsMap> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read symbols config from {}", path.display()))?;
    let map: SymbolsMap = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse symbols config from {}", path.display()))?;
    info!(path = %path.display(), count = map.len(), "symbols config loaded");
    Ok(map)
}

/// Persist the map using an atomic write (tmp sibling + rename).
pub fn save(path: impl AsRef<Path>, map: &SymbolsMap) -> Result<()> {
    let path = path.as_ref();
    let content =
        serde_json::to_string_pretty(map).context("failed to serialise symbols config")?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write tmp symbols config to {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp symbols config to {}", path.display()))?;

    Ok(())
}

/// The subset of the map flagged active, symbols upper-cased.
pub fn active_symbols(map: &SymbolsMap) -> SymbolsMap {
    map.iter()
        .filter(|(_, c)| c.active)
        .map(|(s, c)| (s.to_uppercase(), c.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialise_empty_entry_uses_defaults() {
        let cfg: SymbolConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.primary_interval, "5m");
        assert_eq!(cfg.trigger_interval, "1m");
        assert_eq!(cfg.ma_type, "SMA");
        assert_eq!(cfg.length, 20);
        assert_eq!(cfg.leverage, 5);
        assert!(cfg.active);
        assert_eq!(cfg.fixed_quantity, Decimal::ZERO);
    }

    #[test]
    fn deserialise_partial_entry_fills_defaults() {
        let json = r#"{ "interval_5m": "15m", "leverage": 10, "active": false }"#;
        let cfg: SymbolConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.primary_interval, "15m");
        assert_eq!(cfg.leverage, 10);
        assert!(!cfg.active);
        assert_eq!(cfg.length, 20);
    }

    #[test]
    fn map_roundtrip_preserves_schema_field_names() {
        let mut map = SymbolsMap::new();
        let cfg: SymbolConfig = serde_json::from_str("{}").unwrap();
        map.insert("BTCUSDT".into(), cfg);

        let json = serde_json::to_string(&map).unwrap();
        assert!(json.contains("\"interval_5m\""));
        assert!(json.contains("\"data_limit_5m\""));

        let back: SymbolsMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back["BTCUSDT"].primary_interval, "5m");
    }

    #[test]
    fn active_filter_uppercases() {
        let mut map = SymbolsMap::new();
        let mut a: SymbolConfig = serde_json::from_str("{}").unwrap();
        a.active = true;
        let mut b: SymbolConfig = serde_json::from_str("{}").unwrap();
        b.active = false;
        map.insert("ethusdt".into(), a);
        map.insert("BTCUSDT".into(), b);

        let active = active_symbols(&map);
        assert_eq!(active.len(), 1);
        assert!(active.contains_key("ETHUSDT"));
    }
}
