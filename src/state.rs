// =============================================================================
// Persistent trading state — active trade slots + accumulated losses
// =============================================================================
//
// One JSON file with two sections:
//
//   { "active_trades": { "BTCUSDT_LONG": { "status": ..., ... }, ... },
//     "accumulated_losses": { "BTCUSDT_LONG": "0.975", ... } }
//
// Decimals serialize as strings and timestamps as RFC-3339 UTC, so a
// load/save cycle is byte-stable (BTreeMap keeps key order deterministic).
// The file is rewritten after every mutation with the atomic tmp + rename
// pattern. A corrupt file yields an empty in-memory state with a warning —
// never a crash.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{PositionSide, Side};

// ---------------------------------------------------------------------------
// Slot payloads
// ---------------------------------------------------------------------------

/// Payload of a slot waiting for its dynamically managed limit entry to fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTrade {
    pub symbol: String,
    pub signal_type: Side,
    pub position_side: PositionSide,
    pub target_entry_price: Decimal,
    pub target_sl_price: Decimal,
    pub target_tp_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,
    pub signal_ts: DateTime<Utc>,
    /// When the primary-interval refresh last ran for this slot.
    pub last_primary_update: DateTime<Utc>,
    /// Working limit order at the exchange, when one exists.
    #[serde(default)]
    pub current_entry_order_id: Option<u64>,
    // Snapshot of the bands backing the signal's precondition, refreshed by
    // the primary-interval update and re-verified every tick.
    #[serde(default)]
    pub pre_check_bbl_orig_primary: Option<Decimal>,
    #[serde(default)]
    pub pre_check_bbu_orig_primary: Option<Decimal>,
    #[serde(default)]
    pub pre_check_bbm_sl_ref: Option<Decimal>,
    // Bounds of the trigger-interval gating zone.
    #[serde(default)]
    pub gate_band_lower: Option<Decimal>,
    #[serde(default)]
    pub gate_band_upper: Option<Decimal>,
    #[serde(default)]
    pub gating_bbm_orig_primary: Option<Decimal>,
    /// Monetary risk this trade was sized for (post-mortem accounting).
    pub target_monetary_risk: Decimal,
    /// Accumulated loss at the moment the slot was seeded.
    pub accumulated_loss_at_entry: Decimal,
}

/// Payload of a slot holding an open position with protective orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub quantity: Decimal,
    pub entry_price_actual: Decimal,
    #[serde(default)]
    pub sl_order_id: Option<u64>,
    #[serde(default)]
    pub tp_order_id: Option<u64>,
    /// Carried from the pending phase for the martingale reset decision.
    pub accumulated_loss_at_entry: Decimal,
}

/// One entry in `active_trades`. The EMPTY state is the absence of the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum TradeSlot {
    #[serde(rename = "PENDING_DYNAMIC_LIMIT")]
    Pending(PendingTrade),
    #[serde(rename = "POSITION_OPEN")]
    Open(OpenPosition),
    /// One-shot alert marker (e.g. `{slot}_NO_SL_ALERT_SENT`).
    #[serde(rename = "ALERT_SENTINEL")]
    AlertSentinel { alert_sent_at: DateTime<Utc> },
}

impl TradeSlot {
    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Pending(_) => "PENDING_DYNAMIC_LIMIT",
            Self::Open(_) => "POSITION_OPEN",
            Self::AlertSentinel { .. } => "ALERT_SENTINEL",
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    active_trades: BTreeMap<String, TradeSlot>,
    #[serde(default)]
    accumulated_losses: BTreeMap<String, Decimal>,
}

/// Durable trading state. Single writer (the control loop); every mutation is
/// persisted before the call returns.
pub struct TradeStore {
    path: PathBuf,
    inner: Mutex<StoreData>,
}

impl TradeStore {
    /// Load state from `path`, falling back to empty on absence or corruption.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let data = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<StoreData>(&content) {
                Ok(data) => {
                    info!(
                        path = %path.display(),
                        trades = data.active_trades.len(),
                        losses = data.accumulated_losses.len(),
                        "trading state loaded"
                    );
                    data
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "trading state corrupt — starting with empty state"
                    );
                    StoreData::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no trading state file — starting empty");
                StoreData::default()
            }
        };
        Self {
            path,
            inner: Mutex::new(data),
        }
    }

    /// Serialize the current state exactly as it is written to disk.
    pub fn to_json(&self) -> Result<String> {
        let inner = self.inner.lock();
        serde_json::to_string_pretty(&*inner).context("failed to serialise trading state")
    }

    fn persist(&self, data: &StoreData) {
        let write = || -> Result<()> {
            let content =
                serde_json::to_string_pretty(data).context("failed to serialise trading state")?;
            let tmp = self.path.with_extension("json.tmp");
            std::fs::write(&tmp, &content)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            std::fs::rename(&tmp, &self.path)
                .with_context(|| format!("failed to rename into {}", self.path.display()))?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!(path = %self.path.display(), error = %e, "failed to persist trading state");
        }
    }

    // -------------------------------------------------------------------------
    // Slots
    // -------------------------------------------------------------------------

    pub fn get(&self, key: &str) -> Option<TradeSlot> {
        self.inner.lock().active_trades.get(key).cloned()
    }

    /// Whether any slot (pending or open) occupies the key.
    pub fn is_busy(&self, key: &str) -> bool {
        self.inner.lock().active_trades.contains_key(key)
    }

    pub fn set(&self, key: &str, slot: TradeSlot) {
        let mut inner = self.inner.lock();
        debug!(key, status = slot.status_label(), "slot updated");
        inner.active_trades.insert(key.to_string(), slot);
        self.persist(&inner);
    }

    /// Remove a slot. Returns the removed payload when one existed.
    pub fn clear(&self, key: &str, reason: &str) -> Option<TradeSlot> {
        let mut inner = self.inner.lock();
        let removed = inner.active_trades.remove(key);
        if removed.is_some() {
            info!(key, reason, "slot cleared");
            self.persist(&inner);
        }
        removed
    }

    /// Keys of all live slots (sentinels included).
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().active_trades.keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Accumulated losses
    // -------------------------------------------------------------------------

    /// Accumulated loss for a slot key; zero when unknown.
    pub fn accumulated_loss(&self, key: &str) -> Decimal {
        self.inner
            .lock()
            .accumulated_losses
            .get(key)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Add a (positive) loss amount to the key's running total.
    pub fn add_accumulated_loss(&self, key: &str, amount: Decimal) {
        let amount = amount.abs();
        let mut inner = self.inner.lock();
        let total = inner
            .accumulated_losses
            .entry(key.to_string())
            .or_insert(Decimal::ZERO);
        *total += amount;
        info!(key, added = %amount, total = %total, "accumulated loss updated");
        self.persist(&inner);
    }

    /// Reset the key's accumulated loss to zero.
    pub fn reset_accumulated_loss(&self, key: &str) {
        let mut inner = self.inner.lock();
        let prev = inner
            .accumulated_losses
            .insert(key.to_string(), Decimal::ZERO);
        if prev.map_or(true, |p| p != Decimal::ZERO) {
            info!(key, previous = ?prev, "accumulated loss reset");
            self.persist(&inner);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
