// =============================================================================
// Market Data Cache — per-(symbol, interval) candle rings with derived bands
// =============================================================================
//
// One ingestion task per key feeds the ring; the live (unclosed) candle is
// updated in place and band state is recomputed under the same write lock as
// the candle mutation, so readers never observe a candle whose bands lag
// behind it. Readers always receive owned copies.
//
// Subscriptions are idempotent and coalesced: the registry is consulted under
// one lock before a stream task is spawned, so concurrent subscribe calls for
// the same key issue exactly one backfill.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::binance::BinanceClient;
use crate::indicators::{dual_bollinger, BbParams, DualBands};
use crate::market_data::stream;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub is_closed: bool,
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Named band selector for single-value reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandName {
    BblOrig,
    BbmOrig,
    BbuOrig,
    BblNew,
    BbuNew,
}

// ---------------------------------------------------------------------------
// Series state
// ---------------------------------------------------------------------------

struct SeriesState {
    candles: VecDeque<Candle>,
    /// Bands of the last *closed* candle; `None` until enough history exists
    /// or when no band params were requested for this key.
    bands: Option<DualBands>,
    params: Option<BbParams>,
    /// Ring bound, including the in-progress candle.
    limit: usize,
}

impl SeriesState {
    fn recompute_bands(&mut self) {
        let Some(params) = &self.params else {
            return;
        };
        let closes: Vec<Decimal> = self
            .candles
            .iter()
            .filter(|c| c.is_closed)
            .map(|c| c.close)
            .collect();
        self.bands = dual_bollinger(&closes, params);
    }

    fn last_closed(&self) -> Option<&Candle> {
        self.candles.iter().rev().find(|c| c.is_closed)
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Thread-safe market data cache. Constructed once and shared via `Arc`.
pub struct MarketDataCache {
    client: Arc<BinanceClient>,
    series: RwLock<HashMap<CandleKey, SeriesState>>,
    subscriptions: Mutex<HashMap<CandleKey, JoinHandle<()>>>,
}

impl MarketDataCache {
    pub fn new(client: Arc<BinanceClient>) -> Self {
        Self {
            client,
            series: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn client(&self) -> Arc<BinanceClient> {
        self.client.clone()
    }

    // -------------------------------------------------------------------------
    // Subscription management
    // -------------------------------------------------------------------------

    /// Ensure a backfilled, streaming series exists for `(symbol, interval)`.
    ///
    /// Idempotent: a second call for an existing key returns immediately.
    /// `bb_params` declares which bands must be derivable for the series;
    /// `None` keeps raw candles only.
    pub fn subscribe(
        self: Arc<Self>,
        symbol: &str,
        interval: &str,
        history_limit: usize,
        bb_params: Option<BbParams>,
    ) {
        let key = CandleKey::new(symbol.to_uppercase(), interval);

        let mut subs = self.subscriptions.lock();
        if let Some(handle) = subs.get(&key) {
            if !handle.is_finished() {
                return;
            }
            // A finished handle means the task died; resubscribe below.
            warn!(key = %key, "stream task found dead — resubscribing");
        }

        let ring_limit = bb_params
            .as_ref()
            .map(|p| p.length + 2)
            .unwrap_or(0)
            .max(history_limit);

        {
            let mut series = self.series.write();
            let entry = series.entry(key.clone()).or_insert_with(|| SeriesState {
                candles: VecDeque::with_capacity(ring_limit + 1),
                bands: None,
                params: None,
                limit: ring_limit,
            });
            entry.params = bb_params;
            entry.limit = entry.limit.max(ring_limit);
        }

        let cache = Arc::clone(&self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            stream::run_ingestion(cache, task_key, history_limit).await;
        });
        subs.insert(key.clone(), handle);
        info!(key = %key, history_limit, "market data subscription started");
    }

    /// Whether a live subscription exists for the key.
    pub fn is_subscribed(&self, symbol: &str, interval: &str) -> bool {
        let key = CandleKey::new(symbol.to_uppercase(), interval);
        self.subscriptions
            .lock()
            .get(&key)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop every streaming subscription and release the series.
    pub fn shutdown(&self) {
        let mut subs = self.subscriptions.lock();
        let count = subs.len();
        for (_, handle) in subs.drain() {
            handle.abort();
        }
        self.series.write().clear();
        info!(count, "market data cache shut down");
    }

    // -------------------------------------------------------------------------
    // Ingestion (called from the stream tasks)
    // -------------------------------------------------------------------------

    /// Apply one kline update in wire order.
    pub(crate) fn apply_update(&self, key: &CandleKey, candle: Candle) {
        let mut series = self.series.write();
        let Some(state) = series.get_mut(key) else {
            return;
        };

        match state.candles.back() {
            Some(last) if last.open_time == candle.open_time => {
                // In-progress candle mutating in place (or closing).
                *state.candles.back_mut().expect("back exists") = candle;
            }
            Some(last) if candle.open_time > last.open_time => {
                state.candles.push_back(candle);
                while state.candles.len() > state.limit {
                    state.candles.pop_front();
                }
            }
            Some(_) => {
                // Late duplicate from before the current candle — discard.
                debug!(key = %key, open_time = candle.open_time, "discarding stale kline update");
                return;
            }
            None => state.candles.push_back(candle),
        }

        state.recompute_bands();
    }

    /// Merge a batch of backfilled candles (initial load or post-reconnect
    /// gap repair) into the ring, preserving open-time order.
    pub(crate) fn merge_backfill(&self, key: &CandleKey, batch: Vec<Candle>) {
        if batch.is_empty() {
            return;
        }
        let mut series = self.series.write();
        let Some(state) = series.get_mut(key) else {
            return;
        };

        let mut by_time: std::collections::BTreeMap<i64, Candle> = state
            .candles
            .drain(..)
            .map(|c| (c.open_time, c))
            .collect();
        for c in batch {
            // A closed backfill row wins over a stale live view of the same
            // candle; never let an open row overwrite a closed one.
            match by_time.get(&c.open_time) {
                Some(existing) if existing.is_closed && !c.is_closed => {}
                _ => {
                    by_time.insert(c.open_time, c);
                }
            }
        }

        state.candles = by_time.into_values().collect();
        while state.candles.len() > state.limit {
            state.candles.pop_front();
        }
        state.recompute_bands();
        debug!(key = %key, len = state.candles.len(), "backfill merged");
    }

    // -------------------------------------------------------------------------
    // Read path — always copies, never references into the map
    // -------------------------------------------------------------------------

    /// Snapshot of the full series (oldest first), if the key exists.
    pub fn series(&self, symbol: &str, interval: &str) -> Option<Vec<Candle>> {
        let key = CandleKey::new(symbol.to_uppercase(), interval);
        let series = self.series.read();
        series
            .get(&key)
            .map(|s| s.candles.iter().cloned().collect())
    }

    /// Band values of the last closed candle. `None` while the series is too
    /// short, unsubscribed, or configured without band params.
    pub fn contextual_bands(&self, symbol: &str, interval: &str) -> Option<DualBands> {
        let key = CandleKey::new(symbol.to_uppercase(), interval);
        self.series.read().get(&key)?.bands.clone()
    }

    /// Single named band value of the last closed candle.
    pub fn band(&self, symbol: &str, interval: &str, name: BandName) -> Option<Decimal> {
        let bands = self.contextual_bands(symbol, interval)?;
        Some(match name {
            BandName::BblOrig => bands.bbl_orig,
            BandName::BbmOrig => bands.bbm_orig,
            BandName::BbuOrig => bands.bbu_orig,
            BandName::BblNew => bands.bbl_new,
            BandName::BbuNew => bands.bbu_new,
        })
    }

    /// The most recent candle, open or closed.
    pub fn latest_candle(&self, symbol: &str, interval: &str) -> Option<Candle> {
        let key = CandleKey::new(symbol.to_uppercase(), interval);
        self.series.read().get(&key)?.candles.back().cloned()
    }

    /// The most recent closed candle.
    pub fn last_closed_candle(&self, symbol: &str, interval: &str) -> Option<Candle> {
        let key = CandleKey::new(symbol.to_uppercase(), interval);
        self.series.read().get(&key)?.last_closed().cloned()
    }

    /// Number of candles currently held for a key (open candle included).
    pub fn len(&self, symbol: &str, interval: &str) -> usize {
        let key = CandleKey::new(symbol.to_uppercase(), interval);
        self.series.read().get(&key).map_or(0, |s| s.candles.len())
    }

    /// Register a series without spawning a stream task, so tests can drive
    /// the ingestion path by hand.
    #[cfg(test)]
    pub(crate) fn register_series_for_test(
        &self,
        symbol: &str,
        interval: &str,
        params: Option<BbParams>,
        limit: usize,
    ) {
        let key = CandleKey::new(symbol.to_uppercase(), interval);
        self.series.write().insert(
            key,
            SeriesState {
                candles: VecDeque::new(),
                bands: None,
                params,
                limit,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cache() -> Arc<MarketDataCache> {
        Arc::new(MarketDataCache::new(Arc::new(BinanceClient::new("k", "s"))))
    }

    fn seed(cache: &MarketDataCache, key: &CandleKey, limit: usize, params: Option<BbParams>) {
        cache.register_series_for_test(&key.symbol, &key.interval, params, limit);
    }

    fn candle(open_time: i64, close: Decimal, is_closed: bool) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: dec!(100),
            is_closed,
        }
    }

    #[test]
    fn ring_trims_to_limit() {
        let c = cache();
        let key = CandleKey::new("BTCUSDT", "1m");
        seed(&c, &key, 3, None);

        for i in 0..5i64 {
            c.apply_update(&key, candle(i * 60_000, Decimal::from(100 + i), true));
        }
        assert_eq!(c.len("BTCUSDT", "1m"), 3);
        let series = c.series("BTCUSDT", "1m").unwrap();
        assert_eq!(series[0].close, dec!(102));
        assert_eq!(series[2].close, dec!(104));
    }

    #[test]
    fn open_candle_mutates_in_place() {
        let c = cache();
        let key = CandleKey::new("ETHUSDT", "5m");
        seed(&c, &key, 10, None);

        c.apply_update(&key, candle(0, dec!(50), false));
        assert_eq!(c.len("ETHUSDT", "5m"), 1);

        c.apply_update(&key, candle(0, dec!(51), false));
        assert_eq!(c.len("ETHUSDT", "5m"), 1);
        assert_eq!(c.latest_candle("ETHUSDT", "5m").unwrap().close, dec!(51));

        c.apply_update(&key, candle(0, dec!(52), true));
        assert_eq!(c.len("ETHUSDT", "5m"), 1);
        assert_eq!(c.last_closed_candle("ETHUSDT", "5m").unwrap().close, dec!(52));
    }

    #[test]
    fn stale_update_discarded() {
        let c = cache();
        let key = CandleKey::new("BTCUSDT", "1m");
        seed(&c, &key, 10, None);

        c.apply_update(&key, candle(60_000, dec!(101), true));
        c.apply_update(&key, candle(0, dec!(100), true));
        assert_eq!(c.len("BTCUSDT", "1m"), 1);
        assert_eq!(c.latest_candle("BTCUSDT", "1m").unwrap().close, dec!(101));
    }

    #[test]
    fn bands_only_use_closed_candles() {
        let c = cache();
        let key = CandleKey::new("BTCUSDT", "5m");
        seed(&c, &key, 30, Some(BbParams::new("SMA", 20, 2.0, 1.0)));

        for i in 0..20i64 {
            c.apply_update(&key, candle(i * 300_000, dec!(100), true));
        }
        let flat = c.contextual_bands("BTCUSDT", "5m").unwrap();
        assert_eq!(flat.bbm_orig, dec!(100));

        // A wildly different open candle must not move the contextual bands.
        c.apply_update(&key, candle(20 * 300_000, dec!(500), false));
        let still_flat = c.contextual_bands("BTCUSDT", "5m").unwrap();
        assert_eq!(still_flat.bbm_orig, dec!(100));

        // Closing it shifts the window.
        c.apply_update(&key, candle(20 * 300_000, dec!(500), true));
        let moved = c.contextual_bands("BTCUSDT", "5m").unwrap();
        assert!(moved.bbm_orig > dec!(100));
    }

    #[test]
    fn band_selector_matches_bands() {
        let c = cache();
        let key = CandleKey::new("BTCUSDT", "5m");
        seed(&c, &key, 30, Some(BbParams::new("SMA", 20, 2.0, 1.0)));
        for i in 0..20i64 {
            c.apply_update(&key, candle(i * 300_000, Decimal::from(100 + i), true));
        }

        let bands = c.contextual_bands("BTCUSDT", "5m").unwrap();
        assert_eq!(
            c.band("BTCUSDT", "5m", BandName::BbmOrig).unwrap(),
            bands.bbm_orig
        );
        assert_eq!(
            c.band("BTCUSDT", "5m", BandName::BblNew).unwrap(),
            bands.bbl_new
        );
    }

    #[test]
    fn reads_on_unknown_key_return_none() {
        let c = cache();
        assert!(c.series("NOPE", "1m").is_none());
        assert!(c.contextual_bands("NOPE", "1m").is_none());
        assert!(c.latest_candle("NOPE", "1m").is_none());
        assert_eq!(c.len("NOPE", "1m"), 0);
    }

    #[test]
    fn backfill_merges_and_respects_closed_wins() {
        let c = cache();
        let key = CandleKey::new("BTCUSDT", "1m");
        seed(&c, &key, 10, None);

        // Live view: candle 0 closed, candle 1 open.
        c.apply_update(&key, candle(0, dec!(100), true));
        c.apply_update(&key, candle(60_000, dec!(101), false));

        // Backfill supplies a closed candle 1 and an older candle the stream
        // never saw.
        c.merge_backfill(
            &key,
            vec![candle(-60_000, dec!(99), true), candle(60_000, dec!(102), true)],
        );

        let series = c.series("BTCUSDT", "1m").unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].close, dec!(99));
        assert_eq!(series[2].close, dec!(102));
        assert!(series[2].is_closed);

        // An open backfill row must not clobber the closed state.
        c.merge_backfill(&key, vec![candle(60_000, dec!(103), false)]);
        let series = c.series("BTCUSDT", "1m").unwrap();
        assert_eq!(series[2].close, dec!(102));
    }
}
