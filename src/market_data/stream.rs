// =============================================================================
// Kline ingestion — REST backfill + WebSocket stream per (symbol, interval)
// =============================================================================
//
// Each subscription runs one task: backfill, then stream until the connection
// drops, then reconnect with exponential backoff (1 s base, 60 s cap). Every
// reconnect is preceded by a bounded re-backfill that repairs any candles
// missed during the outage.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::market_data::{Candle, CandleKey, MarketDataCache};

const FUTURES_WS_BASE: &str = "wss://fstream.binance.com/ws";

/// Backoff bounds for reconnect attempts.
const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 60;

/// A connection that survived this long is considered healthy; the next drop
/// restarts the backoff ladder from the base.
const HEALTHY_CONNECTION_SECS: u64 = 60;

/// Cap on the re-backfill issued after a reconnect.
const RECONNECT_BACKFILL_LIMIT: usize = 100;

/// Drive one subscription forever (aborted via the cache's shutdown).
pub(crate) async fn run_ingestion(cache: Arc<MarketDataCache>, key: CandleKey, history_limit: usize) {
    let mut backoff = BACKOFF_BASE_SECS;
    let mut backfill_limit = history_limit;

    loop {
        match backfill(&cache, &key, backfill_limit).await {
            Ok(count) => debug!(key = %key, count, "backfill applied"),
            Err(e) => warn!(key = %key, error = %e, "backfill failed — continuing to stream"),
        }

        let connected_at = Instant::now();
        match run_stream(&cache, &key).await {
            Ok(()) => warn!(key = %key, "kline stream ended"),
            Err(e) => error!(key = %key, error = %e, "kline stream error"),
        }

        if connected_at.elapsed() >= Duration::from_secs(HEALTHY_CONNECTION_SECS) {
            backoff = BACKOFF_BASE_SECS;
        }
        warn!(key = %key, backoff_secs = backoff, "reconnecting kline stream");
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(BACKOFF_CAP_SECS);

        // After the first cycle only a bounded window is refetched.
        backfill_limit = history_limit.min(RECONNECT_BACKFILL_LIMIT);
    }
}

/// Fetch recent candles over REST and merge them into the ring. Only closed
/// candles are merged; the running candle belongs to the stream.
async fn backfill(cache: &MarketDataCache, key: &CandleKey, limit: usize) -> Result<usize> {
    if limit == 0 {
        return Ok(0);
    }
    let candles = cache
        .client()
        .get_klines(&key.symbol, &key.interval, limit as u32)
        .await
        .context("kline backfill request failed")?;

    let closed: Vec<Candle> = candles.into_iter().filter(|c| c.is_closed).collect();
    let count = closed.len();
    cache.merge_backfill(key, closed);
    Ok(count)
}

/// Connect to the futures kline stream for one (symbol, interval) and feed
/// updates into the cache until the connection drops.
async fn run_stream(cache: &MarketDataCache, key: &CandleKey) -> Result<()> {
    let url = format!(
        "{FUTURES_WS_BASE}/{}@kline_{}",
        key.symbol.to_lowercase(),
        key.interval
    );
    debug!(key = %key, url = %url, "connecting kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect kline WebSocket")?;
    info!(key = %key, "kline WebSocket connected");

    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kline_message(&text) {
                        Ok((msg_key, candle)) => {
                            if msg_key == *key {
                                cache.apply_update(key, candle);
                            }
                        }
                        Err(e) => warn!(key = %key, error = %e, "failed to parse kline message"),
                    }
                }
                // Ping/Pong/Binary/Close frames are handled by tungstenite or
                // ignored; a Close surfaces as stream end below.
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(()),
        }
    }
}

/// Parse a kline event. Both the single-stream payload and the combined
/// envelope (`{"stream": ..., "data": {...}}`) are accepted.
fn parse_kline_message(text: &str) -> Result<(CandleKey, Candle)> {
    let root: serde_json::Value = serde_json::from_str(text).context("invalid kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];
    let interval = k["i"].as_str().context("missing field k.i")?.to_string();

    let candle = Candle {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        close_time: k["T"].as_i64().context("missing field k.T")?,
        open: parse_decimal(&k["o"], "k.o")?,
        high: parse_decimal(&k["h"], "k.h")?,
        low: parse_decimal(&k["l"], "k.l")?,
        close: parse_decimal(&k["c"], "k.c")?,
        volume: parse_decimal(&k["v"], "k.v")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    };

    Ok((CandleKey { symbol, interval }, candle))
}

/// Binance sends numeric values as JSON strings inside kline objects.
fn parse_decimal(val: &serde_json::Value, name: &str) -> Result<Decimal> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<Decimal>()
            .with_context(|| format!("failed to parse {name} as decimal: {s}")),
        serde_json::Value::Number(n) => {
            let f = n.as_f64().with_context(|| format!("{name} not an f64"))?;
            Decimal::from_f64(f).with_context(|| format!("{name} not representable"))
        }
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parse_single_stream_message() {
        let json = r#"{
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1700000000000,
                "T": 1700000059999,
                "i": "1m",
                "o": "37000.00",
                "h": "37050.00",
                "l": "36990.00",
                "c": "37020.00",
                "v": "123.456",
                "x": false
            }
        }"#;
        let (key, candle) = parse_kline_message(json).expect("should parse");
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(key.interval, "1m");
        assert_eq!(candle.close, dec!(37020.00));
        assert_eq!(candle.low, dec!(36990.00));
        assert!(!candle.is_closed);
    }

    #[test]
    fn parse_combined_envelope_message() {
        let json = r#"{
            "stream": "ethusdt@kline_5m",
            "data": {
                "e": "kline",
                "s": "ETHUSDT",
                "k": {
                    "t": 1700000000000,
                    "T": 1700000299999,
                    "i": "5m",
                    "o": "2000", "h": "2010", "l": "1990", "c": "2005",
                    "v": "55.5",
                    "x": true
                }
            }
        }"#;
        let (key, candle) = parse_kline_message(json).expect("should parse");
        assert_eq!(key.symbol, "ETHUSDT");
        assert_eq!(key.interval, "5m");
        assert!(candle.is_closed);
        assert_eq!(candle.close, dec!(2005));
    }

    #[test]
    fn parse_rejects_malformed_payloads() {
        assert!(parse_kline_message("not json").is_err());
        assert!(parse_kline_message(r#"{"e":"kline"}"#).is_err());
        let missing_x = r#"{"s":"BTCUSDT","k":{"t":1,"T":2,"i":"1m","o":"1","h":"1","l":"1","c":"1","v":"1"}}"#;
        assert!(parse_kline_message(missing_x).is_err());
    }
}
