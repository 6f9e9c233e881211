// =============================================================================
// Binance USDⓈ-M Futures REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against Binance servers.
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::filters::SymbolFilters;
use crate::market_data::Candle;
use crate::types::OrderStatus;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// A Binance API-level error (non-2xx response or error payload), carrying
/// the numeric code so callers can special-case it.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "binance error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    /// Leverage already at the requested value.
    pub const NO_NEED_TO_CHANGE_LEVERAGE: i64 = -4046;
    /// Order does not exist.
    pub const UNKNOWN_ORDER: i64 = -2013;
    /// Cancel rejected because the order is already gone.
    pub const CANCEL_REJECTED: i64 = -2011;
    /// Request-weight rate limit exceeded.
    pub const TOO_MANY_REQUESTS: i64 = -1003;
}

/// Acknowledgement returned when an order is accepted.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: u64,
    pub status: OrderStatus,
}

/// Snapshot of an order as reported by the order-query endpoint.
#[derive(Debug, Clone)]
pub struct OrderInfo {
    pub order_id: u64,
    pub status: OrderStatus,
    pub price: Decimal,
    pub avg_price: Decimal,
    pub executed_qty: Decimal,
    /// Epoch milliseconds of the last update (fill time for FILLED orders).
    pub update_time: i64,
}

/// One directional position as reported by positionRisk.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    /// Signed amount: positive long, negative short.
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    /// "LONG" / "SHORT" in hedge mode, "BOTH" in one-way mode.
    pub position_side: String,
}

/// One account trade (fill) from the userTrades endpoint.
#[derive(Debug, Clone)]
pub struct FillRecord {
    pub order_id: u64,
    pub price: Decimal,
    pub qty: Decimal,
    pub realized_pnl: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
    pub time: i64,
}

/// Binance futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limits: Arc<RateLimitTracker>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` — sent as a header, never in query params.
    /// * `secret`  — used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceClient initialised (base_url=https://fapi.binance.com)");

        Self {
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
            rate_limits: Arc::new(RateLimitTracker::new()),
        }
    }

    /// Shared rate-limit tracker, updated after every request.
    pub fn rate_limits(&self) -> Arc<RateLimitTracker> {
        self.rate_limits.clone()
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Send a request, feed the rate-limit tracker from response headers, and
    /// turn exchange error payloads into [`ApiError`].
    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<serde_json::Value> {
        let resp = req
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?;

        self.rate_limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;

        if !status.is_success() {
            let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(-1);
            let message = body
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("no message")
                .to_string();
            return Err(anyhow::Error::new(ApiError { code, message })
                .context(format!("{what} returned HTTP {status}")));
        }

        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Symbol metadata
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/exchangeInfo filtered by symbol, parsed into the filter
    /// set the engine needs.
    #[instrument(skip(self), name = "binance::get_symbol_filters")]
    pub async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, symbol);
        let body = self
            .send(self.client.get(&url), "GET /fapi/v1/exchangeInfo")
            .await?;

        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(symbol)))
            .with_context(|| format!("symbol {symbol} not found in exchangeInfo"))?;

        let filter = |kind: &str| -> Option<&serde_json::Value> {
            info["filters"]
                .as_array()?
                .iter()
                .find(|f| f["filterType"].as_str() == Some(kind))
        };

        let lot = filter("LOT_SIZE").context("LOT_SIZE filter missing")?;
        let price = filter("PRICE_FILTER").context("PRICE_FILTER filter missing")?;
        // Futures exchangeInfo reports MIN_NOTIONAL with a "notional" field.
        let notional = filter("MIN_NOTIONAL");

        let dec_field = |v: &serde_json::Value, name: &str| -> Result<Decimal> {
            Self::parse_str_decimal(&v[name]).with_context(|| format!("bad filter field {name}"))
        };

        let filters = SymbolFilters {
            symbol: symbol.to_string(),
            price_tick: dec_field(price, "tickSize")?,
            qty_step: dec_field(lot, "stepSize")?,
            min_qty: dec_field(lot, "minQty")?,
            min_notional: notional
                .and_then(|n| Self::parse_str_decimal(&n["notional"]).ok())
                .unwrap_or(Decimal::ZERO),
            price_precision: info["pricePrecision"].as_u64().unwrap_or(8) as u32,
            quantity_precision: info["quantityPrecision"].as_u64().unwrap_or(8) as u32,
            base_asset: info["baseAsset"].as_str().unwrap_or("").to_string(),
            quote_asset: info["quoteAsset"].as_str().unwrap_or("USDT").to_string(),
        };

        debug!(
            symbol,
            tick = %filters.price_tick,
            step = %filters.qty_step,
            "symbol filters fetched"
        );
        Ok(filters)
    }

    // -------------------------------------------------------------------------
    // Account configuration
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/leverage (signed). "Already at this leverage" counts as
    /// success.
    #[instrument(skip(self), name = "binance::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/leverage?{}", self.base_url, qs);

        match self.send(self.client.post(&url), "POST /fapi/v1/leverage").await {
            Ok(_) => {
                debug!(symbol, leverage, "leverage set");
                Ok(())
            }
            Err(e) => {
                if let Some(api) = e.downcast_ref::<ApiError>() {
                    if api.code == ApiError::NO_NEED_TO_CHANGE_LEVERAGE {
                        debug!(symbol, leverage, "leverage already at requested value");
                        return Ok(());
                    }
                }
                Err(e)
            }
        }
    }

    /// GET /fapi/v1/positionSide/dual (signed) — `true` when the account is
    /// in hedge mode.
    #[instrument(skip(self), name = "binance::is_hedge_mode")]
    pub async fn is_hedge_mode(&self) -> Result<bool> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v1/positionSide/dual?{}", self.base_url, qs);
        let body = self
            .send(self.client.get(&url), "GET /fapi/v1/positionSide/dual")
            .await?;
        Ok(body["dualSidePosition"].as_bool().unwrap_or(false))
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order (signed) — GTC limit order.
    #[instrument(skip(self, price, quantity, client_order_id), name = "binance::place_limit_order")]
    pub async fn place_limit_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: &str,
        price: &str,
        position_side: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<OrderAck> {
        let mut params = format!(
            "symbol={symbol}&side={side}&type=LIMIT&timeInForce=GTC&quantity={quantity}&price={price}"
        );
        if let Some(ps) = position_side {
            params.push_str(&format!("&positionSide={ps}"));
        }
        if let Some(coid) = client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }
        self.submit_order(symbol, params, "LIMIT").await
    }

    /// POST /fapi/v1/order (signed) — STOP_MARKET with closePosition=true:
    /// the whole position is closed when the stop price triggers.
    #[instrument(skip(self, stop_price), name = "binance::place_stop_market")]
    pub async fn place_stop_market(
        &self,
        symbol: &str,
        side: &str,
        stop_price: &str,
        position_side: Option<&str>,
    ) -> Result<OrderAck> {
        let mut params = format!(
            "symbol={symbol}&side={side}&type=STOP_MARKET&stopPrice={stop_price}&closePosition=true"
        );
        if let Some(ps) = position_side {
            params.push_str(&format!("&positionSide={ps}"));
        }
        self.submit_order(symbol, params, "STOP_MARKET").await
    }

    /// POST /fapi/v1/order (signed) — TAKE_PROFIT_MARKET with
    /// closePosition=true.
    #[instrument(skip(self, stop_price), name = "binance::place_take_profit_market")]
    pub async fn place_take_profit_market(
        &self,
        symbol: &str,
        side: &str,
        stop_price: &str,
        position_side: Option<&str>,
    ) -> Result<OrderAck> {
        let mut params = format!(
            "symbol={symbol}&side={side}&type=TAKE_PROFIT_MARKET&stopPrice={stop_price}&closePosition=true"
        );
        if let Some(ps) = position_side {
            params.push_str(&format!("&positionSide={ps}"));
        }
        self.submit_order(symbol, params, "TAKE_PROFIT_MARKET").await
    }

    /// POST /fapi/v1/order (signed) — MARKET order, optionally reduce-only.
    ///
    /// In hedge mode Binance rejects an explicit reduceOnly flag; passing
    /// `position_side` there already scopes the order to the position.
    #[instrument(skip(self, quantity), name = "binance::place_market_order")]
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: &str,
        reduce_only: bool,
        position_side: Option<&str>,
    ) -> Result<OrderAck> {
        let mut params = format!("symbol={symbol}&side={side}&type=MARKET&quantity={quantity}");
        if let Some(ps) = position_side {
            params.push_str(&format!("&positionSide={ps}"));
        } else if reduce_only {
            params.push_str("&reduceOnly=true");
        }
        self.submit_order(symbol, params, "MARKET").await
    }

    async fn submit_order(
        &self,
        symbol: &str,
        params: String,
        order_type: &str,
    ) -> Result<OrderAck> {
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, order_type, "placing order");
        let body = self.send(self.client.post(&url), "POST /fapi/v1/order").await?;
        self.rate_limits.record_order_sent();

        let order_id = body["orderId"]
            .as_u64()
            .context("order response missing orderId")?;
        let status = OrderStatus::from_exchange(body["status"].as_str().unwrap_or(""));

        debug!(symbol, order_id, ?status, "order accepted");
        Ok(OrderAck { order_id, status })
    }

    /// GET /fapi/v1/order (signed). An unknown order id (-2013) is reported
    /// as a `NotFound` status, not an error.
    #[instrument(skip(self), name = "binance::get_order")]
    pub async fn get_order(&self, symbol: &str, order_id: u64) -> Result<OrderInfo> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        match self.send(self.client.get(&url), "GET /fapi/v1/order").await {
            Ok(body) => Ok(OrderInfo {
                order_id,
                status: OrderStatus::from_exchange(body["status"].as_str().unwrap_or("")),
                price: Self::parse_str_decimal(&body["price"]).unwrap_or(Decimal::ZERO),
                avg_price: Self::parse_str_decimal(&body["avgPrice"]).unwrap_or(Decimal::ZERO),
                executed_qty: Self::parse_str_decimal(&body["executedQty"])
                    .unwrap_or(Decimal::ZERO),
                update_time: body["updateTime"].as_i64().unwrap_or(0),
            }),
            Err(e) => {
                if let Some(api) = e.downcast_ref::<ApiError>() {
                    if api.code == ApiError::UNKNOWN_ORDER {
                        return Ok(OrderInfo {
                            order_id,
                            status: OrderStatus::NotFound,
                            price: Decimal::ZERO,
                            avg_price: Decimal::ZERO,
                            executed_qty: Decimal::ZERO,
                            update_time: 0,
                        });
                    }
                }
                Err(e)
            }
        }
    }

    /// DELETE /fapi/v1/order (signed). An order that is already gone
    /// (-2011 / -2013) counts as a successful cancel.
    #[instrument(skip(self), name = "binance::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        match self
            .send(self.client.delete(&url), "DELETE /fapi/v1/order")
            .await
        {
            Ok(_) => {
                debug!(symbol, order_id, "order cancelled");
                Ok(())
            }
            Err(e) => {
                if let Some(api) = e.downcast_ref::<ApiError>() {
                    if api.code == ApiError::CANCEL_REJECTED || api.code == ApiError::UNKNOWN_ORDER
                    {
                        debug!(symbol, order_id, "order already gone at cancel time");
                        return Ok(());
                    }
                }
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Positions / prices / balances
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/positionRisk (signed) — all directional positions for a
    /// symbol (one entry in one-way mode, up to two in hedge mode).
    #[instrument(skip(self), name = "binance::get_positions")]
    pub async fn get_positions(&self, symbol: &str) -> Result<Vec<PositionInfo>> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);
        let body = self
            .send(self.client.get(&url), "GET /fapi/v2/positionRisk")
            .await?;

        let arr = body.as_array().context("positionRisk is not an array")?;
        let mut out = Vec::with_capacity(arr.len());
        for p in arr {
            if p["symbol"].as_str() != Some(symbol) {
                continue;
            }
            out.push(PositionInfo {
                symbol: symbol.to_string(),
                amount: Self::parse_str_decimal(&p["positionAmt"]).unwrap_or(Decimal::ZERO),
                entry_price: Self::parse_str_decimal(&p["entryPrice"]).unwrap_or(Decimal::ZERO),
                unrealized_pnl: Self::parse_str_decimal(&p["unRealizedProfit"])
                    .unwrap_or(Decimal::ZERO),
                position_side: p["positionSide"].as_str().unwrap_or("BOTH").to_string(),
            });
        }
        Ok(out)
    }

    /// GET /fapi/v1/premiumIndex — current mark price.
    #[instrument(skip(self), name = "binance::get_mark_price")]
    pub async fn get_mark_price(&self, symbol: &str) -> Result<Decimal> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);
        let body = self
            .send(self.client.get(&url), "GET /fapi/v1/premiumIndex")
            .await?;
        Self::parse_str_decimal(&body["markPrice"]).context("premiumIndex missing markPrice")
    }

    /// GET /fapi/v2/balance (signed) — available balance for one asset.
    #[instrument(skip(self), name = "binance::get_balance")]
    pub async fn get_balance(&self, asset: &str) -> Result<Decimal> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/balance?{}", self.base_url, qs);
        let body = self.send(self.client.get(&url), "GET /fapi/v2/balance").await?;

        let arr = body.as_array().context("balance response is not an array")?;
        for b in arr {
            if b["asset"].as_str() == Some(asset) {
                let bal =
                    Self::parse_str_decimal(&b["availableBalance"]).unwrap_or(Decimal::ZERO);
                debug!(asset, balance = %bal, "balance retrieved");
                return Ok(bal);
            }
        }
        warn!(asset, "asset not found in balances — returning 0");
        Ok(Decimal::ZERO)
    }

    /// GET /fapi/v1/userTrades (signed) — account fills for a symbol within a
    /// time window, used to reconstruct realized P&L of a closure.
    #[instrument(skip(self), name = "binance::get_account_trades")]
    pub async fn get_account_trades(
        &self,
        symbol: &str,
        start_time_ms: i64,
        end_time_ms: i64,
    ) -> Result<Vec<FillRecord>> {
        let params = format!(
            "symbol={symbol}&startTime={start_time_ms}&endTime={end_time_ms}&limit=100"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/userTrades?{}", self.base_url, qs);
        let body = self
            .send(self.client.get(&url), "GET /fapi/v1/userTrades")
            .await?;

        let arr = body.as_array().context("userTrades is not an array")?;
        let mut fills = Vec::with_capacity(arr.len());
        for t in arr {
            fills.push(FillRecord {
                order_id: t["orderId"].as_u64().unwrap_or(0),
                price: Self::parse_str_decimal(&t["price"]).unwrap_or(Decimal::ZERO),
                qty: Self::parse_str_decimal(&t["qty"]).unwrap_or(Decimal::ZERO),
                realized_pnl: Self::parse_str_decimal(&t["realizedPnl"]).unwrap_or(Decimal::ZERO),
                commission: Self::parse_str_decimal(&t["commission"]).unwrap_or(Decimal::ZERO),
                commission_asset: t["commissionAsset"].as_str().unwrap_or("").to_string(),
                time: t["time"].as_i64().unwrap_or(0),
            });
        }
        debug!(symbol, count = fills.len(), "account trades fetched");
        Ok(fills)
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/klines (public — no signature required).
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let body = self.send(self.client.get(&url), "GET /fapi/v1/klines").await?;

        let raw = body.as_array().context("klines response is not an array")?;
        let now_ms = Self::timestamp_ms() as i64;
        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            let open_time = arr[0].as_i64().unwrap_or(0);
            let close_time = arr[6].as_i64().unwrap_or(0);
            candles.push(Candle {
                open_time,
                close_time,
                open: Self::parse_str_decimal(&arr[1])?,
                high: Self::parse_str_decimal(&arr[2])?,
                low: Self::parse_str_decimal(&arr[3])?,
                close: Self::parse_str_decimal(&arr[4])?,
                volume: Self::parse_str_decimal(&arr[5])?,
                // The last row of a klines response is the running candle;
                // anything whose close_time has not passed yet is open.
                is_closed: close_time <= now_ms,
            });
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Parse a JSON value that may be either a string or a number into a
    /// `Decimal`. Binance encodes most numerics as strings.
    fn parse_str_decimal(val: &serde_json::Value) -> Result<Decimal> {
        if let Some(s) = val.as_str() {
            s.parse::<Decimal>()
                .with_context(|| format!("failed to parse '{s}' as decimal"))
        } else if let Some(n) = val.as_f64() {
            Decimal::from_f64(n).context("f64 value not representable as decimal")
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parse_decimal_accepts_strings_and_numbers() {
        let s = serde_json::json!("100.25");
        assert_eq!(BinanceClient::parse_str_decimal(&s).unwrap(), dec!(100.25));
        let n = serde_json::json!(3.5);
        assert_eq!(BinanceClient::parse_str_decimal(&n).unwrap(), dec!(3.5));
        let bad = serde_json::json!(null);
        assert!(BinanceClient::parse_str_decimal(&bad).is_err());
    }

    #[test]
    fn api_error_display_carries_code() {
        let e = ApiError {
            code: -2011,
            message: "Unknown order sent.".into(),
        };
        let s = format!("{e}");
        assert!(s.contains("-2011"));
        assert!(s.contains("Unknown order"));
    }

    #[test]
    fn debug_redacts_secret() {
        let c = BinanceClient::new("key", "very-secret");
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("very-secret"));
        assert!(dbg.contains("<redacted>"));
    }
}
