// =============================================================================
// Rate-Limit Tracker — monitors futures API usage to avoid 429s
// =============================================================================
//
// Binance USDⓈ-M futures enforces:
//   - Request weight: 2400 per minute (we hard-cap ourselves at 2000).
//   - Order rate:     300 per 10 s, 1200 per minute.
//
// The tracker reads the `X-MBX-USED-WEIGHT-1M` response header after every
// request and keeps atomic counters that any task may query lock-free. The
// orchestrator consults `is_saturated` to stretch its tick sleep while the
// account is close to the ceiling.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 2000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 1600;

/// Maximum orders per 10-second window.
const ORDER_10S_LIMIT: u32 = 300;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
}

impl RateLimitTracker {
    /// Create a new tracker with all counters at zero.
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Update internal counters from the HTTP response headers returned by
    /// Binance. The important one is `X-MBX-USED-WEIGHT-1M`.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(w) = header_u32(headers, "X-MBX-USED-WEIGHT-1M") {
            let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
            if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                warn!(
                    used_weight = w,
                    hard_limit = WEIGHT_HARD_LIMIT,
                    "rate-limit weight crossed warning threshold"
                );
            }
            debug!(used_weight_1m = w, "rate-limit weight updated from header");
        }

        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-10S") {
            self.order_count_10s.store(c, Ordering::Relaxed);
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Whether request weight is close enough to the ceiling that callers
    /// should back off for a while.
    pub fn is_saturated(&self) -> bool {
        self.used_weight_1m.load(Ordering::Relaxed) >= WEIGHT_WARN_THRESHOLD
    }

    /// Return `true` if another order fits in the 10-second window.
    pub fn can_place_order(&self) -> bool {
        let count_10s = self.order_count_10s.load(Ordering::Relaxed);
        if count_10s >= ORDER_10S_LIMIT {
            warn!(
                count_10s,
                limit = ORDER_10S_LIMIT,
                "order blocked — 10 s order limit reached"
            );
            return false;
        }
        true
    }

    /// Manually increment the order counter (the exchange echoes the real
    /// count in later response headers).
    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
    }

    /// Current 1-minute weight reading.
    pub fn used_weight(&self) -> u32 {
        self.used_weight_1m.load(Ordering::Relaxed)
    }
}

fn header_u32(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("order_count_10s", &self.order_count_10s.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn updates_weight_from_headers() {
        let t = RateLimitTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("1234"));
        t.update_from_headers(&headers);
        assert_eq!(t.used_weight(), 1234);
        assert!(!t.is_saturated());

        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("1700"));
        t.update_from_headers(&headers);
        assert!(t.is_saturated());
    }

    #[test]
    fn order_window_blocks_at_limit() {
        let t = RateLimitTracker::new();
        assert!(t.can_place_order());
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-ORDER-COUNT-10S", HeaderValue::from_static("300"));
        t.update_from_headers(&headers);
        assert!(!t.can_place_order());
    }

    #[test]
    fn garbage_headers_are_ignored() {
        let t = RateLimitTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("nope"));
        t.update_from_headers(&headers);
        assert_eq!(t.used_weight(), 0);
    }
}
