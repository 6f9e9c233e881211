// =============================================================================
// Shared types used across the Bollinger trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order side as sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// The side that closes a position opened with `self`.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// Hedge-mode position side implied by an entry on this side.
    pub fn position_side(self) -> PositionSide {
        match self {
            Self::Buy => PositionSide::Long,
            Self::Sell => PositionSide::Short,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directional half of a symbol's trade slot pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl PositionSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    /// The entry side that produces this position side.
    pub fn entry_side(self) -> Side {
        match self {
            Self::Long => Side::Buy,
            Self::Short => Side::Sell,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the persistent-state key for a symbol's directional slot,
/// e.g. `BTCUSDT_LONG`.
pub fn slot_key(symbol: &str, side: PositionSide) -> String {
    format!("{}_{}", symbol, side)
}

/// Key under which the one-shot "position without SL" sentinel is stored.
pub fn no_sl_sentinel_key(slot_key: &str) -> String {
    format!("{slot_key}_NO_SL_ALERT_SENT")
}

/// Exchange-reported order status, folded into the classes the engine
/// distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
    /// Order id unknown to the exchange (error -2013).
    NotFound,
    Other(String),
}

impl OrderStatus {
    pub fn from_exchange(s: &str) -> Self {
        match s {
            "NEW" => Self::New,
            "PARTIALLY_FILLED" => Self::PartiallyFilled,
            "FILLED" => Self::Filled,
            "CANCELED" => Self::Canceled,
            "EXPIRED" => Self::Expired,
            "REJECTED" => Self::Rejected,
            other => Self::Other(other.to_string()),
        }
    }

    /// A working order that may still fill.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::New | Self::PartiallyFilled)
    }

    /// Terminal without having filled; includes unknown ids.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::Expired | Self::Rejected | Self::NotFound
        )
    }
}

/// Seconds covered by one candle of the given interval string ("1m", "5m",
/// "15m", "1h", ...). Returns `None` for unrecognised formats.
pub fn interval_seconds(interval: &str) -> Option<u64> {
    let (num, unit) = interval.split_at(interval.len().checked_sub(1)?);
    let n: u64 = num.parse().ok()?;
    if n == 0 {
        return None;
    }
    match unit {
        "m" => Some(n * 60),
        "h" => Some(n * 3600),
        "d" => Some(n * 86_400),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_roundtrip_and_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::Buy.position_side(), PositionSide::Long);
        assert_eq!(PositionSide::Short.entry_side(), Side::Sell);
    }

    #[test]
    fn slot_keys() {
        assert_eq!(slot_key("BTCUSDT", PositionSide::Long), "BTCUSDT_LONG");
        assert_eq!(
            no_sl_sentinel_key("BTCUSDT_SHORT"),
            "BTCUSDT_SHORT_NO_SL_ALERT_SENT"
        );
    }

    #[test]
    fn order_status_classes() {
        assert!(OrderStatus::from_exchange("NEW").is_live());
        assert!(OrderStatus::from_exchange("PARTIALLY_FILLED").is_live());
        assert!(OrderStatus::from_exchange("CANCELED").is_gone());
        assert!(OrderStatus::NotFound.is_gone());
        assert_eq!(OrderStatus::from_exchange("FILLED"), OrderStatus::Filled);
        assert!(!OrderStatus::Filled.is_gone());
        assert!(matches!(
            OrderStatus::from_exchange("PENDING_CANCEL"),
            OrderStatus::Other(_)
        ));
    }

    #[test]
    fn interval_parsing() {
        assert_eq!(interval_seconds("1m"), Some(60));
        assert_eq!(interval_seconds("5m"), Some(300));
        assert_eq!(interval_seconds("15m"), Some(900));
        assert_eq!(interval_seconds("1h"), Some(3600));
        assert_eq!(interval_seconds("xx"), None);
        assert_eq!(interval_seconds(""), None);
    }
}
