//! Executed trades: the immutable facts the ledger holds.

use chrono::{DateTime, Timelike, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use super::error::LedgerError;

/// Storage format for timestamps. Fixed width, so lexical order is
/// chronological order. Resolution is one microsecond; trades carrying finer
/// timestamps fail validation rather than reordering on a round trip.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a UTC timestamp. Accepts the storage format and any RFC 3339 string.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match chrono::NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT) {
        Ok(naive) => Ok(naive.and_utc()),
        Err(_) => DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" | "b" => Ok(Side::Buy),
            "sell" | "s" => Ok(Side::Sell),
            other => Err(format!("unknown side '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub trade_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub fee: f64,
    pub executed_at: DateTime<Utc>,
}

impl Trade {
    pub fn is_buy(&self) -> bool {
        self.side == Side::Buy
    }

    pub fn is_sell(&self) -> bool {
        self.side == Side::Sell
    }

    /// Fee attributable to one unit of this trade.
    pub fn fee_per_unit(&self) -> f64 {
        self.fee / self.size
    }

    /// Reject trades the matcher cannot price.
    pub fn validate(&self) -> Result<(), LedgerError> {
        let reason = if self.trade_id.trim().is_empty() {
            Some("trade_id must not be empty")
        } else if self.symbol.trim().is_empty() {
            Some("symbol must not be empty")
        } else if !(self.size.is_finite() && self.size > 0.0) {
            Some("size must be positive")
        } else if !(self.price.is_finite() && self.price > 0.0) {
            Some("price must be positive")
        } else if !(self.fee.is_finite() && self.fee >= 0.0) {
            Some("fee must be non-negative")
        } else if self.executed_at.nanosecond() % 1_000 != 0 {
            Some("executed_at must not be finer than a microsecond")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(LedgerError::InvalidTrade {
                trade_id: self.trade_id.clone(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Matching order: `(symbol, executed_at, trade_id)`.
pub fn matching_order(a: &Trade, b: &Trade) -> Ordering {
    a.symbol
        .cmp(&b.symbol)
        .then(a.executed_at.cmp(&b.executed_at))
        .then(a.trade_id.cmp(&b.trade_id))
}

pub fn sort_for_matching(trades: &mut [Trade]) {
    trades.sort_by(matching_order);
}
