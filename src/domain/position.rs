//! Open position state owned by the exit engine.

use chrono::{DateTime, Utc};

/// A long position from confirmed entry until its exit is confirmed filled.
///
/// Only the exit engine mutates `peak_price`, `trailing_active` and
/// `stop_price`; everything else is fixed at entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub size: f64,
    pub peak_price: f64,
    pub trailing_active: bool,
    pub stop_price: Option<f64>,
}

impl Position {
    pub fn open(symbol: &str, entry_price: f64, size: f64, entry_time: DateTime<Utc>) -> Self {
        Position {
            symbol: symbol.to_string(),
            entry_price,
            entry_time,
            size,
            peak_price: entry_price,
            trailing_active: false,
            stop_price: None,
        }
    }

    /// Unrealized move from entry, in percent. Negative is a loss.
    pub fn gain_pct(&self, price: f64) -> f64 {
        (price - self.entry_price) / self.entry_price * 100.0
    }
}
