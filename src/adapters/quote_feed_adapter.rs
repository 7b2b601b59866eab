//! Snapshot feed: prices, volatility and signals supplied up front.
//!
//! Backs the `evaluate` command, where the operator passes the tick's inputs
//! on the command line. Anything not supplied reads as unavailable.

use crate::domain::error::LedgerError;
use crate::domain::exit_rules::SignalReading;
use crate::ports::feed_port::{MarketDataPort, SignalPort};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct Quote {
    price: Option<f64>,
    volatility_pct: Option<f64>,
    signal: Option<SignalReading>,
}

#[derive(Debug, Clone, Default)]
pub struct QuoteFeedAdapter {
    quotes: HashMap<String, Quote>,
}

impl QuoteFeedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, symbol: &str, price: f64) -> Self {
        self.quotes.entry(symbol.to_string()).or_default().price = Some(price);
        self
    }

    pub fn with_volatility(mut self, symbol: &str, volatility_pct: f64) -> Self {
        self.quotes
            .entry(symbol.to_string())
            .or_default()
            .volatility_pct = Some(volatility_pct);
        self
    }

    pub fn with_signal(mut self, symbol: &str, reading: SignalReading) -> Self {
        self.quotes.entry(symbol.to_string()).or_default().signal = Some(reading);
        self
    }

    fn unavailable(symbol: &str, what: &str) -> LedgerError {
        LedgerError::Feed {
            symbol: symbol.to_string(),
            reason: format!("no {what} supplied"),
        }
    }
}

impl MarketDataPort for QuoteFeedAdapter {
    fn current_price(&self, symbol: &str) -> Result<f64, LedgerError> {
        self.quotes
            .get(symbol)
            .and_then(|q| q.price)
            .ok_or_else(|| Self::unavailable(symbol, "price"))
    }

    fn volatility(&self, symbol: &str) -> Result<f64, LedgerError> {
        self.quotes
            .get(symbol)
            .and_then(|q| q.volatility_pct)
            .ok_or_else(|| Self::unavailable(symbol, "volatility"))
    }
}

impl SignalPort for QuoteFeedAdapter {
    fn current_signal(&self, symbol: &str) -> Result<SignalReading, LedgerError> {
        self.quotes
            .get(symbol)
            .and_then(|q| q.signal)
            .ok_or_else(|| Self::unavailable(symbol, "signal"))
    }
}
