//! Live market inputs for the exit engine.

use crate::domain::error::LedgerError;
use crate::domain::exit_rules::SignalReading;

pub trait MarketDataPort {
    fn current_price(&self, symbol: &str) -> Result<f64, LedgerError>;

    /// Volatility as a percentage of price.
    fn volatility(&self, symbol: &str) -> Result<f64, LedgerError>;
}

pub trait SignalPort {
    fn current_signal(&self, symbol: &str) -> Result<SignalReading, LedgerError>;
}
