//! Trade ledger port: the append-only store of executed trades.

use chrono::{DateTime, Utc};

use crate::domain::error::LedgerError;
use crate::domain::trade::Trade;

pub trait TradeLedgerPort {
    /// Trades for one symbol, or every symbol, in matching order.
    fn list_trades(&self, symbol: Option<&str>) -> Result<Vec<Trade>, LedgerError>;

    fn list_symbols(&self) -> Result<Vec<String>, LedgerError>;

    /// Append trades. Rows whose `trade_id` already exists are left untouched;
    /// returns how many were actually inserted.
    fn insert_trades(&self, trades: &[Trade]) -> Result<usize, LedgerError>;

    /// Symbols with any trade that reached the ledger at or after `since`.
    ///
    /// The default looks at execution time. Stores that record ingestion time
    /// should also report symbols whose older trades were backfilled late.
    fn symbols_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<String>, LedgerError> {
        let mut symbols: Vec<String> = self
            .list_trades(None)?
            .into_iter()
            .filter(|t| t.executed_at >= since)
            .map(|t| t.symbol)
            .collect();
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }
}
