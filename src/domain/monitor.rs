//! Polling tick: gather feed inputs, evaluate, persist.
//!
//! A feed failure never fails the tick. Without a price the position is held
//! untouched; without volatility the configured default distance is used;
//! without a fresh signal the signal rule simply cannot fire.

use chrono::{DateTime, Utc};
use std::thread;
use tracing::{debug, info, warn};

use super::error::LedgerError;
use super::exit_rules::{ExitConfig, ExitDecision, TickInputs};
use super::position::Position;
use super::position_book::PositionBook;
use crate::ports::feed_port::{MarketDataPort, SignalPort};
use crate::ports::position_port::PositionStorePort;

/// What one tick did for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub symbol: String,
    pub decision: ExitDecision,
    pub price: Option<f64>,
    /// Inputs that were unavailable and how the tick coped.
    pub degraded: Vec<String>,
}

pub struct PositionMonitor<'a> {
    pub book: &'a PositionBook,
    pub market: &'a (dyn MarketDataPort + Sync),
    pub signals: &'a (dyn SignalPort + Sync),
    pub store: Option<&'a (dyn PositionStorePort + Sync)>,
    pub config: ExitConfig,
}

impl<'a> PositionMonitor<'a> {
    pub fn new(
        book: &'a PositionBook,
        market: &'a (dyn MarketDataPort + Sync),
        signals: &'a (dyn SignalPort + Sync),
        config: ExitConfig,
    ) -> Self {
        PositionMonitor {
            book,
            market,
            signals,
            store: None,
            config,
        }
    }

    pub fn with_store(mut self, store: &'a (dyn PositionStorePort + Sync)) -> Self {
        self.store = Some(store);
        self
    }

    /// Evaluate one symbol. Errors only when no position is open for it.
    pub fn tick(&self, symbol: &str, now: DateTime<Utc>) -> Result<TickReport, LedgerError> {
        if !self.book.has_position(symbol) {
            return Err(LedgerError::PositionNotFound {
                symbol: symbol.to_string(),
            });
        }

        let mut degraded = Vec::new();

        let price = match self.market.current_price(symbol) {
            Ok(price) if price.is_finite() && price > 0.0 => price,
            Ok(price) => {
                warn!(symbol, price, at = %now, "unusable price, holding");
                degraded.push(format!("price {price} unusable"));
                return Ok(TickReport {
                    symbol: symbol.to_string(),
                    decision: ExitDecision::Hold,
                    price: None,
                    degraded,
                });
            }
            Err(e) => {
                warn!(symbol, at = %now, error = %e, "price feed unavailable, holding");
                degraded.push(format!("price feed unavailable: {e}"));
                return Ok(TickReport {
                    symbol: symbol.to_string(),
                    decision: ExitDecision::Hold,
                    price: None,
                    degraded,
                });
            }
        };

        let volatility_pct = match self.market.volatility(symbol) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(symbol, at = %now, error = %e, "volatility unavailable, using default distance");
                degraded.push(format!("volatility unavailable: {e}"));
                None
            }
        };

        let signal = match self.signals.current_signal(symbol) {
            Ok(reading) => {
                let fresh = reading.fresh(now, self.config.signal_max_age_secs);
                if fresh.is_none() {
                    debug!(symbol, as_of = %reading.as_of, "signal stale, ignoring");
                    degraded.push(format!("signal stale since {}", reading.as_of));
                }
                fresh
            }
            Err(e) => {
                warn!(symbol, at = %now, error = %e, "signal feed unavailable, risk rules only");
                degraded.push(format!("signal feed unavailable: {e}"));
                None
            }
        };

        let tick = TickInputs {
            price,
            volatility_pct,
            signal,
        };
        // Saved under the symbol's lock so the stored row never falls behind
        // a later tick.
        let persist = |state: &Position| match self.store {
            Some(store) => store.save_position(state),
            None => Ok(()),
        };
        let (decision, _, saved) = self.book.evaluate_then(symbol, &tick, &self.config, persist)?;

        if decision.is_exit() {
            info!(symbol, decision = decision.kind(), reason = %decision.reason(), price, "exit signalled");
        } else if let ExitDecision::TrailingActivated { .. } = decision {
            info!(symbol, reason = %decision.reason(), "trailing stop armed");
        }

        if let Some(Err(e)) = saved {
            warn!(symbol, at = %now, error = %e, "failed to persist position state");
            degraded.push(format!("state not persisted: {e}"));
        }

        Ok(TickReport {
            symbol: symbol.to_string(),
            decision,
            price: Some(price),
            degraded,
        })
    }

    /// Evaluate every open position, one thread per symbol.
    pub fn tick_all(&self, now: DateTime<Utc>) -> Vec<TickReport> {
        let symbols = self.book.symbols();
        let mut reports: Vec<TickReport> = thread::scope(|s| {
            let handles: Vec<_> = symbols
                .iter()
                .map(|symbol| s.spawn(move || self.tick(symbol, now)))
                .collect();
            handles
                .into_iter()
                .zip(symbols.iter())
                .filter_map(|(handle, symbol)| match handle.join() {
                    Ok(Ok(report)) => Some(report),
                    Ok(Err(e)) => {
                        // Closed between listing and evaluation.
                        debug!(symbol = %symbol, error = %e, "skipped tick");
                        None
                    }
                    Err(_) => {
                        warn!(symbol = %symbol, at = %now, "evaluation thread panicked");
                        None
                    }
                })
                .collect()
        });
        reports.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        reports
    }
}
