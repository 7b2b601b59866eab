//! The open-position set.
//!
//! Each symbol's position sits behind its own lock, so evaluations of one
//! symbol run strictly one after another while different symbols proceed
//! independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::LedgerError;
use super::exit_rules::{evaluate_position, ExitConfig, ExitDecision, TickInputs};
use super::position::Position;

#[derive(Debug, Default)]
pub struct PositionBook {
    positions: Mutex<HashMap<String, Arc<Mutex<Position>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_positions(positions: Vec<Position>) -> Self {
        let book = Self::new();
        {
            let mut map = lock(&book.positions);
            for pos in positions {
                map.insert(pos.symbol.clone(), Arc::new(Mutex::new(pos)));
            }
        }
        book
    }

    /// Register a confirmed entry. A symbol holds at most one position.
    pub fn open(&self, position: Position) -> Result<(), LedgerError> {
        let mut map = lock(&self.positions);
        if map.contains_key(&position.symbol) {
            return Err(LedgerError::PositionExists {
                symbol: position.symbol,
            });
        }
        map.insert(position.symbol.clone(), Arc::new(Mutex::new(position)));
        Ok(())
    }

    /// Drop a position once its exit is confirmed filled.
    pub fn close(&self, symbol: &str) -> Result<Position, LedgerError> {
        let entry = lock(&self.positions).remove(symbol).ok_or_else(|| {
            LedgerError::PositionNotFound {
                symbol: symbol.to_string(),
            }
        })?;
        let position = lock(&entry).clone();
        Ok(position)
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        let entry = lock(&self.positions).get(symbol).cloned()?;
        let position = lock(&entry).clone();
        Some(position)
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        lock(&self.positions).contains_key(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = lock(&self.positions).keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Evaluate one tick under the symbol's lock and return the decision with
    /// the position state it left behind.
    pub fn evaluate(
        &self,
        symbol: &str,
        tick: &TickInputs,
        config: &ExitConfig,
    ) -> Result<(ExitDecision, Position), LedgerError> {
        self.evaluate_then(symbol, tick, config, |_| ())
            .map(|(decision, position, _)| (decision, position))
    }

    /// Like [`evaluate`](Self::evaluate), but runs `on_change` with the new
    /// state before the symbol's lock is released. `on_change` is skipped
    /// when the tick left the position as it was.
    ///
    /// Whatever `on_change` writes therefore lands in tick order.
    pub fn evaluate_then<F, R>(
        &self,
        symbol: &str,
        tick: &TickInputs,
        config: &ExitConfig,
        on_change: F,
    ) -> Result<(ExitDecision, Position, Option<R>), LedgerError>
    where
        F: FnOnce(&Position) -> R,
    {
        let entry = lock(&self.positions)
            .get(symbol)
            .cloned()
            .ok_or_else(|| LedgerError::PositionNotFound {
                symbol: symbol.to_string(),
            })?;

        let mut position = lock(&entry);
        let before = position.clone();
        let decision = evaluate_position(&mut position, tick, config);
        let outcome = (*position != before).then(|| on_change(&position));
        Ok((decision, position.clone(), outcome))
    }
}
