#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use lotwarden::domain::allocation::Allocation;
use lotwarden::domain::computation_run::ComputationRun;
use lotwarden::domain::error::LedgerError;
use lotwarden::domain::exit_rules::{Signal, SignalReading};
use lotwarden::domain::reconciliation::VenueFill;
pub use lotwarden::domain::trade::{Side, Trade};
use lotwarden::ports::allocation_port::{AllocationStorePort, WriteOutcome};
use lotwarden::ports::feed_port::{MarketDataPort, SignalPort};
use lotwarden::ports::ledger_port::TradeLedgerPort;
use lotwarden::ports::position_port::PositionStorePort;
use lotwarden::domain::position::Position;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

/// Minutes after a fixed base time.
pub fn ts(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn buy(id: &str, symbol: &str, size: f64, price: f64, at: i64) -> Trade {
    Trade {
        trade_id: id.to_string(),
        symbol: symbol.to_string(),
        side: Side::Buy,
        size,
        price,
        fee: 0.0,
        executed_at: ts(at),
    }
}

pub fn sell(id: &str, symbol: &str, size: f64, price: f64, at: i64) -> Trade {
    Trade {
        side: Side::Sell,
        ..buy(id, symbol, size, price, at)
    }
}

pub fn with_fee(mut trade: Trade, fee: f64) -> Trade {
    trade.fee = fee;
    trade
}

pub fn venue_buy(id: &str, symbol: &str, size: f64, price: f64, at: i64) -> VenueFill {
    VenueFill {
        fill_id: id.to_string(),
        symbol: symbol.to_string(),
        side: Side::Buy,
        size,
        price,
        fee: 0.0,
        executed_at: ts(at),
    }
}

// ---------------------------------------------------------------------------

pub struct MockLedger {
    trades: Mutex<Vec<Trade>>,
    failing: Mutex<HashSet<String>>,
    listing_down: Mutex<bool>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            trades: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            listing_down: Mutex::new(false),
        }
    }

    /// Stored as given, without validation, so broken rows can be seeded.
    pub fn with_trades(self, trades: Vec<Trade>) -> Self {
        self.trades.lock().unwrap().extend(trades);
        self
    }

    pub fn push(&self, trade: Trade) {
        self.trades.lock().unwrap().push(trade);
    }

    pub fn fail_symbol(&self, symbol: &str) {
        self.failing.lock().unwrap().insert(symbol.to_string());
    }

    pub fn heal_symbol(&self, symbol: &str) {
        self.failing.lock().unwrap().remove(symbol);
    }

    pub fn listing_outage(&self, down: bool) {
        *self.listing_down.lock().unwrap() = down;
    }

    pub fn snapshot(&self) -> Vec<Trade> {
        self.trades.lock().unwrap().clone()
    }
}

impl TradeLedgerPort for MockLedger {
    fn list_trades(&self, symbol: Option<&str>) -> Result<Vec<Trade>, LedgerError> {
        if let Some(s) = symbol {
            if self.failing.lock().unwrap().contains(s) {
                return Err(LedgerError::Database {
                    reason: format!("read of {s} timed out"),
                });
            }
        }
        let mut trades: Vec<Trade> = self
            .trades
            .lock()
            .unwrap()
            .iter()
            .filter(|t| symbol.is_none_or(|s| t.symbol == s))
            .cloned()
            .collect();
        lotwarden::domain::trade::sort_for_matching(&mut trades);
        Ok(trades)
    }

    fn list_symbols(&self) -> Result<Vec<String>, LedgerError> {
        if *self.listing_down.lock().unwrap() {
            return Err(LedgerError::Database {
                reason: "symbol index unavailable".to_string(),
            });
        }
        let mut symbols: Vec<String> = self
            .trades
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }

    fn insert_trades(&self, trades: &[Trade]) -> Result<usize, LedgerError> {
        let mut stored = self.trades.lock().unwrap();
        let mut inserted = 0;
        for trade in trades {
            trade.validate()?;
            if !stored.iter().any(|t| t.trade_id == trade.trade_id) {
                stored.push(trade.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

// ---------------------------------------------------------------------------

pub struct MockAllocationStore {
    sets: Mutex<BTreeMap<(String, i64), Vec<Allocation>>>,
    runs: Mutex<HashMap<String, ComputationRun>>,
    failing_writes: Mutex<HashSet<String>>,
    pub run_writes: Mutex<usize>,
}

impl MockAllocationStore {
    pub fn new() -> Self {
        Self {
            sets: Mutex::new(BTreeMap::new()),
            runs: Mutex::new(HashMap::new()),
            failing_writes: Mutex::new(HashSet::new()),
            run_writes: Mutex::new(0),
        }
    }

    pub fn fail_writes_for(&self, symbol: &str) {
        self.failing_writes.lock().unwrap().insert(symbol.to_string());
    }

    pub fn all_runs(&self) -> Vec<ComputationRun> {
        self.runs.lock().unwrap().values().cloned().collect()
    }
}

impl AllocationStorePort for MockAllocationStore {
    fn latest_version(&self) -> Result<Option<i64>, LedgerError> {
        let sets = self.sets.lock().unwrap().keys().map(|(_, v)| *v).max();
        let runs = self.runs.lock().unwrap().values().map(|r| r.version).max();
        Ok(sets.max(runs))
    }

    fn list_versions(&self) -> Result<Vec<i64>, LedgerError> {
        let mut versions: Vec<i64> = self.sets.lock().unwrap().keys().map(|(_, v)| *v).collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    fn has_allocation_set(&self, symbol: &str, version: i64) -> Result<bool, LedgerError> {
        Ok(self
            .sets
            .lock()
            .unwrap()
            .contains_key(&(symbol.to_string(), version)))
    }

    fn write_symbol_allocations(
        &self,
        symbol: &str,
        version: i64,
        _batch_id: &str,
        rows: &[Allocation],
        force: bool,
    ) -> Result<WriteOutcome, LedgerError> {
        if self.failing_writes.lock().unwrap().contains(symbol) {
            return Err(LedgerError::DatabaseQuery {
                reason: "disk I/O error".to_string(),
            });
        }
        let mut sets = self.sets.lock().unwrap();
        let key = (symbol.to_string(), version);
        if sets.contains_key(&key) && !force {
            return Ok(WriteOutcome::AlreadyPresent);
        }
        sets.insert(key, rows.to_vec());
        Ok(WriteOutcome::Written)
    }

    fn list_allocations(
        &self,
        version: i64,
        symbol: Option<&str>,
    ) -> Result<Vec<Allocation>, LedgerError> {
        Ok(self
            .sets
            .lock()
            .unwrap()
            .iter()
            .filter(|((s, v), _)| *v == version && symbol.is_none_or(|want| s == want))
            .flat_map(|(_, rows)| rows.iter().cloned())
            .collect())
    }

    fn record_run(&self, run: &ComputationRun) -> Result<(), LedgerError> {
        *self.run_writes.lock().unwrap() += 1;
        self.runs
            .lock()
            .unwrap()
            .insert(run.batch_id.clone(), run.clone());
        Ok(())
    }

    fn get_run(&self, batch_id: &str) -> Result<Option<ComputationRun>, LedgerError> {
        Ok(self.runs.lock().unwrap().get(batch_id).cloned())
    }
}

// ---------------------------------------------------------------------------

pub struct MockVenue {
    pub fills: Vec<VenueFill>,
    pub unavailable: bool,
}

impl MockVenue {
    pub fn new(fills: Vec<VenueFill>) -> Self {
        Self {
            fills,
            unavailable: false,
        }
    }

    pub fn down() -> Self {
        Self {
            fills: Vec::new(),
            unavailable: true,
        }
    }
}

impl lotwarden::ports::venue_port::VenueHistoryPort for MockVenue {
    fn list_fills(
        &self,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<VenueFill>, LedgerError> {
        if self.unavailable {
            return Err(LedgerError::Venue {
                reason: "venue API returned 503".to_string(),
            });
        }
        let mut fills: Vec<VenueFill> = self
            .fills
            .iter()
            .filter(|f| f.symbol == symbol)
            .filter(|f| since.is_none_or(|s| f.executed_at >= s))
            .cloned()
            .collect();
        fills.sort_by_key(|f| f.executed_at);
        Ok(fills)
    }
}

// ---------------------------------------------------------------------------

/// Price, volatility and signal feeds with per-symbol outages.
pub struct MockFeeds {
    prices: Mutex<HashMap<String, f64>>,
    volatility: Mutex<HashMap<String, f64>>,
    signals: Mutex<HashMap<String, SignalReading>>,
    signal_down: Mutex<bool>,
}

impl MockFeeds {
    pub fn new() -> Self {
        Self {
            prices: Mutex::new(HashMap::new()),
            volatility: Mutex::new(HashMap::new()),
            signals: Mutex::new(HashMap::new()),
            signal_down: Mutex::new(false),
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn clear_price(&self, symbol: &str) {
        self.prices.lock().unwrap().remove(symbol);
    }

    pub fn set_volatility(&self, symbol: &str, pct: f64) {
        self.volatility
            .lock()
            .unwrap()
            .insert(symbol.to_string(), pct);
    }

    pub fn set_signal(&self, symbol: &str, signal: Signal, as_of: DateTime<Utc>) {
        self.signals
            .lock()
            .unwrap()
            .insert(symbol.to_string(), SignalReading { signal, as_of });
    }

    pub fn signal_outage(&self, down: bool) {
        *self.signal_down.lock().unwrap() = down;
    }
}

impl MarketDataPort for MockFeeds {
    fn current_price(&self, symbol: &str) -> Result<f64, LedgerError> {
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| LedgerError::Feed {
                symbol: symbol.to_string(),
                reason: "no quote".to_string(),
            })
    }

    fn volatility(&self, symbol: &str) -> Result<f64, LedgerError> {
        self.volatility
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| LedgerError::Feed {
                symbol: symbol.to_string(),
                reason: "volatility not computed".to_string(),
            })
    }
}

impl SignalPort for MockFeeds {
    fn current_signal(&self, symbol: &str) -> Result<SignalReading, LedgerError> {
        if *self.signal_down.lock().unwrap() {
            return Err(LedgerError::Feed {
                symbol: symbol.to_string(),
                reason: "signal service unreachable".to_string(),
            });
        }
        Ok(self
            .signals
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .unwrap_or(SignalReading {
                signal: Signal::Neutral,
                as_of: Utc::now(),
            }))
    }
}

// ---------------------------------------------------------------------------

pub struct MockPositionStore {
    pub rows: Mutex<BTreeMap<String, Position>>,
    pub saves: Mutex<usize>,
}

impl MockPositionStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            saves: Mutex::new(0),
        }
    }
}

impl PositionStorePort for MockPositionStore {
    fn load_positions(&self) -> Result<Vec<Position>, LedgerError> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    fn save_position(&self, position: &Position) -> Result<(), LedgerError> {
        *self.saves.lock().unwrap() += 1;
        self.rows
            .lock()
            .unwrap()
            .insert(position.symbol.clone(), position.clone());
        Ok(())
    }

    fn remove_position(&self, symbol: &str) -> Result<(), LedgerError> {
        self.rows
            .lock()
            .unwrap()
            .remove(symbol)
            .map(|_| ())
            .ok_or_else(|| LedgerError::PositionNotFound {
                symbol: symbol.to_string(),
            })
    }
}
