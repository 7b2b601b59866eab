//! SQLite storage adapter: trade ledger, allocation store, run log and
//! position table in one database.

use crate::domain::allocation::Allocation;
use crate::domain::computation_run::{AllocationScope, ComputationRun, RunStatus, SymbolFailure};
use crate::domain::error::LedgerError;
use crate::domain::position::Position;
use crate::domain::trade::{format_timestamp, parse_timestamp, Side, Trade};
use crate::ports::allocation_port::{AllocationStorePort, WriteOutcome};
use crate::ports::config_port::ConfigPort;
use crate::ports::ledger_port::TradeLedgerPort;
use crate::ports::position_port::PositionStorePort;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS trades (
    trade_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL CHECK (side IN ('buy', 'sell')),
    size REAL NOT NULL,
    price REAL NOT NULL,
    fee REAL NOT NULL,
    executed_at TEXT NOT NULL,
    inserted_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_symbol_time ON trades(symbol, executed_at, trade_id);
CREATE INDEX IF NOT EXISTS idx_trades_inserted_at ON trades(inserted_at);

CREATE TABLE IF NOT EXISTS allocation_sets (
    symbol TEXT NOT NULL,
    version INTEGER NOT NULL,
    batch_id TEXT NOT NULL,
    computed_at TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    PRIMARY KEY (symbol, version)
);

CREATE TABLE IF NOT EXISTS allocations (
    version INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    seq INTEGER NOT NULL,
    sell_trade_id TEXT NOT NULL,
    buy_trade_id TEXT,
    allocated_size REAL NOT NULL,
    cost_basis REAL,
    proceeds REAL NOT NULL,
    fees_allocated REAL NOT NULL,
    profit_loss REAL,
    batch_id TEXT NOT NULL,
    computed_at TEXT NOT NULL,
    PRIMARY KEY (version, symbol, seq),
    FOREIGN KEY (symbol, version) REFERENCES allocation_sets(symbol, version)
);
CREATE INDEX IF NOT EXISTS idx_allocations_sell ON allocations(sell_trade_id, version);

CREATE TABLE IF NOT EXISTS computation_runs (
    batch_id TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    scope TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    buys_processed INTEGER NOT NULL,
    sells_processed INTEGER NOT NULL,
    allocations_created INTEGER NOT NULL,
    unmatched_sells INTEGER NOT NULL,
    symbols_computed TEXT NOT NULL,
    symbols_skipped TEXT NOT NULL,
    failures TEXT NOT NULL,
    total_pnl REAL NOT NULL,
    status TEXT NOT NULL,
    error TEXT
);

CREATE TABLE IF NOT EXISTS positions (
    symbol TEXT PRIMARY KEY,
    entry_price REAL NOT NULL,
    entry_time TEXT NOT NULL,
    size REAL NOT NULL,
    peak_price REAL NOT NULL,
    trailing_active INTEGER NOT NULL,
    stop_price REAL
);";

type Conn = PooledConnection<SqliteConnectionManager>;

fn pool_err(e: r2d2::Error) -> LedgerError {
    LedgerError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: rusqlite::Error) -> LedgerError {
    LedgerError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
}

fn timestamp_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(&text).map_err(|e| conversion_err(idx, e))
}

fn optional_timestamp_at(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_timestamp(&t).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn encode_failures(failures: &[SymbolFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}\t{}", f.symbol, f.reason.replace('\n', " ")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_failures(text: &str) -> Vec<SymbolFailure> {
    text.lines()
        .filter(|l| !l.is_empty())
        .map(|line| match line.split_once('\t') {
            Some((symbol, reason)) => SymbolFailure {
                symbol: symbol.to_string(),
                reason: reason.to_string(),
            },
            None => SymbolFailure {
                symbol: line.to_string(),
                reason: String::new(),
            },
        })
        .collect()
}

fn trade_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
    let side: String = row.get(2)?;
    Ok(Trade {
        trade_id: row.get(0)?,
        symbol: row.get(1)?,
        side: side.parse::<Side>().map_err(|e| conversion_err(2, e))?,
        size: row.get(3)?,
        price: row.get(4)?,
        fee: row.get(5)?,
        executed_at: timestamp_at(row, 6)?,
    })
}

fn allocation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Allocation> {
    Ok(Allocation {
        version: row.get(0)?,
        symbol: row.get(1)?,
        sell_trade_id: row.get(2)?,
        buy_trade_id: row.get(3)?,
        allocated_size: row.get(4)?,
        cost_basis: row.get(5)?,
        proceeds: row.get(6)?,
        fees_allocated: row.get(7)?,
        profit_loss: row.get(8)?,
        batch_id: row.get(9)?,
        computed_at: timestamp_at(row, 10)?,
    })
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ComputationRun> {
    let scope: Option<String> = row.get(2)?;
    let computed: String = row.get(9)?;
    let skipped: String = row.get(10)?;
    let failures: String = row.get(11)?;
    let status: String = row.get(13)?;
    Ok(ComputationRun {
        batch_id: row.get(0)?,
        version: row.get(1)?,
        scope: scope.map_or(AllocationScope::All, |s| AllocationScope::parse(&s)),
        started_at: timestamp_at(row, 3)?,
        finished_at: optional_timestamp_at(row, 4)?,
        buys_processed: row.get::<_, i64>(5)? as usize,
        sells_processed: row.get::<_, i64>(6)? as usize,
        allocations_created: row.get::<_, i64>(7)? as usize,
        unmatched_sells: row.get::<_, i64>(8)? as usize,
        symbols_computed: split_list(&computed),
        symbols_skipped: split_list(&skipped),
        failures: decode_failures(&failures),
        total_pnl: row.get(12)?,
        status: status
            .parse::<RunStatus>()
            .map_err(|e| conversion_err(13, e))?,
        error: row.get(14)?,
    })
}

fn position_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        symbol: row.get(0)?,
        entry_price: row.get(1)?,
        entry_time: timestamp_at(row, 2)?,
        size: row.get(3)?,
        peak_price: row.get(4)?,
        trailing_active: row.get(5)?,
        stop_price: row.get(6)?,
    })
}

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, LedgerError> {
        let db_path = config.require_string("sqlite", "path")?;
        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;
        Self::open(db_path, pool_size)
    }

    pub fn open<P: AsRef<Path>>(path: P, pool_size: u32) -> Result<Self, LedgerError> {
        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(pool_err)?;

        Ok(Self { pool })
    }

    pub fn in_memory() -> Result<Self, LedgerError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(pool_err)?;

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<Conn, LedgerError> {
        self.pool.get().map_err(pool_err)
    }

    pub fn initialize_schema(&self) -> Result<(), LedgerError> {
        self.conn()?.execute_batch(SCHEMA).map_err(query_err)
    }

    pub fn trade_count(&self) -> Result<usize, LedgerError> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))
            .map_err(query_err)?;
        Ok(count as usize)
    }
}

impl TradeLedgerPort for SqliteAdapter {
    fn list_trades(&self, symbol: Option<&str>) -> Result<Vec<Trade>, LedgerError> {
        let conn = self.conn()?;
        let base = "SELECT trade_id, symbol, side, size, price, fee, executed_at FROM trades";
        let rows = match symbol {
            Some(symbol) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "{base} WHERE symbol = ?1 ORDER BY executed_at, trade_id"
                    ))
                    .map_err(query_err)?;
                let rows = stmt
                    .query_map(params![symbol], trade_from_row)
                    .map_err(query_err)?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("{base} ORDER BY symbol, executed_at, trade_id"))
                    .map_err(query_err)?;
                let rows = stmt
                    .query_map([], trade_from_row)
                    .map_err(query_err)?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
        };
        rows.map_err(query_err)
    }

    fn list_symbols(&self) -> Result<Vec<String>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT symbol FROM trades ORDER BY symbol")
            .map_err(query_err)?;
        let symbols = stmt
            .query_map([], |row| row.get(0))
            .map_err(query_err)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(query_err)?;
        Ok(symbols)
    }

    fn insert_trades(&self, trades: &[Trade]) -> Result<usize, LedgerError> {
        for trade in trades {
            trade.validate()?;
        }

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_err)?;
        let inserted_at = format_timestamp(&Utc::now());
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO trades
                     (trade_id, symbol, side, size, price, fee, executed_at, inserted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(query_err)?;
            for trade in trades {
                inserted += stmt
                    .execute(params![
                        trade.trade_id,
                        trade.symbol,
                        trade.side.as_str(),
                        trade.size,
                        trade.price,
                        trade.fee,
                        format_timestamp(&trade.executed_at),
                        inserted_at,
                    ])
                    .map_err(query_err)?;
            }
        }
        tx.commit().map_err(query_err)?;

        debug!(offered = trades.len(), inserted, "trades appended");
        Ok(inserted)
    }

    fn symbols_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<String>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT symbol FROM trades
                 WHERE executed_at >= ?1 OR inserted_at >= ?1
                 ORDER BY symbol",
            )
            .map_err(query_err)?;
        let symbols = stmt
            .query_map(params![format_timestamp(&since)], |row| row.get(0))
            .map_err(query_err)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(query_err)?;
        Ok(symbols)
    }
}

impl AllocationStorePort for SqliteAdapter {
    fn latest_version(&self) -> Result<Option<i64>, LedgerError> {
        self.conn()?
            .query_row(
                "SELECT MAX(v) FROM (
                     SELECT MAX(version) AS v FROM allocation_sets
                     UNION ALL
                     SELECT MAX(version) AS v FROM computation_runs
                 )",
                [],
                |row| row.get(0),
            )
            .map_err(query_err)
    }

    fn list_versions(&self) -> Result<Vec<i64>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT version FROM allocation_sets ORDER BY version")
            .map_err(query_err)?;
        let versions = stmt
            .query_map([], |row| row.get(0))
            .map_err(query_err)?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(query_err)?;
        Ok(versions)
    }

    fn has_allocation_set(&self, symbol: &str, version: i64) -> Result<bool, LedgerError> {
        let found: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT 1 FROM allocation_sets WHERE symbol = ?1 AND version = ?2",
                params![symbol, version],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_err)?;
        Ok(found.is_some())
    }

    fn write_symbol_allocations(
        &self,
        symbol: &str,
        version: i64,
        batch_id: &str,
        rows: &[Allocation],
        force: bool,
    ) -> Result<WriteOutcome, LedgerError> {
        let mut conn = self.conn()?;
        // IMMEDIATE takes the write lock up front, so two writers of the same
        // (symbol, version) cannot both see it absent.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_err)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT batch_id FROM allocation_sets WHERE symbol = ?1 AND version = ?2",
                params![symbol, version],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_err)?;

        if let Some(previous) = existing {
            if !force {
                return Ok(WriteOutcome::AlreadyPresent);
            }
            let removed = tx
                .execute(
                    "DELETE FROM allocations WHERE symbol = ?1 AND version = ?2",
                    params![symbol, version],
                )
                .map_err(query_err)?;
            tx.execute(
                "DELETE FROM allocation_sets WHERE symbol = ?1 AND version = ?2",
                params![symbol, version],
            )
            .map_err(query_err)?;
            info!(symbol, version, previous_batch = %previous, removed, "replacing allocation set");
        }

        let computed_at = rows
            .first()
            .map_or_else(Utc::now, |r| r.computed_at);
        tx.execute(
            "INSERT INTO allocation_sets (symbol, version, batch_id, computed_at, row_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                symbol,
                version,
                batch_id,
                format_timestamp(&computed_at),
                rows.len() as i64
            ],
        )
        .map_err(query_err)?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO allocations
                     (version, symbol, seq, sell_trade_id, buy_trade_id, allocated_size,
                      cost_basis, proceeds, fees_allocated, profit_loss, batch_id, computed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                )
                .map_err(query_err)?;
            for (seq, row) in rows.iter().enumerate() {
                stmt.execute(params![
                    version,
                    symbol,
                    seq as i64,
                    row.sell_trade_id,
                    row.buy_trade_id,
                    row.allocated_size,
                    row.cost_basis,
                    row.proceeds,
                    row.fees_allocated,
                    row.profit_loss,
                    batch_id,
                    format_timestamp(&row.computed_at),
                ])
                .map_err(query_err)?;
            }
        }

        tx.commit().map_err(query_err)?;
        Ok(WriteOutcome::Written)
    }

    fn list_allocations(
        &self,
        version: i64,
        symbol: Option<&str>,
    ) -> Result<Vec<Allocation>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT version, symbol, sell_trade_id, buy_trade_id, allocated_size,
                        cost_basis, proceeds, fees_allocated, profit_loss, batch_id, computed_at
                 FROM allocations
                 WHERE version = ?1 AND (?2 IS NULL OR symbol = ?2)
                 ORDER BY symbol, seq",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![version, symbol], allocation_from_row)
            .map_err(query_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(query_err)?;
        Ok(rows)
    }

    fn record_run(&self, run: &ComputationRun) -> Result<(), LedgerError> {
        let scope = match &run.scope {
            AllocationScope::All => None,
            AllocationScope::Symbols(symbols) => Some(symbols.join(",")),
        };
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO computation_runs
                 (batch_id, version, scope, started_at, finished_at, buys_processed,
                  sells_processed, allocations_created, unmatched_sells, symbols_computed,
                  symbols_skipped, failures, total_pnl, status, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    run.batch_id,
                    run.version,
                    scope,
                    format_timestamp(&run.started_at),
                    run.finished_at.as_ref().map(format_timestamp),
                    run.buys_processed as i64,
                    run.sells_processed as i64,
                    run.allocations_created as i64,
                    run.unmatched_sells as i64,
                    run.symbols_computed.join(","),
                    run.symbols_skipped.join(","),
                    encode_failures(&run.failures),
                    run.total_pnl,
                    run.status.as_str(),
                    run.error,
                ],
            )
            .map_err(query_err)?;
        Ok(())
    }

    fn get_run(&self, batch_id: &str) -> Result<Option<ComputationRun>, LedgerError> {
        self.conn()?
            .query_row(
                "SELECT batch_id, version, scope, started_at, finished_at, buys_processed,
                        sells_processed, allocations_created, unmatched_sells,
                        symbols_computed, symbols_skipped, failures, total_pnl, status, error
                 FROM computation_runs WHERE batch_id = ?1",
                params![batch_id],
                run_from_row,
            )
            .optional()
            .map_err(query_err)
    }
}

impl PositionStorePort for SqliteAdapter {
    fn load_positions(&self) -> Result<Vec<Position>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT symbol, entry_price, entry_time, size, peak_price, trailing_active,
                        stop_price
                 FROM positions ORDER BY symbol",
            )
            .map_err(query_err)?;
        let positions = stmt
            .query_map([], position_from_row)
            .map_err(query_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(query_err)?;
        Ok(positions)
    }

    fn save_position(&self, position: &Position) -> Result<(), LedgerError> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO positions
                 (symbol, entry_price, entry_time, size, peak_price, trailing_active, stop_price)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    position.symbol,
                    position.entry_price,
                    format_timestamp(&position.entry_time),
                    position.size,
                    position.peak_price,
                    position.trailing_active,
                    position.stop_price,
                ],
            )
            .map_err(query_err)?;
        Ok(())
    }

    fn remove_position(&self, symbol: &str) -> Result<(), LedgerError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])
            .map_err(query_err)?;
        if removed == 0 {
            return Err(LedgerError::PositionNotFound {
                symbol: symbol.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct EmptyConfig;

    impl ConfigPort for EmptyConfig {
        fn get_string(&self, _section: &str, _key: &str) -> Option<String> {
            None
        }
        fn get_int(&self, _section: &str, _key: &str, default: i64) -> i64 {
            default
        }
        fn get_double(&self, _section: &str, _key: &str, default: f64) -> f64 {
            default
        }
        fn get_bool(&self, _section: &str, _key: &str, default: bool) -> bool {
            default
        }
    }

    fn adapter() -> SqliteAdapter {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.initialize_schema().unwrap();
        adapter
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()
    }

    fn trade(id: &str, symbol: &str, side: Side, size: f64, price: f64, day: u32) -> Trade {
        Trade {
            trade_id: id.to_string(),
            symbol: symbol.to_string(),
            side,
            size,
            price,
            fee: 0.5,
            executed_at: ts(day),
        }
    }

    fn allocation(symbol: &str, sell: &str, buy: Option<&str>, version: i64) -> Allocation {
        Allocation {
            sell_trade_id: sell.to_string(),
            buy_trade_id: buy.map(str::to_string),
            symbol: symbol.to_string(),
            allocated_size: 2.0,
            cost_basis: buy.map(|_| 200.0),
            proceeds: 240.0,
            fees_allocated: 0.25,
            profit_loss: buy.map(|_| 40.0),
            version,
            batch_id: "batch-a".to_string(),
            computed_at: ts(10),
        }
    }

    #[test]
    fn from_config_missing_path() {
        let config = EmptyConfig;
        let result = SqliteAdapter::from_config(&config);
        match result {
            Err(LedgerError::ConfigMissing { section, key }) => {
                assert_eq!(section, "sqlite");
                assert_eq!(key, "path");
            }
            Err(other) => panic!("expected ConfigMissing, got: {other}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }

    #[test]
    fn in_memory_initialization_is_repeatable() {
        let adapter = adapter();
        adapter.initialize_schema().unwrap();
        assert_eq!(adapter.trade_count().unwrap(), 0);
    }

    #[test]
    fn insert_trades_is_idempotent_on_id() {
        let adapter = adapter();
        let trades = vec![
            trade("t2", "BTC", Side::Sell, 1.0, 120.0, 2),
            trade("t1", "BTC", Side::Buy, 1.0, 100.0, 1),
            trade("t3", "ETH", Side::Buy, 3.0, 10.0, 1),
        ];
        assert_eq!(adapter.insert_trades(&trades).unwrap(), 3);
        assert_eq!(adapter.insert_trades(&trades).unwrap(), 0);
        assert_eq!(adapter.trade_count().unwrap(), 3);

        let btc = adapter.list_trades(Some("BTC")).unwrap();
        assert_eq!(btc.len(), 2);
        assert_eq!(btc[0].trade_id, "t1");
        assert_eq!(btc[1].side, Side::Sell);
        assert_eq!(btc[1].executed_at, ts(2));

        assert_eq!(adapter.list_symbols().unwrap(), vec!["BTC", "ETH"]);
    }

    #[test]
    fn insert_rejects_invalid_batch_whole() {
        let adapter = adapter();
        let trades = vec![
            trade("t1", "BTC", Side::Buy, 1.0, 100.0, 1),
            trade("t2", "BTC", Side::Buy, -1.0, 100.0, 1),
        ];
        assert!(adapter.insert_trades(&trades).is_err());
        assert_eq!(adapter.trade_count().unwrap(), 0);
    }

    #[test]
    fn changed_since_sees_late_inserts() {
        let adapter = adapter();
        let before = Utc::now() - chrono::Duration::seconds(1);
        adapter
            .insert_trades(&[trade("t1", "SOL", Side::Buy, 1.0, 20.0, 1)])
            .unwrap();
        // Executed long ago but ingested just now.
        assert_eq!(adapter.symbols_changed_since(before).unwrap(), vec!["SOL"]);
        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(adapter.symbols_changed_since(later).unwrap().is_empty());
    }

    #[test]
    fn write_and_read_allocation_set() {
        let adapter = adapter();
        let rows = vec![
            allocation("BTC", "s1", Some("b1"), 1),
            allocation("BTC", "s1", None, 1),
        ];
        let outcome = adapter
            .write_symbol_allocations("BTC", 1, "batch-a", &rows, false)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert!(adapter.has_allocation_set("BTC", 1).unwrap());
        assert!(!adapter.has_allocation_set("BTC", 2).unwrap());

        let stored = adapter.list_allocations(1, Some("BTC")).unwrap();
        assert_eq!(stored, rows);
        assert!(stored[1].buy_trade_id.is_none());
        assert!(stored[1].profit_loss.is_none());
    }

    #[test]
    fn second_write_without_force_is_skipped() {
        let adapter = adapter();
        let rows = vec![allocation("BTC", "s1", Some("b1"), 1)];
        adapter
            .write_symbol_allocations("BTC", 1, "batch-a", &rows, false)
            .unwrap();

        let other = vec![allocation("BTC", "s9", None, 1)];
        let outcome = adapter
            .write_symbol_allocations("BTC", 1, "batch-b", &other, false)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::AlreadyPresent);
        assert_eq!(adapter.list_allocations(1, None).unwrap(), rows);
    }

    #[test]
    fn forced_write_replaces_only_that_symbol() {
        let adapter = adapter();
        adapter
            .write_symbol_allocations("BTC", 1, "batch-a", &[allocation("BTC", "s1", Some("b1"), 1)], false)
            .unwrap();
        adapter
            .write_symbol_allocations("ETH", 1, "batch-a", &[allocation("ETH", "s2", Some("b2"), 1)], false)
            .unwrap();

        let replacement = vec![allocation("BTC", "s1", None, 1)];
        adapter
            .write_symbol_allocations("BTC", 1, "batch-b", &replacement, true)
            .unwrap();

        let btc = adapter.list_allocations(1, Some("BTC")).unwrap();
        assert_eq!(btc, replacement);
        assert_eq!(adapter.list_allocations(1, Some("ETH")).unwrap().len(), 1);
    }

    #[test]
    fn empty_set_still_claims_version() {
        let adapter = adapter();
        adapter
            .write_symbol_allocations("DOGE", 3, "batch-a", &[], false)
            .unwrap();
        assert!(adapter.has_allocation_set("DOGE", 3).unwrap());
        assert_eq!(adapter.list_versions().unwrap(), vec![3]);
        assert_eq!(adapter.latest_version().unwrap(), Some(3));
    }

    #[test]
    fn latest_version_counts_recorded_runs() {
        let adapter = adapter();
        assert_eq!(adapter.latest_version().unwrap(), None);
        let run = ComputationRun::start("b-1".into(), 7, AllocationScope::All);
        adapter.record_run(&run).unwrap();
        assert_eq!(adapter.latest_version().unwrap(), Some(7));
    }

    #[test]
    fn run_round_trips() {
        let adapter = adapter();
        let mut run = ComputationRun::start(
            "b-2".into(),
            2,
            AllocationScope::Symbols(vec!["BTC".into(), "ETH".into()]),
        );
        adapter.record_run(&run).unwrap();
        assert_eq!(
            adapter.get_run("b-2").unwrap().unwrap().status,
            RunStatus::Running
        );

        run.symbols_computed.push("BTC".into());
        run.failures.push(SymbolFailure {
            symbol: "ETH".into(),
            reason: "invalid trade e1: size must be positive".into(),
        });
        run.total_pnl = 12.5;
        run.finish();
        adapter.record_run(&run).unwrap();

        let stored = adapter.get_run("b-2").unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Partial);
        assert_eq!(stored.failed_symbols(), vec!["ETH".to_string()]);
        assert_eq!(stored.failures[0].reason, run.failures[0].reason);
        assert_eq!(stored.symbols_computed, vec!["BTC".to_string()]);
        assert!(stored.symbols_skipped.is_empty());
        assert_eq!(stored.scope, run.scope);
        assert!(stored.finished_at.is_some());
        assert_eq!(stored.error, run.error);

        assert!(adapter.get_run("missing").unwrap().is_none());
    }

    #[test]
    fn positions_overwrite_in_place() {
        let adapter = adapter();
        let mut pos = Position::open("ETH", 100.0, 2.0, ts(1));
        adapter.save_position(&pos).unwrap();

        pos.trailing_active = true;
        pos.peak_price = 108.0;
        pos.stop_price = Some(105.84);
        adapter.save_position(&pos).unwrap();

        let loaded = adapter.load_positions().unwrap();
        assert_eq!(loaded, vec![pos]);

        adapter.remove_position("ETH").unwrap();
        assert!(adapter.load_positions().unwrap().is_empty());
        assert!(matches!(
            adapter.remove_position("ETH"),
            Err(LedgerError::PositionNotFound { .. })
        ));
    }

    #[test]
    fn concurrent_writers_of_one_set_commit_once() {
        use std::sync::Barrier;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        SqliteAdapter::open(&path, 1)
            .unwrap()
            .initialize_schema()
            .unwrap();

        let barrier = Barrier::new(2);
        let outcomes: Vec<WriteOutcome> = thread::scope(|s| {
            let handles: Vec<_> = ["batch-a", "batch-b"]
                .into_iter()
                .map(|batch| {
                    let (path, barrier) = (&path, &barrier);
                    s.spawn(move || {
                        let writer = SqliteAdapter::open(path, 1).unwrap();
                        let rows: Vec<Allocation> = [("s1", Some("b1")), ("s1", None)]
                            .into_iter()
                            .map(|(sell, buy)| Allocation {
                                batch_id: batch.to_string(),
                                ..allocation("ETH", sell, buy, 1)
                            })
                            .collect();
                        barrier.wait();
                        writer
                            .write_symbol_allocations("ETH", 1, batch, &rows, false)
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(
            outcomes.iter().filter(|o| **o == WriteOutcome::Written).count(),
            1
        );
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == WriteOutcome::AlreadyPresent)
                .count(),
            1
        );

        let reader = SqliteAdapter::open(&path, 1).unwrap();
        let stored = reader.list_allocations(1, Some("ETH")).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.batch_id == stored[0].batch_id));
    }
}
