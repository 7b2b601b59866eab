//! CSV adapters: the venue fill export and the trade import file.
//!
//! Both files share one layout:
//! `id,symbol,side,size,price,fee,executed_at`, with a header row.

use crate::domain::error::LedgerError;
use crate::domain::reconciliation::VenueFill;
use crate::domain::trade::{parse_timestamp, Side, Trade};
use crate::ports::venue_port::VenueHistoryPort;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

struct Row {
    id: String,
    symbol: String,
    side: Side,
    size: f64,
    price: f64,
    fee: f64,
    executed_at: DateTime<Utc>,
}

fn column<'r>(record: &'r csv::StringRecord, idx: usize, name: &str) -> Result<&'r str, String> {
    record
        .get(idx)
        .map(str::trim)
        .ok_or_else(|| format!("missing {name} column"))
}

fn number(record: &csv::StringRecord, idx: usize, name: &str) -> Result<f64, String> {
    column(record, idx, name)?
        .parse()
        .map_err(|e| format!("invalid {name} value: {e}"))
}

fn parse_row(record: &csv::StringRecord) -> Result<Row, String> {
    let id = column(record, 0, "id")?.to_string();
    let symbol = column(record, 1, "symbol")?.to_uppercase();
    let side: Side = column(record, 2, "side")?.parse()?;
    let size = number(record, 3, "size")?;
    let price = number(record, 4, "price")?;
    let fee = match column(record, 5, "fee")? {
        "" => 0.0,
        _ => number(record, 5, "fee")?,
    };
    let ts = column(record, 6, "executed_at")?;
    let executed_at =
        parse_timestamp(ts).map_err(|e| format!("invalid executed_at {ts:?}: {e}"))?;

    Ok(Row {
        id,
        symbol,
        side,
        size,
        price,
        fee,
        executed_at,
    })
}

fn read_rows(content: &str) -> Result<Vec<Row>, (usize, String)> {
    let mut rdr = csv::Reader::from_reader(content.as_bytes());
    let mut rows = Vec::new();
    for (idx, result) in rdr.records().enumerate() {
        // Header is line 1.
        let line = idx + 2;
        let record = result.map_err(|e| (line, format!("CSV parse error: {e}")))?;
        rows.push(parse_row(&record).map_err(|e| (line, e))?);
    }
    Ok(rows)
}

/// Read a trade CSV for import. Every row must parse and validate.
pub fn read_trades_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Trade>, LedgerError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    parse_trades_csv(&content).map_err(|e| match e {
        LedgerError::InvalidTrade { trade_id, reason } => LedgerError::InvalidTrade {
            trade_id,
            reason: format!("{}: {reason}", path.display()),
        },
        other => other,
    })
}

pub fn parse_trades_csv(content: &str) -> Result<Vec<Trade>, LedgerError> {
    let rows = read_rows(content).map_err(|(line, reason)| LedgerError::InvalidTrade {
        trade_id: format!("line {line}"),
        reason,
    })?;

    let trades: Vec<Trade> = rows
        .into_iter()
        .map(|r| Trade {
            trade_id: r.id,
            symbol: r.symbol,
            side: r.side,
            size: r.size,
            price: r.price,
            fee: r.fee,
            executed_at: r.executed_at,
        })
        .collect();

    for trade in &trades {
        trade.validate()?;
    }
    Ok(trades)
}

/// Authoritative venue history read from an exported fill file.
pub struct CsvFillsAdapter {
    path: PathBuf,
}

impl CsvFillsAdapter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<Vec<VenueFill>, LedgerError> {
        let content = fs::read_to_string(&self.path).map_err(|e| LedgerError::Venue {
            reason: format!("failed to read {}: {}", self.path.display(), e),
        })?;
        let rows = read_rows(&content).map_err(|(line, reason)| LedgerError::Venue {
            reason: format!("{} line {line}: {reason}", self.path.display()),
        })?;
        Ok(rows
            .into_iter()
            .map(|r| VenueFill {
                fill_id: r.id,
                symbol: r.symbol,
                side: r.side,
                size: r.size,
                price: r.price,
                fee: r.fee,
                executed_at: r.executed_at,
            })
            .collect())
    }
}

impl VenueHistoryPort for CsvFillsAdapter {
    fn list_fills(
        &self,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<VenueFill>, LedgerError> {
        let symbol = symbol.to_uppercase();
        let mut fills: Vec<VenueFill> = self
            .load()?
            .into_iter()
            .filter(|f| f.symbol == symbol)
            .filter(|f| since.is_none_or(|s| f.executed_at >= s))
            .collect();
        fills.sort_by(|a, b| {
            a.executed_at
                .cmp(&b.executed_at)
                .then_with(|| a.fill_id.cmp(&b.fill_id))
        });
        Ok(fills)
    }
}
