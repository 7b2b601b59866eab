//! Read-only views over allocation versions.

use std::collections::{BTreeMap, HashMap};

use super::allocation::{allocated_per_sell, open_lots, Allocation, OpenLot};
use super::error::LedgerError;
use crate::ports::allocation_port::AllocationStorePort;
use crate::ports::ledger_port::TradeLedgerPort;

/// A sell whose allocation rows do not add up to its size.
#[derive(Debug, Clone, PartialEq)]
pub struct ConservationBreach {
    pub sell_trade_id: String,
    pub symbol: String,
    pub sell_size: f64,
    pub allocated: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSummary {
    pub version: i64,
    /// Row count for every stored version, oldest first.
    pub rows_per_version: Vec<(i64, usize)>,
    pub symbols: usize,
    pub matched_rows: usize,
    pub unmatched_rows: usize,
    pub unmatched_size: f64,
    pub total_pnl: f64,
    pub sells_checked: usize,
    /// Ledger sells in this version's symbols with no rows in it, typically
    /// imported after the version was computed.
    pub sells_not_covered: usize,
    pub breaches: Vec<ConservationBreach>,
}

impl HealthSummary {
    pub fn is_healthy(&self) -> bool {
        self.unmatched_rows == 0 && self.breaches.is_empty()
    }
}

/// Summarise one version and check every sell it allocated against the
/// ledger. Sells the version never saw are counted, not treated as breaches.
pub fn health_summary(
    ledger: &dyn TradeLedgerPort,
    store: &dyn AllocationStorePort,
    version: i64,
    epsilon: f64,
) -> Result<HealthSummary, LedgerError> {
    let mut rows_per_version = Vec::new();
    for v in store.list_versions()? {
        rows_per_version.push((v, store.list_allocations(v, None)?.len()));
    }

    let rows = store.list_allocations(version, None)?;
    let mut symbols: Vec<&str> = rows.iter().map(|r| r.symbol.as_str()).collect();
    symbols.sort_unstable();
    symbols.dedup();

    let matched_rows = rows.iter().filter(|r| r.is_matched()).count();
    let unmatched: Vec<&Allocation> = rows.iter().filter(|r| r.is_unmatched()).collect();
    let total_pnl = rows.iter().filter_map(|r| r.profit_loss).sum();

    let allocated = allocated_per_sell(&rows);
    let mut breaches = Vec::new();
    let mut sells_checked = 0;
    let mut sells_not_covered = 0;
    for symbol in &symbols {
        for trade in ledger.list_trades(Some(symbol))? {
            if !trade.is_sell() {
                continue;
            }
            let Some(&got) = allocated.get(trade.trade_id.as_str()) else {
                sells_not_covered += 1;
                continue;
            };
            sells_checked += 1;
            if (got - trade.size).abs() > epsilon {
                breaches.push(ConservationBreach {
                    sell_trade_id: trade.trade_id,
                    symbol: trade.symbol,
                    sell_size: trade.size,
                    allocated: got,
                });
            }
        }
    }

    Ok(HealthSummary {
        version,
        rows_per_version,
        symbols: symbols.len(),
        matched_rows,
        unmatched_rows: unmatched.len(),
        unmatched_size: unmatched.iter().map(|r| r.allocated_size).sum(),
        total_pnl,
        sells_checked,
        sells_not_covered,
        breaches,
    })
}

pub fn unmatched_sells(
    store: &dyn AllocationStorePort,
    version: i64,
) -> Result<Vec<Allocation>, LedgerError> {
    Ok(store
        .list_allocations(version, None)?
        .into_iter()
        .filter(Allocation::is_unmatched)
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolPnl {
    pub symbol: String,
    pub realized_pnl: f64,
    pub matched_rows: usize,
    pub unmatched_rows: usize,
    pub sells: usize,
    pub sells_with_unmatched: usize,
    pub winning_rows: usize,
    pub losing_rows: usize,
    /// Share of matched rows with positive P&L.
    pub win_rate: f64,
}

pub fn pnl_by_symbol(rows: &[Allocation]) -> Vec<SymbolPnl> {
    let mut by_symbol: BTreeMap<&str, Vec<&Allocation>> = BTreeMap::new();
    for row in rows {
        by_symbol.entry(row.symbol.as_str()).or_default().push(row);
    }

    by_symbol
        .into_iter()
        .map(|(symbol, rows)| {
            let mut sells: Vec<&str> = rows.iter().map(|r| r.sell_trade_id.as_str()).collect();
            sells.sort_unstable();
            sells.dedup();
            let mut short: Vec<&str> = rows
                .iter()
                .filter(|r| r.is_unmatched())
                .map(|r| r.sell_trade_id.as_str())
                .collect();
            short.sort_unstable();
            short.dedup();

            let pnls: Vec<f64> = rows.iter().filter_map(|r| r.profit_loss).collect();
            let winning_rows = pnls.iter().filter(|p| **p > 0.0).count();
            let losing_rows = pnls.iter().filter(|p| **p < 0.0).count();
            let win_rate = if pnls.is_empty() {
                0.0
            } else {
                winning_rows as f64 / pnls.len() as f64
            };

            SymbolPnl {
                symbol: symbol.to_string(),
                realized_pnl: pnls.iter().sum(),
                matched_rows: pnls.len(),
                unmatched_rows: rows.len() - pnls.len(),
                sells: sells.len(),
                sells_with_unmatched: short.len(),
                winning_rows,
                losing_rows,
                win_rate,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SellTotals {
    pub matched_size: f64,
    pub unmatched_size: f64,
    pub pnl: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SellDiff {
    pub symbol: String,
    pub sell_trade_id: String,
    /// `None` when the sell has no rows in that version.
    pub from: Option<SellTotals>,
    pub to: Option<SellTotals>,
}

fn totals_by_sell(rows: &[Allocation]) -> HashMap<(&str, &str), SellTotals> {
    let mut totals: HashMap<(&str, &str), SellTotals> = HashMap::new();
    for row in rows {
        let entry = totals
            .entry((row.symbol.as_str(), row.sell_trade_id.as_str()))
            .or_default();
        match row.profit_loss {
            Some(pnl) => {
                entry.matched_size += row.allocated_size;
                entry.pnl += pnl;
            }
            None => entry.unmatched_size += row.allocated_size,
        }
    }
    totals
}

fn totals_differ(a: &SellTotals, b: &SellTotals, epsilon: f64) -> bool {
    (a.matched_size - b.matched_size).abs() > epsilon
        || (a.unmatched_size - b.unmatched_size).abs() > epsilon
        || (a.pnl - b.pnl).abs() > epsilon
}

/// Sells whose outcome changed between two versions, ordered by symbol and
/// sell id.
pub fn diff_versions(
    store: &dyn AllocationStorePort,
    from: i64,
    to: i64,
    epsilon: f64,
) -> Result<Vec<SellDiff>, LedgerError> {
    let from_rows = store.list_allocations(from, None)?;
    let to_rows = store.list_allocations(to, None)?;
    let before = totals_by_sell(&from_rows);
    let after = totals_by_sell(&to_rows);

    let mut keys: Vec<(&str, &str)> = before.keys().chain(after.keys()).copied().collect();
    keys.sort_unstable();
    keys.dedup();

    Ok(keys
        .into_iter()
        .filter_map(|key| {
            let a = before.get(&key).copied();
            let b = after.get(&key).copied();
            let changed = match (&a, &b) {
                (Some(a), Some(b)) => totals_differ(a, b, epsilon),
                _ => true,
            };
            changed.then(|| SellDiff {
                symbol: key.0.to_string(),
                sell_trade_id: key.1.to_string(),
                from: a,
                to: b,
            })
        })
        .collect())
}

/// Remaining inventory per buy lot, derived from the ledger and one version.
pub fn inventory(
    ledger: &dyn TradeLedgerPort,
    store: &dyn AllocationStorePort,
    version: i64,
    symbol: Option<&str>,
    epsilon: f64,
) -> Result<Vec<OpenLot>, LedgerError> {
    let trades = ledger.list_trades(symbol)?;
    let rows = store.list_allocations(version, symbol)?;
    Ok(open_lots(&trades, &rows, epsilon))
}

/// One allocation as a stable text line, leaving out the per-run stamps, so
/// two computations can be compared byte for byte.
pub fn canonical_line(row: &Allocation) -> String {
    fn num(v: Option<f64>) -> String {
        v.map_or_else(|| "null".to_string(), |v| format!("{v:?}"))
    }
    format!(
        "{}|{}|{}|{}|{:?}|{}|{:?}|{:?}|{}",
        row.version,
        row.symbol,
        row.sell_trade_id,
        row.buy_trade_id.as_deref().unwrap_or("null"),
        row.allocated_size,
        num(row.cost_basis),
        row.proceeds,
        row.fees_allocated,
        num(row.profit_loss),
    )
}
