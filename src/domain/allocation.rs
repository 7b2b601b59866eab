//! FIFO lot matching: sells consume the oldest open buys of the same symbol.
//!
//! Everything here is a pure function of the trade history. Nothing reads or
//! writes storage, and the remaining size of a buy lot is never stored on the
//! trade; it exists only while a symbol is being matched, or is derived again
//! from allocation rows by [`open_lots`].

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

use super::error::LedgerError;
use super::trade::{sort_for_matching, Side, Trade};

/// Size below which a remainder counts as fully consumed.
pub const DEFAULT_EPSILON: f64 = 1e-9;

/// One consumption step: `allocated_size` of a sell matched against one buy,
/// or against nothing when `buy_trade_id` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub sell_trade_id: String,
    pub buy_trade_id: Option<String>,
    pub symbol: String,
    pub allocated_size: f64,
    pub cost_basis: Option<f64>,
    pub proceeds: f64,
    pub fees_allocated: f64,
    pub profit_loss: Option<f64>,
    pub version: i64,
    pub batch_id: String,
    pub computed_at: DateTime<Utc>,
}

impl Allocation {
    pub fn is_matched(&self) -> bool {
        self.buy_trade_id.is_some()
    }

    pub fn is_unmatched(&self) -> bool {
        self.buy_trade_id.is_none()
    }
}

/// Identity of a computation, stamped onto every row it produces.
#[derive(Debug, Clone)]
pub struct AllocationContext<'a> {
    pub version: i64,
    pub batch_id: &'a str,
    pub computed_at: DateTime<Utc>,
    pub epsilon: f64,
}

/// Result of matching one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolAllocation {
    pub symbol: String,
    pub rows: Vec<Allocation>,
    pub buys: usize,
    pub sells: usize,
}

impl SymbolAllocation {
    pub fn total_pnl(&self) -> f64 {
        self.rows.iter().filter_map(|r| r.profit_loss).sum()
    }

    pub fn unmatched_rows(&self) -> impl Iterator<Item = &Allocation> {
        self.rows.iter().filter(|r| r.is_unmatched())
    }
}

struct Lot<'t> {
    trade: &'t Trade,
    remaining: f64,
}

/// Match every sell of `symbol` against earlier buys, oldest first.
///
/// `trades` may arrive in any order; they are sorted by the matching key
/// before the scan. A sell that outruns the queue produces a single trailing
/// row with no buy.
pub fn allocate_fifo(
    symbol: &str,
    trades: &[Trade],
    ctx: &AllocationContext<'_>,
) -> Result<SymbolAllocation, LedgerError> {
    let mut ordered = Vec::with_capacity(trades.len());
    for trade in trades {
        if trade.symbol != symbol {
            return Err(LedgerError::InvalidTrade {
                trade_id: trade.trade_id.clone(),
                reason: format!("symbol {} does not belong to {}", trade.symbol, symbol),
            });
        }
        trade.validate()?;
        ordered.push(trade.clone());
    }
    sort_for_matching(&mut ordered);

    let mut queue: VecDeque<Lot<'_>> = VecDeque::new();
    let mut rows = Vec::new();
    let mut buys = 0usize;
    let mut sells = 0usize;

    for trade in &ordered {
        match trade.side {
            Side::Buy => {
                buys += 1;
                queue.push_back(Lot {
                    trade,
                    remaining: trade.size,
                });
            }
            Side::Sell => {
                sells += 1;
                let mut remaining = trade.size;

                while remaining > ctx.epsilon {
                    let Some(lot) = queue.front_mut() else {
                        break;
                    };
                    let take = lot.remaining.min(remaining);
                    rows.push(matched_row(trade, lot.trade, take, ctx));
                    lot.remaining -= take;
                    remaining -= take;
                    if lot.remaining <= ctx.epsilon {
                        queue.pop_front();
                    }
                }

                if remaining > ctx.epsilon {
                    rows.push(unmatched_row(trade, remaining, ctx));
                }
            }
        }
    }

    Ok(SymbolAllocation {
        symbol: symbol.to_string(),
        rows,
        buys,
        sells,
    })
}

fn matched_row(sell: &Trade, buy: &Trade, size: f64, ctx: &AllocationContext<'_>) -> Allocation {
    let buy_fee = size * buy.fee_per_unit();
    let sell_fee = size * sell.fee_per_unit();
    let cost_basis = size * buy.price + buy_fee;
    let proceeds = size * sell.price - sell_fee;

    Allocation {
        sell_trade_id: sell.trade_id.clone(),
        buy_trade_id: Some(buy.trade_id.clone()),
        symbol: sell.symbol.clone(),
        allocated_size: size,
        cost_basis: Some(cost_basis),
        proceeds,
        fees_allocated: buy_fee + sell_fee,
        profit_loss: Some(proceeds - cost_basis),
        version: ctx.version,
        batch_id: ctx.batch_id.to_string(),
        computed_at: ctx.computed_at,
    }
}

fn unmatched_row(sell: &Trade, size: f64, ctx: &AllocationContext<'_>) -> Allocation {
    let sell_fee = size * sell.fee_per_unit();

    Allocation {
        sell_trade_id: sell.trade_id.clone(),
        buy_trade_id: None,
        symbol: sell.symbol.clone(),
        allocated_size: size,
        cost_basis: None,
        proceeds: size * sell.price - sell_fee,
        fees_allocated: sell_fee,
        profit_loss: None,
        version: ctx.version,
        batch_id: ctx.batch_id.to_string(),
        computed_at: ctx.computed_at,
    }
}

/// A buy with inventory left after all allocations of a version.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenLot {
    pub trade_id: String,
    pub symbol: String,
    pub executed_at: DateTime<Utc>,
    pub size: f64,
    pub remaining: f64,
    pub price: f64,
}

/// Derive each buy's remaining size from the ledger and a version's rows.
pub fn open_lots(trades: &[Trade], allocations: &[Allocation], epsilon: f64) -> Vec<OpenLot> {
    let mut consumed: HashMap<&str, f64> = HashMap::new();
    for row in allocations {
        if let Some(buy_id) = row.buy_trade_id.as_deref() {
            *consumed.entry(buy_id).or_insert(0.0) += row.allocated_size;
        }
    }

    let mut buys: Vec<&Trade> = trades.iter().filter(|t| t.is_buy()).collect();
    buys.sort_by(|a, b| super::trade::matching_order(a, b));

    buys.into_iter()
        .filter_map(|t| {
            let used = consumed.get(t.trade_id.as_str()).copied().unwrap_or(0.0);
            let remaining = t.size - used;
            (remaining > epsilon).then(|| OpenLot {
                trade_id: t.trade_id.clone(),
                symbol: t.symbol.clone(),
                executed_at: t.executed_at,
                size: t.size,
                remaining,
                price: t.price,
            })
        })
        .collect()
}

/// Sum of allocated size per sell trade.
pub fn allocated_per_sell(allocations: &[Allocation]) -> HashMap<&str, f64> {
    let mut totals: HashMap<&str, f64> = HashMap::new();
    for row in allocations {
        *totals.entry(row.sell_trade_id.as_str()).or_insert(0.0) += row.allocated_size;
    }
    totals
}
