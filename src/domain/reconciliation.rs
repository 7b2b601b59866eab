//! Reconciliation of unmatched sells against the venue's own fill history,
//! and insert-only backfill of fills the ledger is missing.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use super::error::LedgerError;
use super::trade::{matching_order, Side, Trade};
use crate::ports::allocation_port::AllocationStorePort;
use crate::ports::ledger_port::TradeLedgerPort;
use crate::ports::venue_port::VenueHistoryPort;

/// A fill as the venue reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueFill {
    pub fill_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub fee: f64,
    pub executed_at: DateTime<Utc>,
}

impl VenueFill {
    /// Ledger row for this fill. The venue id becomes the trade id.
    pub fn to_trade(&self) -> Trade {
        Trade {
            trade_id: self.fill_id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            size: self.size,
            price: self.price,
            fee: self.fee,
            executed_at: self.executed_at,
        }
    }

    /// Same side, size and price within `epsilon`, executed within
    /// `tolerance` of `trade`.
    pub fn fingerprint_matches(&self, trade: &Trade, tolerance: Duration, epsilon: f64) -> bool {
        let gap = (self.executed_at - trade.executed_at).abs();
        self.symbol == trade.symbol
            && self.side == trade.side
            && gap <= tolerance
            && (self.size - trade.size).abs() <= epsilon
            && (self.price - trade.price).abs() <= epsilon * self.price.max(1.0)
    }
}

/// Why a sell is unmatched, from most to least suspicious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// The ledger holds no buys for the symbol at all.
    NoBuysInLedger,
    /// Inventory was already negative before the sell.
    NegativeInventoryAtSellTime,
    /// Inventory was non-negative but smaller than the sell.
    InsufficientInventory,
    /// Inventory covered the sell; the gap is an ordering artifact.
    LikelyLegitimate,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::NoBuysInLedger => "NO_BUYS_IN_LEDGER",
            Tier::NegativeInventoryAtSellTime => "NEGATIVE_INVENTORY_AT_SELL_TIME",
            Tier::InsufficientInventory => "INSUFFICIENT_INVENTORY",
            Tier::LikelyLegitimate => "LIKELY_LEGITIMATE",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace('-', "_").as_str() {
            "NO_BUYS_IN_LEDGER" => Ok(Tier::NoBuysInLedger),
            "NEGATIVE_INVENTORY_AT_SELL_TIME" => Ok(Tier::NegativeInventoryAtSellTime),
            "INSUFFICIENT_INVENTORY" => Ok(Tier::InsufficientInventory),
            "LIKELY_LEGITIMATE" => Ok(Tier::LikelyLegitimate),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub version: i64,
    pub symbol: String,
    pub sell_trade_id: String,
    pub sell_executed_at: DateTime<Utc>,
    pub sell_size: f64,
    pub unmatched_size: f64,
    pub tier: Tier,
    /// Ledger inventory just before the sell.
    pub inventory_at_sell: f64,
    /// Venue buys at or before the sell whose ids the ledger does not have.
    pub missing_fills: Vec<VenueFill>,
    /// A missing buy of the sell's exact size shortly before it.
    pub round_trip_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    pub round_trip_window_secs: i64,
    pub fingerprint_tolerance_secs: i64,
    pub epsilon: f64,
}

/// Upper bound on either reconciliation window, one week.
pub const MAX_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;

impl ReconcileConfig {
    pub fn round_trip_window(&self) -> Result<Duration, LedgerError> {
        window("round_trip_window_secs", self.round_trip_window_secs)
    }

    pub fn fingerprint_tolerance(&self) -> Result<Duration, LedgerError> {
        window("fingerprint_tolerance_secs", self.fingerprint_tolerance_secs)
    }
}

fn window(key: &str, secs: i64) -> Result<Duration, LedgerError> {
    if !(0..=MAX_WINDOW_SECS).contains(&secs) {
        return Err(LedgerError::ConfigInvalid {
            section: "reconciliation".to_string(),
            key: key.to_string(),
            reason: format!("{key} must be between 0 and {MAX_WINDOW_SECS}, got {secs}"),
        });
    }
    Ok(Duration::seconds(secs))
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            round_trip_window_secs: 3600,
            fingerprint_tolerance_secs: 1,
            epsilon: super::allocation::DEFAULT_EPSILON,
        }
    }
}

/// Ledger inventory immediately before `sell`: every buy executed at or
/// before it, minus every sell ahead of it in matching order.
pub fn inventory_before(trades: &[Trade], sell: &Trade) -> f64 {
    trades
        .iter()
        .filter(|t| t.symbol == sell.symbol)
        .map(|t| match t.side {
            Side::Buy if t.executed_at <= sell.executed_at => t.size,
            Side::Sell if matching_order(t, sell) == Ordering::Less => -t.size,
            _ => 0.0,
        })
        .sum()
}

pub fn classify(trades: &[Trade], sell: &Trade, epsilon: f64) -> (Tier, f64) {
    let inventory = inventory_before(trades, sell);
    let any_buys = trades
        .iter()
        .any(|t| t.symbol == sell.symbol && t.is_buy());

    let tier = if !any_buys {
        Tier::NoBuysInLedger
    } else if inventory < -epsilon {
        Tier::NegativeInventoryAtSellTime
    } else if inventory + epsilon < sell.size {
        Tier::InsufficientInventory
    } else {
        Tier::LikelyLegitimate
    };
    (tier, inventory)
}

/// Latest missing buy of the sell's size inside the window before it.
pub fn round_trip_hint(
    missing: &[VenueFill],
    sell: &Trade,
    window: Duration,
    epsilon: f64,
) -> Option<String> {
    missing
        .iter()
        .filter(|f| f.side == Side::Buy)
        .filter(|f| (f.size - sell.size).abs() <= epsilon)
        .filter(|f| {
            let lead = sell.executed_at - f.executed_at;
            lead >= Duration::zero() && lead <= window
        })
        .max_by(|a, b| {
            a.executed_at
                .cmp(&b.executed_at)
                .then_with(|| a.fill_id.cmp(&b.fill_id))
        })
        .map(|f| f.fill_id.clone())
}

/// A venue fill backfill refused because the ledger plausibly already has it
/// under another id.
#[derive(Debug, Clone, PartialEq)]
pub struct AmbiguousFill {
    pub fill: VenueFill,
    pub conflicting_trade_id: String,
}

/// A venue fill that cannot become a ledger trade, such as one with zero size.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedFill {
    pub fill: VenueFill,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillReport {
    pub inserted: usize,
    pub already_present: usize,
    pub ambiguous: Vec<AmbiguousFill>,
    pub rejected: Vec<RejectedFill>,
}

pub struct Reconciler<'a> {
    pub ledger: &'a dyn TradeLedgerPort,
    pub store: &'a dyn AllocationStorePort,
    pub venue: &'a dyn VenueHistoryPort,
    pub config: ReconcileConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        ledger: &'a dyn TradeLedgerPort,
        store: &'a dyn AllocationStorePort,
        venue: &'a dyn VenueHistoryPort,
        config: ReconcileConfig,
    ) -> Self {
        Reconciler {
            ledger,
            store,
            venue,
            config,
        }
    }

    /// Classify every unmatched sell of `version`, optionally keeping one
    /// tier only. Venue failures degrade to discrepancies without candidates.
    pub fn reconcile(
        &self,
        version: i64,
        tier: Option<Tier>,
    ) -> Result<Vec<Discrepancy>, LedgerError> {
        let rows = self.store.list_allocations(version, None)?;

        let mut unmatched: BTreeMap<&str, BTreeMap<&str, f64>> = BTreeMap::new();
        for row in rows.iter().filter(|r| r.is_unmatched()) {
            *unmatched
                .entry(row.symbol.as_str())
                .or_default()
                .entry(row.sell_trade_id.as_str())
                .or_insert(0.0) += row.allocated_size;
        }

        let window = self.config.round_trip_window()?;
        let mut discrepancies = Vec::new();

        for (symbol, sells) in unmatched {
            let trades = self.ledger.list_trades(Some(symbol))?;
            let missing = self.missing_buys(symbol, version, &trades);

            for (sell_id, unmatched_size) in sells {
                let Some(sell) = trades.iter().find(|t| t.trade_id == sell_id) else {
                    warn!(symbol, version, trade_id = sell_id, "unmatched sell no longer in ledger");
                    continue;
                };

                let (sell_tier, inventory) = classify(&trades, sell, self.config.epsilon);
                if tier.is_some_and(|wanted| wanted != sell_tier) {
                    continue;
                }

                let candidates: Vec<VenueFill> = missing
                    .iter()
                    .filter(|f| f.executed_at <= sell.executed_at)
                    .cloned()
                    .collect();
                let hint = round_trip_hint(&candidates, sell, window, self.config.epsilon);

                discrepancies.push(Discrepancy {
                    version,
                    symbol: symbol.to_string(),
                    sell_trade_id: sell.trade_id.clone(),
                    sell_executed_at: sell.executed_at,
                    sell_size: sell.size,
                    unmatched_size,
                    tier: sell_tier,
                    inventory_at_sell: inventory,
                    missing_fills: candidates,
                    round_trip_hint: hint,
                });
            }
        }

        info!(
            version,
            discrepancies = discrepancies.len(),
            tier = tier.map(|t| t.as_str()).unwrap_or("all"),
            "reconciliation finished"
        );
        Ok(discrepancies)
    }

    fn missing_buys(&self, symbol: &str, version: i64, trades: &[Trade]) -> Vec<VenueFill> {
        let known: HashSet<&str> = trades.iter().map(|t| t.trade_id.as_str()).collect();
        match self.venue.list_fills(symbol, None) {
            Ok(fills) => fills
                .into_iter()
                .filter(|f| f.side == Side::Buy && !known.contains(f.fill_id.as_str()))
                .collect(),
            Err(e) => {
                warn!(symbol, version, error = %e, "venue history unavailable, classifying without candidates");
                Vec::new()
            }
        }
    }

    /// Insert the candidate fills of `discrepancies` that the ledger verifiably
    /// lacks. Existing rows are never touched; a fingerprint collision with an
    /// existing trade is reported and skipped.
    pub fn backfill(&self, discrepancies: &[Discrepancy]) -> Result<BackfillReport, LedgerError> {
        let mut by_symbol: BTreeMap<&str, BTreeMap<&str, &VenueFill>> = BTreeMap::new();
        for d in discrepancies {
            for fill in &d.missing_fills {
                by_symbol
                    .entry(fill.symbol.as_str())
                    .or_default()
                    .insert(fill.fill_id.as_str(), fill);
            }
        }

        let tolerance = self.config.fingerprint_tolerance()?;
        let mut report = BackfillReport::default();
        let mut to_insert = Vec::new();

        for (symbol, fills) in by_symbol {
            let existing = self.ledger.list_trades(Some(symbol))?;
            for fill in fills.into_values() {
                let trade = fill.to_trade();
                if let Err(e) = trade.validate() {
                    warn!(symbol, fill_id = %fill.fill_id, error = %e, "venue fill is not a valid trade, skipping");
                    report.rejected.push(RejectedFill {
                        fill: fill.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
                if existing.iter().any(|t| t.trade_id == fill.fill_id) {
                    report.already_present += 1;
                    continue;
                }
                if let Some(conflict) = existing
                    .iter()
                    .find(|t| fill.fingerprint_matches(t, tolerance, self.config.epsilon))
                {
                    warn!(
                        symbol,
                        fill_id = %fill.fill_id,
                        trade_id = %conflict.trade_id,
                        "fill fingerprint collides with existing trade, not inserting"
                    );
                    report.ambiguous.push(AmbiguousFill {
                        fill: fill.clone(),
                        conflicting_trade_id: conflict.trade_id.clone(),
                    });
                    continue;
                }
                to_insert.push(trade);
            }
        }

        if !to_insert.is_empty() {
            let inserted = self.ledger.insert_trades(&to_insert)?;
            report.already_present += to_insert.len() - inserted;
            report.inserted = inserted;
        }

        info!(
            inserted = report.inserted,
            already_present = report.already_present,
            ambiguous = report.ambiguous.len(),
            rejected = report.rejected.len(),
            "backfill finished; allocate a new version to pick up inserted trades"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_710_000_000 + secs, 0).unwrap()
    }

    fn trade(id: &str, side: Side, size: f64, secs: i64) -> Trade {
        Trade {
            trade_id: id.into(),
            symbol: "ARB".into(),
            side,
            size,
            price: 1.0,
            fee: 0.0,
            executed_at: ts(secs),
        }
    }

    fn fill(id: &str, size: f64, secs: i64) -> VenueFill {
        VenueFill {
            fill_id: id.into(),
            symbol: "ARB".into(),
            side: Side::Buy,
            size,
            price: 1.0,
            fee: 0.0,
            executed_at: ts(secs),
        }
    }

    #[test]
    fn classify_no_buys() {
        let trades = vec![trade("s1", Side::Sell, 5.0, 0)];
        let (tier, inv) = classify(&trades, &trades[0], 1e-9);
        assert_eq!(tier, Tier::NoBuysInLedger);
        assert_eq!(inv, 0.0);
    }

    #[test]
    fn classify_insufficient_then_negative() {
        let trades = vec![
            trade("b1", Side::Buy, 5.0, 0),
            trade("s1", Side::Sell, 10.0, 1),
            trade("s2", Side::Sell, 3.0, 2),
        ];
        let (first, inv1) = classify(&trades, &trades[1], 1e-9);
        assert_eq!(first, Tier::InsufficientInventory);
        assert!((inv1 - 5.0).abs() < 1e-12);

        let (second, inv2) = classify(&trades, &trades[2], 1e-9);
        assert_eq!(second, Tier::NegativeInventoryAtSellTime);
        assert!((inv2 + 5.0).abs() < 1e-12);
    }

    #[test]
    fn classify_same_timestamp_buy_is_likely_legitimate() {
        // Matching puts "s-a" before "z-buy"; the inventory view counts the buy.
        let trades = vec![
            trade("z-buy", Side::Buy, 2.0, 0),
            trade("s-a", Side::Sell, 2.0, 0),
        ];
        let (tier, _) = classify(&trades, &trades[1], 1e-9);
        assert_eq!(tier, Tier::LikelyLegitimate);
    }

    #[test]
    fn round_trip_hint_picks_same_size_inside_window() {
        let sell = trade("s1", Side::Sell, 7.0, 1000);
        let missing = vec![
            fill("f-old", 7.0, -5000),
            fill("f-size", 6.0, 900),
            fill("f-hit", 7.0, 400),
            fill("f-after", 7.0, 1200),
        ];
        let hint = round_trip_hint(&missing, &sell, Duration::seconds(3600), 1e-9);
        assert_eq!(hint.as_deref(), Some("f-hit"));
    }

    #[test]
    fn round_trip_hint_none_outside_window() {
        let sell = trade("s1", Side::Sell, 7.0, 10_000);
        let missing = vec![fill("f1", 7.0, 0)];
        assert!(round_trip_hint(&missing, &sell, Duration::seconds(60), 1e-9).is_none());
    }

    #[test]
    fn fingerprint_matches_within_tolerance() {
        let existing = trade("t-1", Side::Buy, 7.0, 100);
        assert!(fill("f-1", 7.0, 101).fingerprint_matches(&existing, Duration::seconds(1), 1e-9));
        assert!(!fill("f-1", 7.0, 103).fingerprint_matches(&existing, Duration::seconds(1), 1e-9));
        assert!(!fill("f-1", 7.5, 100).fingerprint_matches(&existing, Duration::seconds(1), 1e-9));
    }

    #[test]
    fn tier_parses_loosely() {
        assert_eq!("no-buys-in-ledger".parse::<Tier>().unwrap(), Tier::NoBuysInLedger);
        assert_eq!(
            "likely_legitimate".parse::<Tier>().unwrap(),
            Tier::LikelyLegitimate
        );
        assert!("bogus".parse::<Tier>().is_err());
    }

    #[test]
    fn to_trade_keeps_venue_id() {
        let t = fill("venue-77", 3.0, 0).to_trade();
        assert_eq!(t.trade_id, "venue-77");
        assert_eq!(t.side, Side::Buy);
    }
}
