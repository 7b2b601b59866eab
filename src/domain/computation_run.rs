//! Audit record for one allocation computation.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "partial" => Ok(RunStatus::Partial),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Which symbols a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationScope {
    All,
    Symbols(Vec<String>),
}

impl AllocationScope {
    /// Build a scope from a comma-separated list; empty means all symbols.
    pub fn parse(list: &str) -> Self {
        let mut symbols: Vec<String> = list
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        symbols.sort();
        symbols.dedup();
        if symbols.is_empty() {
            AllocationScope::All
        } else {
            AllocationScope::Symbols(symbols)
        }
    }
}

impl fmt::Display for AllocationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationScope::All => f.write_str("all"),
            AllocationScope::Symbols(symbols) => f.write_str(&symbols.join(",")),
        }
    }
}

/// A symbol that could not be allocated in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFailure {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputationRun {
    pub batch_id: String,
    pub version: i64,
    pub scope: AllocationScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub buys_processed: usize,
    pub sells_processed: usize,
    pub allocations_created: usize,
    pub unmatched_sells: usize,
    pub symbols_computed: Vec<String>,
    pub symbols_skipped: Vec<String>,
    pub failures: Vec<SymbolFailure>,
    pub total_pnl: f64,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl ComputationRun {
    pub fn start(batch_id: String, version: i64, scope: AllocationScope) -> Self {
        ComputationRun {
            batch_id,
            version,
            scope,
            started_at: Utc::now(),
            finished_at: None,
            buys_processed: 0,
            sells_processed: 0,
            allocations_created: 0,
            unmatched_sells: 0,
            symbols_computed: Vec::new(),
            symbols_skipped: Vec::new(),
            failures: Vec::new(),
            total_pnl: 0.0,
            status: RunStatus::Running,
            error: None,
        }
    }

    /// Settle the status from what happened to each symbol.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.status = if self.failures.is_empty() {
            RunStatus::Completed
        } else if self.symbols_computed.is_empty() && self.symbols_skipped.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };
        if !self.failures.is_empty() {
            let detail: Vec<String> = self
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.symbol, f.reason))
                .collect();
            self.error = Some(detail.join("; "));
        }
    }

    /// Mark the whole run failed before any symbol was attempted.
    pub fn abort(&mut self, reason: String) {
        self.finished_at = Some(Utc::now());
        self.status = RunStatus::Failed;
        self.error = Some(reason);
    }

    pub fn failed_symbols(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.symbol.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> ComputationRun {
        ComputationRun::start("b".into(), 1, AllocationScope::All)
    }

    #[test]
    fn scope_parse_normalizes() {
        assert_eq!(
            AllocationScope::parse(" eth, btc,ETH ,"),
            AllocationScope::Symbols(vec!["BTC".into(), "ETH".into()])
        );
        assert_eq!(AllocationScope::parse(" , "), AllocationScope::All);
        assert_eq!(AllocationScope::parse("sol,btc").to_string(), "BTC,SOL");
    }

    #[test]
    fn finish_without_failures_completes() {
        let mut r = run();
        r.symbols_computed.push("ETH".into());
        r.finish();
        assert_eq!(r.status, RunStatus::Completed);
        assert!(r.error.is_none());
        assert!(r.finished_at.is_some());
    }

    #[test]
    fn finish_with_mixed_outcome_is_partial() {
        let mut r = run();
        r.symbols_computed.push("ETH".into());
        r.failures.push(SymbolFailure {
            symbol: "BTC".into(),
            reason: "boom".into(),
        });
        r.finish();
        assert_eq!(r.status, RunStatus::Partial);
        assert_eq!(r.error.as_deref(), Some("BTC: boom"));
        assert_eq!(r.failed_symbols(), vec!["BTC".to_string()]);
    }

    #[test]
    fn finish_with_only_failures_is_failed() {
        let mut r = run();
        r.failures.push(SymbolFailure {
            symbol: "BTC".into(),
            reason: "boom".into(),
        });
        r.finish();
        assert_eq!(r.status, RunStatus::Failed);
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Partial,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }
}
