//! Allocation runs: resolve scope and version, match each symbol from its full
//! history, commit each symbol atomically, and keep the run log.
//!
//! A symbol that fails is recorded on the run and the remaining symbols carry
//! on. The ledger is only ever read.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::allocation::{allocate_fifo, AllocationContext, DEFAULT_EPSILON};
use super::computation_run::{AllocationScope, ComputationRun, RunStatus, SymbolFailure};
use super::error::LedgerError;
use crate::ports::allocation_port::{AllocationStorePort, WriteOutcome};
use crate::ports::ledger_port::TradeLedgerPort;

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeRequest {
    pub scope: AllocationScope,
    /// `None` allocates the next unused version.
    pub version: Option<i64>,
    pub force: bool,
    /// Only recompute symbols with trades since this time. Symbols without a
    /// set at the target version are computed regardless.
    pub since: Option<DateTime<Utc>>,
}

impl ComputeRequest {
    pub fn all() -> Self {
        ComputeRequest {
            scope: AllocationScope::All,
            version: None,
            force: false,
            since: None,
        }
    }
}

struct SymbolOutcome {
    written: bool,
    buys: usize,
    sells: usize,
    rows: usize,
    unmatched: usize,
    pnl: f64,
}

pub struct AllocationEngine<'a> {
    ledger: &'a dyn TradeLedgerPort,
    store: &'a dyn AllocationStorePort,
    epsilon: f64,
}

impl<'a> AllocationEngine<'a> {
    pub fn new(ledger: &'a dyn TradeLedgerPort, store: &'a dyn AllocationStorePort) -> Self {
        AllocationEngine {
            ledger,
            store,
            epsilon: DEFAULT_EPSILON,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Run one computation. Never returns an error: every failure ends up in
    /// the returned run's status and failure list.
    pub fn compute(&self, request: &ComputeRequest) -> ComputationRun {
        let batch_id = Uuid::new_v4().to_string();

        let version = match self.resolve_version(request.version) {
            Ok(v) => v,
            Err(e) => {
                error!(batch_id = %batch_id, error = %e, "could not resolve allocation version");
                // Logged at version 0 so a bad request never moves the next
                // version forward.
                let version = request.version.filter(|v| *v >= 1).unwrap_or(0);
                let mut run = ComputationRun::start(batch_id, version, request.scope.clone());
                run.abort(e.to_string());
                self.log_run(&run);
                return run;
            }
        };

        let mut run = ComputationRun::start(batch_id, version, request.scope.clone());
        self.log_run(&run);
        info!(batch_id = %run.batch_id, version, scope = %run.scope, force = request.force, "allocation run started");

        let symbols = match self.resolve_symbols(&request.scope) {
            Ok(s) => s,
            Err(e) => {
                error!(batch_id = %run.batch_id, version, error = %e, "could not list symbols");
                run.abort(e.to_string());
                self.log_run(&run);
                return run;
            }
        };

        let changed: Option<HashSet<String>> = match request.since {
            Some(since) => match self.ledger.symbols_changed_since(since) {
                Ok(list) => Some(list.into_iter().collect()),
                Err(e) => {
                    // Without the change set, recompute everything in scope.
                    warn!(batch_id = %run.batch_id, version, error = %e, "change detection failed, recomputing full scope");
                    None
                }
            },
            None => None,
        };

        for symbol in symbols {
            let mut force = request.force;

            if let (Some(since), Some(changed)) = (request.since, changed.as_ref()) {
                if changed.contains(&symbol) {
                    force = true;
                } else {
                    match self.store.has_allocation_set(&symbol, version) {
                        Ok(true) => {
                            info!(symbol = %symbol, version, since = %since, "unchanged since cutoff, skipping");
                            run.symbols_skipped.push(symbol);
                            continue;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            self.record_failure(&mut run, symbol, e);
                            continue;
                        }
                    }
                }
            } else if request.since.is_some() {
                force = true;
            }

            match self.compute_symbol(&symbol, version, &run.batch_id, run.started_at, force) {
                Ok(outcome) if outcome.written => {
                    run.buys_processed += outcome.buys;
                    run.sells_processed += outcome.sells;
                    run.allocations_created += outcome.rows;
                    run.unmatched_sells += outcome.unmatched;
                    run.total_pnl += outcome.pnl;
                    if outcome.unmatched > 0 {
                        warn!(symbol = %symbol, version, batch_id = %run.batch_id, unmatched = outcome.unmatched, "symbol has unmatched sells");
                    }
                    run.symbols_computed.push(symbol);
                }
                Ok(_) => {
                    info!(symbol = %symbol, version, "allocation set already present, skipping");
                    run.symbols_skipped.push(symbol);
                }
                Err(e) => self.record_failure(&mut run, symbol, e),
            }
        }

        run.finish();
        self.log_run(&run);
        info!(
            batch_id = %run.batch_id,
            version,
            status = %run.status,
            computed = run.symbols_computed.len(),
            skipped = run.symbols_skipped.len(),
            failed = run.failures.len(),
            allocations = run.allocations_created,
            total_pnl = run.total_pnl,
            "allocation run finished"
        );
        run
    }

    /// Recompute only the symbols that failed in `batch_id`, at its version.
    ///
    /// A run that failed before reaching any symbol is recomputed over its
    /// whole scope. If it never resolved a version, the retry takes the next
    /// unused one.
    pub fn retry_failed(&self, batch_id: &str) -> Result<ComputationRun, LedgerError> {
        let previous = self
            .store
            .get_run(batch_id)?
            .ok_or_else(|| LedgerError::UnknownBatch {
                batch_id: batch_id.to_string(),
            })?;

        let failed = previous.failed_symbols();
        if failed.is_empty() && previous.status == RunStatus::Failed {
            info!(batch_id, version = previous.version, scope = %previous.scope, "run aborted before any symbol, recomputing its scope");
            return Ok(self.compute(&ComputeRequest {
                scope: previous.scope,
                version: (previous.version >= 1).then_some(previous.version),
                force: true,
                since: None,
            }));
        }
        if failed.is_empty() {
            info!(batch_id, "run has no failed symbols, nothing to retry");
            return Ok(previous);
        }

        Ok(self.compute(&ComputeRequest {
            scope: AllocationScope::Symbols(failed),
            version: Some(previous.version),
            force: true,
            since: None,
        }))
    }

    fn resolve_version(&self, requested: Option<i64>) -> Result<i64, LedgerError> {
        match requested {
            Some(v) if v >= 1 => Ok(v),
            Some(v) => Err(LedgerError::ConfigInvalid {
                section: "allocation".into(),
                key: "version".into(),
                reason: format!("version must be at least 1, got {v}"),
            }),
            None => Ok(self.store.latest_version()?.map_or(1, |v| v + 1)),
        }
    }

    fn resolve_symbols(&self, scope: &AllocationScope) -> Result<Vec<String>, LedgerError> {
        match scope {
            AllocationScope::All => self.ledger.list_symbols(),
            AllocationScope::Symbols(symbols) => Ok(symbols.clone()),
        }
    }

    fn compute_symbol(
        &self,
        symbol: &str,
        version: i64,
        batch_id: &str,
        computed_at: DateTime<Utc>,
        force: bool,
    ) -> Result<SymbolOutcome, LedgerError> {
        if !force && self.store.has_allocation_set(symbol, version)? {
            return Ok(SymbolOutcome {
                written: false,
                buys: 0,
                sells: 0,
                rows: 0,
                unmatched: 0,
                pnl: 0.0,
            });
        }

        let trades = self.ledger.list_trades(Some(symbol))?;
        let ctx = AllocationContext {
            version,
            batch_id,
            computed_at,
            epsilon: self.epsilon,
        };
        let result = allocate_fifo(symbol, &trades, &ctx)?;

        let outcome = self
            .store
            .write_symbol_allocations(symbol, version, batch_id, &result.rows, force)?;

        Ok(SymbolOutcome {
            written: outcome == WriteOutcome::Written,
            buys: result.buys,
            sells: result.sells,
            rows: result.rows.len(),
            unmatched: result.unmatched_rows().count(),
            pnl: result.total_pnl(),
        })
    }

    fn record_failure(&self, run: &mut ComputationRun, symbol: String, err: LedgerError) {
        error!(
            symbol = %symbol,
            version = run.version,
            batch_id = %run.batch_id,
            at = %Utc::now(),
            error = %err,
            "symbol allocation failed"
        );
        run.failures.push(SymbolFailure {
            symbol,
            reason: err.to_string(),
        });
    }

    fn log_run(&self, run: &ComputationRun) {
        if let Err(e) = self.store.record_run(run) {
            error!(batch_id = %run.batch_id, version = run.version, error = %e, "failed to record computation run");
        }
    }
}
