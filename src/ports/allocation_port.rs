//! Allocation store port: versioned allocation rows and the run log.

use crate::domain::allocation::Allocation;
use crate::domain::computation_run::ComputationRun;
use crate::domain::error::LedgerError;

/// What happened to a symbol's allocation set on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Rows committed (replacing an earlier set when forced).
    Written,
    /// A set already exists for this `(symbol, version)` and force was off.
    AlreadyPresent,
}

pub trait AllocationStorePort {
    fn latest_version(&self) -> Result<Option<i64>, LedgerError>;

    fn list_versions(&self) -> Result<Vec<i64>, LedgerError>;

    /// Whether `(symbol, version)` has a committed allocation set, even an
    /// empty one.
    fn has_allocation_set(&self, symbol: &str, version: i64) -> Result<bool, LedgerError>;

    /// Commit all rows of one symbol at one version atomically. Readers see
    /// either the previous set or the complete new one.
    fn write_symbol_allocations(
        &self,
        symbol: &str,
        version: i64,
        batch_id: &str,
        rows: &[Allocation],
        force: bool,
    ) -> Result<WriteOutcome, LedgerError>;

    fn list_allocations(
        &self,
        version: i64,
        symbol: Option<&str>,
    ) -> Result<Vec<Allocation>, LedgerError>;

    /// Insert or update the run keyed by its `batch_id`.
    fn record_run(&self, run: &ComputationRun) -> Result<(), LedgerError>;

    fn get_run(&self, batch_id: &str) -> Result<Option<ComputationRun>, LedgerError>;
}
