//! Domain error types.

/// Top-level error type for lotwarden.
///
/// Unmatched sells, stale feeds and per-symbol failures inside an allocation
/// run are *not* errors; they are recorded as data. This type covers what
/// actually stops an operation.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("invalid trade {trade_id}: {reason}")]
    InvalidTrade { trade_id: String, reason: String },

    #[error("allocations for {symbol} at version {version} already exist (use force to recompute)")]
    VersionConflict { symbol: String, version: i64 },

    #[error("unknown computation batch {batch_id}")]
    UnknownBatch { batch_id: String },

    #[error("no open position for {symbol}")]
    PositionNotFound { symbol: String },

    #[error("position for {symbol} is already open")]
    PositionExists { symbol: String },

    #[error("feed unavailable for {symbol}: {reason}")]
    Feed { symbol: String, reason: String },

    #[error("venue history error: {reason}")]
    Venue { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<&LedgerError> for std::process::ExitCode {
    fn from(err: &LedgerError) -> Self {
        let code: u8 = match err {
            LedgerError::Io(_) => 1,
            LedgerError::ConfigParse { .. }
            | LedgerError::ConfigMissing { .. }
            | LedgerError::ConfigInvalid { .. } => 2,
            LedgerError::Database { .. }
            | LedgerError::DatabaseQuery { .. }
            | LedgerError::VersionConflict { .. } => 3,
            LedgerError::InvalidTrade { .. } => 4,
            LedgerError::UnknownBatch { .. }
            | LedgerError::PositionNotFound { .. }
            | LedgerError::PositionExists { .. } => 5,
            LedgerError::Feed { .. } | LedgerError::Venue { .. } => 6,
        };
        std::process::ExitCode::from(code)
    }
}
