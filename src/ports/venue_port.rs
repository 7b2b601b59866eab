//! Authoritative venue history port, consumed only by reconciliation.

use chrono::{DateTime, Utc};

use crate::domain::error::LedgerError;
use crate::domain::reconciliation::VenueFill;

pub trait VenueHistoryPort {
    /// Fills for `symbol` executed at or after `since`, oldest first.
    fn list_fills(
        &self,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<VenueFill>, LedgerError>;
}
