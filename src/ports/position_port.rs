//! Position table port: one live row per open symbol.

use crate::domain::error::LedgerError;
use crate::domain::position::Position;

pub trait PositionStorePort {
    fn load_positions(&self) -> Result<Vec<Position>, LedgerError>;

    /// Insert or overwrite the row for `position.symbol`.
    fn save_position(&self, position: &Position) -> Result<(), LedgerError>;

    fn remove_position(&self, symbol: &str) -> Result<(), LedgerError>;
}
