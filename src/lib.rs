//! lotwarden: FIFO cost-basis allocation, ledger reconciliation and position
//! exit decisions.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in [`ports`],
//! concrete implementations in [`adapters`].

pub mod domain;
pub mod ports;
pub mod adapters;
pub mod cli;
