//! Core domain types and logic.

pub mod trade;
pub mod allocation;
pub mod computation_run;
pub mod allocation_engine;
pub mod reconciliation;
pub mod diagnostics;
pub mod position;
pub mod position_book;
pub mod exit_rules;
pub mod monitor;
pub mod config_validation;
pub mod error;
