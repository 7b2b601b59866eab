//! Port traits: the seams between the domain and storage, feeds and venues.

pub mod allocation_port;
pub mod config_port;
pub mod feed_port;
pub mod ledger_port;
pub mod position_port;
pub mod venue_port;
