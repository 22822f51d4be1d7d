//! Core domain for covey: the shared types, configuration, and the durable
//! SQLite ledger that backs membership, task dedup, cooperative group tasks,
//! and span storage.

pub mod config;
pub mod ledger;
pub mod trace_graph;
pub mod types;
