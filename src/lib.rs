//! pgqm - PostgreSQL query metrics collection library.
//!
//! Turns the cumulative counters of `pg_stat_statements` into per-interval
//! query metrics:
//! - `collector` - statistics sources and the periodic collection job
//! - `deltas` - per-query counter baselines and deltas
//! - `obfuscate` - SQL literal stripping and query signatures
//! - `sampler` - rate limiting of full query text events
//! - `payload` / `sink` - outbound payload shapes and transports
//!
//! The `pgqmd` daemon drives one job against one database.

pub mod collector;
pub mod config;
pub mod deltas;
pub mod diagnostics;
pub mod models;
pub mod obfuscate;
pub mod payload;
pub mod sampler;
pub mod sink;
pub mod util;
