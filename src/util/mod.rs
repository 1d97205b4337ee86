//! Utility modules for pgqm.

mod ttl_cache;

pub use ttl_cache::TtlCache;
