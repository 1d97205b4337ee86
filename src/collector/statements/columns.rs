//! Cached column list of the statistics view.
//!
//! The server version is not a reliable guide to the available columns: the
//! extension can be upgraded independently of the server. The list is
//! discovered from a zero-row query and kept until a failed query suggests it
//! went stale.

use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub struct StatColumnCache {
    columns: Option<BTreeSet<String>>,
}

impl StatColumnCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&BTreeSet<String>> {
        self.columns.as_ref()
    }

    pub fn set(&mut self, columns: impl IntoIterator<Item = String>) {
        self.columns = Some(columns.into_iter().collect());
    }

    /// Forces rediscovery on next use.
    pub fn invalidate(&mut self) {
        self.columns = None;
    }

    pub fn is_valid(&self) -> bool {
        self.columns.is_some()
    }
}
