//! SQL obfuscation and signatures.
//!
//! The obfuscator is a pluggable dependency: it receives raw SQL text plus the
//! process-wide options (a JSON document) and returns normalized SQL and parsed
//! metadata. [`LiteralObfuscator`] is the built-in implementation used by the
//! daemon.

mod literal;

use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use crate::models::QueryMetadata;

pub use literal::{LiteralObfuscator, ObfuscatorOptions};

/// Result of a successful obfuscation.
#[derive(Debug, Clone, PartialEq)]
pub struct ObfuscatedStatement {
    pub query: String,
    pub metadata: QueryMetadata,
}

#[derive(Debug, Error, PartialEq)]
pub enum ObfuscationError {
    #[error("empty statement")]
    Empty,
    #[error("unterminated {0} at byte {1}")]
    Unterminated(&'static str, usize),
    #[error("invalid obfuscator options: {0}")]
    InvalidOptions(String),
}

pub trait Obfuscator {
    fn obfuscate(&self, sql: &str, options: &str)
    -> Result<ObfuscatedStatement, ObfuscationError>;
}

impl<T: Obfuscator + ?Sized> Obfuscator for Box<T> {
    fn obfuscate(
        &self,
        sql: &str,
        options: &str,
    ) -> Result<ObfuscatedStatement, ObfuscationError> {
        (**self).obfuscate(sql, options)
    }
}

/// Stable grouping key for normalized SQL text.
pub fn compute_sql_signature(normalized_sql: &str) -> String {
    format!("{:x}", xxh3_64(normalized_sql.as_bytes()))
}
