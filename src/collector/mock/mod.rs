//! Scripted statistics source for testing.
//!
//! This module provides `MockSource` and row builders for testing the
//! collection job without a running PostgreSQL server.

mod scenarios;
mod source;

pub use scenarios::{DEFAULT_VIEW_COLUMNS, statement};
pub use source::MockSource;
