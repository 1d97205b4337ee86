//! Statistics sources and the statement metrics job.
//!
//! [`StatementsSource`] abstracts query execution so the job runs against a
//! live server ([`PgSource`]) or a scripted one ([`mock::MockSource`]).

pub mod mock;
mod pg_source;
mod source;
pub mod statements;

pub use pg_source::{PgSource, parse_server_version_num};
pub use source::{QueryError, QueryErrorKind, QueryResult, StatementsSource};
pub use statements::{CollectError, CycleOutcome, StatementMetricsJob};
