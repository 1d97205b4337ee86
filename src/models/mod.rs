//! Data model shared by every stage of the collection pipeline.

mod metric;
mod statement;

pub use metric::{Counter, MetricColumn, Metrics};
pub use statement::{
    ColumnValue, NormalizedRow, QueryMetadata, RawRow, RowError, RowIdentity, StatementRow,
};
