//! Obfuscation and fingerprinting of raw statistics rows.

use tracing::debug;

use crate::models::{NormalizedRow, RawRow, StatementRow};
use crate::obfuscate::{Obfuscator, compute_sql_signature};

/// Obfuscates every row, skipping rows that cannot be obfuscated.
///
/// Obfuscation failures are routine (truncated or vendor-specific SQL), so
/// they are only logged at debug level.
pub fn normalize_queries<O>(rows: &[RawRow], obfuscator: &O, options: &str) -> Vec<NormalizedRow>
where
    O: Obfuscator + ?Sized,
{
    let mut normalized = Vec::with_capacity(rows.len());
    for raw in rows {
        let row = match StatementRow::from_raw(raw) {
            Ok(row) => row,
            Err(e) => {
                debug!(error = %e, "skipping statistics row");
                continue;
            }
        };

        let statement = match obfuscator.obfuscate(&row.query, options) {
            Ok(statement) => statement,
            Err(e) => {
                debug!(query = %row.query, error = %e, "failed to obfuscate query");
                continue;
            }
        };

        normalized.push(NormalizedRow {
            query_signature: compute_sql_signature(&statement.query),
            row: StatementRow {
                query: statement.query,
                ..row
            },
            metadata: statement.metadata,
        });
    }
    normalized
}
