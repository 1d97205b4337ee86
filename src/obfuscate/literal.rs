//! Literal-stripping obfuscator.
//!
//! Replaces string, dollar-quoted and numeric literals with `?`, drops
//! comments, collapses whitespace and `?` lists, and extracts referenced
//! tables and statement commands. Quoted identifiers and `$n` parameters
//! are kept.

use serde::Deserialize;

use super::{ObfuscatedStatement, ObfuscationError, Obfuscator};
use crate::models::QueryMetadata;

/// Options accepted in the obfuscator options JSON document.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObfuscatorOptions {
    /// Also replace digits embedded in identifiers (`orders_2024` → `orders_?`).
    pub replace_digits: bool,
    pub collect_tables: bool,
    pub collect_commands: bool,
}

impl Default for ObfuscatorOptions {
    fn default() -> Self {
        Self {
            replace_digits: false,
            collect_tables: true,
            collect_commands: true,
        }
    }
}

impl ObfuscatorOptions {
    fn parse(options: &str) -> Result<Self, ObfuscationError> {
        if options.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(options).map_err(|e| ObfuscationError::InvalidOptions(e.to_string()))
    }
}

const COMMANDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "MERGE", "CREATE", "ALTER", "DROP", "TRUNCATE",
    "GRANT", "REVOKE", "BEGIN", "COMMIT", "ROLLBACK", "COPY", "VACUUM", "ANALYZE", "EXPLAIN",
];

/// Keywords after which the next token names a table.
const TABLE_PREFIXES: &[&str] = &["FROM", "JOIN", "INTO", "UPDATE", "TABLE"];

/// Tokens that may sit between a table prefix and the table name.
const TABLE_SKIP: &[&str] = &["ONLY", "IF", "NOT", "EXISTS", "LATERAL"];

#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralObfuscator;

impl LiteralObfuscator {
    pub fn new() -> Self {
        Self
    }
}

impl Obfuscator for LiteralObfuscator {
    fn obfuscate(
        &self,
        sql: &str,
        options: &str,
    ) -> Result<ObfuscatedStatement, ObfuscationError> {
        let options = ObfuscatorOptions::parse(options)?;
        let query = strip_literals(sql, options.replace_digits)?;
        if query.is_empty() {
            return Err(ObfuscationError::Empty);
        }

        let mut metadata = QueryMetadata::default();
        if options.collect_tables {
            metadata.tables_csv = collect_tables(&query).join(",");
        }
        if options.collect_commands {
            metadata.commands = collect_commands(&query);
        }

        Ok(ObfuscatedStatement { query, metadata })
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn strip_literals(sql: &str, replace_digits: bool) -> Result<String, ObfuscationError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    // Pushes a single space unless the output already ends with one.
    fn space(out: &mut String) {
        if !out.is_empty() && !out.ends_with(' ') {
            out.push(' ');
        }
    }

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match c {
            '\'' => {
                // E'...' escape strings: drop the prefix. Backslash escapes
                // only apply there; standard strings take `\` literally.
                let mut escapes = false;
                if out.ends_with(['E', 'e']) {
                    let before = out[..out.len() - 1].chars().last();
                    if !before.is_some_and(is_ident_char) {
                        out.pop();
                        escapes = true;
                    }
                }
                i = skip_quoted(&chars, i, '\'', escapes)
                    .ok_or(ObfuscationError::Unterminated("string literal", i))?;
                out.push('?');
            }
            '"' => {
                let end = skip_quoted(&chars, i, '"', false)
                    .ok_or(ObfuscationError::Unterminated("quoted identifier", i))?;
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                space(&mut out);
            }
            '/' if next == Some('*') => {
                let start = i;
                i += 2;
                loop {
                    if i + 1 >= chars.len() {
                        return Err(ObfuscationError::Unterminated("comment", start));
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
                space(&mut out);
            }
            '$' if out.chars().last().is_none_or(|p| !is_ident_char(p)) => {
                if next.is_some_and(|n| n.is_ascii_digit()) {
                    // Positional parameter.
                    out.push('$');
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        out.push(chars[i]);
                        i += 1;
                    }
                } else if let Some(end) = skip_dollar_quoted(&chars, i)? {
                    out.push('?');
                    i = end;
                } else {
                    out.push('$');
                    i += 1;
                }
            }
            c if c.is_ascii_digit() => {
                let prev_ident = out.chars().last().is_some_and(is_ident_char);
                if prev_ident {
                    out.push(if replace_digits { '?' } else { c });
                    i += 1;
                    while replace_digits && i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                } else {
                    i = skip_number(&chars, i);
                    out.push('?');
                }
            }
            c if c.is_whitespace() => {
                space(&mut out);
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    let mut query = out.trim().to_string();
    while query.contains("?, ?") {
        query = query.replace("?, ?", "?");
    }
    while query.contains("?,?") {
        query = query.replace("?,?", "?");
    }
    Ok(query)
}

/// Returns the index just past the closing quote. Doubled quotes are escapes,
/// and so are backslashes when `backslash_escapes` is set.
fn skip_quoted(
    chars: &[char],
    start: usize,
    quote: char,
    backslash_escapes: bool,
) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        if backslash_escapes && chars[i] == '\\' {
            i += 2;
            continue;
        }
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

/// Skips `$tag$ ... $tag$`. Returns `Ok(None)` when `$` does not open a tag.
fn skip_dollar_quoted(chars: &[char], start: usize) -> Result<Option<usize>, ObfuscationError> {
    let mut i = start + 1;
    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
        i += 1;
    }
    if chars.get(i) != Some(&'$') {
        return Ok(None);
    }
    let tag = &chars[start..=i];
    let mut j = i + 1;
    while j + tag.len() <= chars.len() {
        if &chars[j..j + tag.len()] == tag {
            return Ok(Some(j + tag.len()));
        }
        j += 1;
    }
    Err(ObfuscationError::Unterminated("dollar-quoted string", start))
}

fn skip_number(chars: &[char], start: usize) -> usize {
    let mut i = start;
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    if i < chars.len() && matches!(chars[i], 'e' | 'E') {
        let mut j = i + 1;
        if j < chars.len() && matches!(chars[j], '+' | '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    i
}

fn tokens(query: &str) -> impl Iterator<Item = &str> {
    query
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '(' | ')' | ';'))
        .filter(|t| !t.is_empty())
}

fn collect_commands(query: &str) -> Vec<String> {
    let mut commands: Vec<String> = Vec::new();
    for token in tokens(query) {
        let upper = token.to_ascii_uppercase();
        if COMMANDS.contains(&upper.as_str()) && !commands.contains(&upper) {
            commands.push(upper);
        }
    }
    commands
}

fn collect_tables(query: &str) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    let mut expect_table = false;

    for token in tokens(query) {
        let upper = token.to_ascii_uppercase();
        if expect_table {
            if TABLE_SKIP.contains(&upper.as_str()) {
                continue;
            }
            expect_table = false;
            let is_name = !token.starts_with(['?', '$'])
                && !COMMANDS.contains(&upper.as_str())
                && !TABLE_PREFIXES.contains(&upper.as_str());
            if is_name && !tables.iter().any(|t| t == token) {
                tables.push(token.to_string());
            }
            continue;
        }
        // `DELETE FROM` / `INSERT INTO` are handled by FROM / INTO.
        expect_table = TABLE_PREFIXES.contains(&upper.as_str());
    }
    tables
}
