//! SQL dialect portability.
//!
//! The canonical dialect for hand-written SQL in this crate is SQLite
//! (the native backend). When the configured backend is Postgres (the
//! secondary dialect), queries are rewritten on the way in so the same
//! SQL text runs against either driver. See [`to_secondary_dialect`].

use thiserror::Error;

/// Errors raised while rewriting a query for the secondary dialect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RewriteError {
    /// The query contains a JSON containment/existence operator (`?|` or
    /// `?&`) outside a quoted context. Rewriting `?` to a numbered
    /// placeholder would silently corrupt these Postgres operators, so we
    /// refuse instead.
    #[error("query contains a `{0}` operator outside a string literal; cannot safely rewrite placeholders")]
    AmbiguousJsonOperator(&'static str),
}

/// Lexical state of the SQL scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
}

/// Rewrite positional `?` placeholders into Postgres-style numbered
/// placeholders (`$1`, `$2`, ...).
///
/// Tracks five lexical states (normal, single-quoted string, double-quoted
/// identifier, line comment, block comment) and only rewrites `?` seen in
/// the normal state. A bare `?` followed by `|` or `&` in the normal state
/// is almost certainly a mistyped Postgres JSON operator applied to text
/// written for the native dialect; rather than corrupt it, we error.
pub fn rewrite_placeholders(sql: &str) -> Result<String, RewriteError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len() + 8);
    let mut state = LexState::Normal;
    let mut param_index: u32 = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match state {
            LexState::Normal => match c {
                '\'' => {
                    state = LexState::SingleQuoted;
                    out.push(c);
                    i += 1;
                }
                '"' => {
                    state = LexState::DoubleQuoted;
                    out.push(c);
                    i += 1;
                }
                '-' if chars.get(i + 1) == Some(&'-') => {
                    state = LexState::LineComment;
                    out.push_str("--");
                    i += 2;
                }
                '/' if chars.get(i + 1) == Some(&'*') => {
                    state = LexState::BlockComment;
                    out.push_str("/*");
                    i += 2;
                }
                '?' => {
                    match chars.get(i + 1) {
                        Some('|') => return Err(RewriteError::AmbiguousJsonOperator("?|")),
                        Some('&') => return Err(RewriteError::AmbiguousJsonOperator("?&")),
                        _ => {}
                    }
                    param_index += 1;
                    out.push('$');
                    out.push_str(&param_index.to_string());
                    i += 1;
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            },
            LexState::SingleQuoted => {
                out.push(c);
                if c == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        out.push('\'');
                        i += 2;
                        continue;
                    }
                    state = LexState::Normal;
                }
                i += 1;
            }
            LexState::DoubleQuoted => {
                out.push(c);
                if c == '"' {
                    if chars.get(i + 1) == Some(&'"') {
                        out.push('"');
                        i += 2;
                        continue;
                    }
                    state = LexState::Normal;
                }
                i += 1;
            }
            LexState::LineComment => {
                out.push(c);
                if c == '\n' {
                    state = LexState::Normal;
                }
                i += 1;
            }
            LexState::BlockComment => {
                if c == '*' && chars.get(i + 1) == Some(&'/') {
                    out.push_str("*/");
                    state = LexState::Normal;
                    i += 2;
                } else {
                    out.push(c);
                    i += 1;
                }
            }
        }
    }

    Ok(out)
}

/// Rewrite `datetime('now')` / `datetime('now', '+N unit')` calls (SQLite)
/// into `NOW()` / `(NOW() + INTERVAL 'N unit')` (Postgres).
///
/// Only recognizes the literal `datetime(` function-call form used by this
/// crate's own queries; does not attempt general SQLite datetime-function
/// coverage.
pub fn rewrite_datetime(sql: &str) -> String {
    const NEEDLE: &str = "datetime(";
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;

    while let Some(pos) = rest.find(NEEDLE) {
        out.push_str(&rest[..pos]);
        let after_paren = &rest[pos + NEEDLE.len()..];
        match extract_paren_args(after_paren) {
            Some((args, consumed)) => {
                out.push_str(&translate_datetime_args(args));
                rest = &after_paren[consumed..];
            }
            None => {
                // Unbalanced parens; emit the needle as-is and move on.
                out.push_str(NEEDLE);
                rest = after_paren;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Given the text immediately following an opening `(`, return the
/// argument text up to (not including) the matching `)`, plus the number
/// of bytes consumed including that closing paren. Respects single-quoted
/// strings so a `)` inside a string literal doesn't end the call early.
fn extract_paren_args(s: &str) -> Option<(&str, usize)> {
    let bytes = s.as_bytes();
    let mut depth: i32 = 1;
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_quote {
            if b == b'\'' {
                if bytes.get(i + 1) == Some(&b'\'') {
                    i += 2;
                    continue;
                }
                in_quote = false;
            }
        } else {
            match b {
                b'\'' => in_quote = true,
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((&s[..i], i + 1));
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Translate the argument list of a `datetime(...)` call to its Postgres
/// equivalent expression text (without the enclosing parens).
fn translate_datetime_args(args: &str) -> String {
    let parts = split_top_level_args(args);
    match parts.as_slice() {
        [first] if unquote(first).eq_ignore_ascii_case("now") => "NOW()".to_string(),
        [first, second] if unquote(first).eq_ignore_ascii_case("now") => {
            let modifier = unquote(second);
            let modifier = modifier.trim();
            let (sign, amount) = match modifier.split_at(1) {
                ("+", rest) => ("+", rest.trim()),
                ("-", rest) => ("-", rest.trim()),
                _ => ("+", modifier),
            };
            format!("(NOW() {sign} INTERVAL '{amount}')")
        }
        _ => format!("datetime({args})"),
    }
}

fn split_top_level_args(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    let bytes = args.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_quote = !in_quote,
            b',' if !in_quote => {
                parts.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(args[start..].trim());
    parts
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(s)
}

/// Rewrite SQLite's two-argument scalar `MAX(a, b)` into Postgres's
/// `GREATEST(a, b)`.
///
/// SQLite's `MAX`/`MIN` are overloaded: called with one argument they
/// aggregate a column, called with two or more they return the largest
/// argument as a scalar. Postgres's `MAX` is aggregate-only regardless of
/// arity, so a two-arg call errors with `function max(integer, integer)
/// does not exist`. Only the multi-argument scalar form is rewritten --
/// `MAX(col)` aggregate calls are left untouched.
pub fn rewrite_scalar_max(sql: &str) -> String {
    const NEEDLE: &str = "MAX(";
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;

    while let Some(pos) = rest.find(NEEDLE) {
        out.push_str(&rest[..pos]);
        let after_paren = &rest[pos + NEEDLE.len()..];
        match extract_paren_args(after_paren) {
            Some((args, consumed)) if split_top_level_args(args).len() >= 2 => {
                out.push_str("GREATEST(");
                out.push_str(args);
                out.push(')');
                rest = &after_paren[consumed..];
            }
            _ => {
                out.push_str(NEEDLE);
                rest = after_paren;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Rewrite SQLite's `INSERT OR IGNORE INTO` into Postgres's
/// `INSERT INTO ... ON CONFLICT DO NOTHING`.
///
/// Assumes a single statement with no trailing semicolon (the convention
/// used throughout this crate's query functions).
pub fn rewrite_insert_or_ignore(sql: &str) -> String {
    const NEEDLE: &str = "INSERT OR IGNORE INTO";
    if let Some(pos) = sql.find(NEEDLE) {
        let mut rewritten = String::with_capacity(sql.len() + 32);
        rewritten.push_str(&sql[..pos]);
        rewritten.push_str("INSERT INTO");
        rewritten.push_str(&sql[pos + NEEDLE.len()..]);
        rewritten.push_str(" ON CONFLICT DO NOTHING");
        rewritten
    } else {
        sql.to_string()
    }
}

/// Apply all secondary-dialect rewrites to a query written in the native
/// (SQLite) dialect, in the order: placeholders, `datetime()`, `INSERT OR
/// IGNORE`, scalar `MAX`.
///
/// This is a monoid identity on queries containing none of the rewritable
/// constructs, and a total function on every input that does not contain a
/// `?|`/`?&` operator outside a quoted context.
pub fn to_secondary_dialect(sql: &str) -> Result<String, RewriteError> {
    let sql = rewrite_insert_or_ignore(sql);
    let sql = rewrite_datetime(&sql);
    let sql = rewrite_scalar_max(&sql);
    rewrite_placeholders(&sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_on_plain_query() {
        let sql = "SELECT id, name FROM agents WHERE status = 'active'";
        assert_eq!(to_secondary_dialect(sql).unwrap(), sql);
    }

    #[test]
    fn rewrites_placeholders_in_order() {
        let sql = "SELECT * FROM tasks WHERE id = ? AND project_id = ?";
        let rewritten = rewrite_placeholders(sql).unwrap();
        assert_eq!(
            rewritten,
            "SELECT * FROM tasks WHERE id = $1 AND project_id = $2"
        );
    }

    #[test]
    fn does_not_rewrite_question_mark_in_string_literal() {
        let sql = "SELECT * FROM tasks WHERE description = 'are you sure?' AND id = ?";
        let rewritten = rewrite_placeholders(sql).unwrap();
        assert_eq!(
            rewritten,
            "SELECT * FROM tasks WHERE description = 'are you sure?' AND id = $1"
        );
    }

    #[test]
    fn does_not_rewrite_inside_line_comment() {
        let sql = "SELECT 1 -- what about ? here\nWHERE id = ?";
        let rewritten = rewrite_placeholders(sql).unwrap();
        assert_eq!(rewritten, "SELECT 1 -- what about ? here\nWHERE id = $1");
    }

    #[test]
    fn does_not_rewrite_inside_block_comment() {
        let sql = "SELECT 1 /* skip ? this */ WHERE id = ?";
        let rewritten = rewrite_placeholders(sql).unwrap();
        assert_eq!(rewritten, "SELECT 1 /* skip ? this */ WHERE id = $1");
    }

    #[test]
    fn errors_on_json_contains_any_operator() {
        let sql = "SELECT * FROM routes WHERE tags ?| array['a']";
        let err = rewrite_placeholders(sql).unwrap_err();
        assert_eq!(err, RewriteError::AmbiguousJsonOperator("?|"));
    }

    #[test]
    fn errors_on_json_contains_all_operator() {
        let sql = "SELECT * FROM routes WHERE tags ?& array['a']";
        let err = rewrite_placeholders(sql).unwrap_err();
        assert_eq!(err, RewriteError::AmbiguousJsonOperator("?&"));
    }

    #[test]
    fn json_operator_inside_string_literal_is_not_an_error() {
        let sql = "SELECT '?|' FROM agents WHERE id = ?";
        let rewritten = rewrite_placeholders(sql).unwrap();
        assert_eq!(rewritten, "SELECT '?|' FROM agents WHERE id = $1");
    }

    #[test]
    fn rewrites_datetime_now() {
        let sql = "SELECT datetime('now')";
        assert_eq!(rewrite_datetime(sql), "SELECT NOW()");
    }

    #[test]
    fn rewrites_datetime_now_plus_interval() {
        let sql = "SELECT datetime('now', '+5 minutes')";
        assert_eq!(
            rewrite_datetime(sql),
            "SELECT (NOW() + INTERVAL '5 minutes')"
        );
    }

    #[test]
    fn rewrites_datetime_now_minus_interval() {
        let sql = "SELECT datetime('now', '-1 hour')";
        assert_eq!(
            rewrite_datetime(sql),
            "SELECT (NOW() - INTERVAL '1 hour')"
        );
    }

    #[test]
    fn rewrites_two_arg_scalar_max_to_greatest() {
        let sql = "UPDATE agents SET capacity_in_use = MAX(0, capacity_in_use - 1) WHERE id = ?";
        assert_eq!(
            rewrite_scalar_max(sql),
            "UPDATE agents SET capacity_in_use = GREATEST(0, capacity_in_use - 1) WHERE id = ?"
        );
    }

    #[test]
    fn leaves_one_arg_aggregate_max_alone() {
        let sql = "SELECT MAX(version) AS max_version FROM deliverables WHERE task_id = ?";
        assert_eq!(rewrite_scalar_max(sql), sql);
    }

    #[test]
    fn rewrites_insert_or_ignore() {
        let sql = "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?, ?)";
        let rewritten = rewrite_insert_or_ignore(sql);
        assert_eq!(
            rewritten,
            "INSERT INTO task_dependencies (task_id, depends_on) VALUES (?, ?) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn full_pipeline_combines_all_three_rewrites() {
        let sql = "INSERT OR IGNORE INTO agents (id, seen_at) VALUES (?, datetime('now'))";
        let rewritten = to_secondary_dialect(sql).unwrap();
        assert_eq!(
            rewritten,
            "INSERT INTO agents (id, seen_at) VALUES ($1, NOW()) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn is_total_function_without_ambiguous_operators() {
        // A grab-bag of inputs that must not panic and must produce Ok.
        let samples = [
            "",
            "?",
            "'?'",
            "\"?\"",
            "-- ?\n?",
            "/* ? */ ?",
            "datetime('now')",
        ];
        for s in samples {
            assert!(rewrite_placeholders(s).is_ok(), "failed on: {s:?}");
        }
    }
}
