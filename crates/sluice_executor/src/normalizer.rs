//! Statement text normalization and plan cache keys.
//!
//! Literal values in SELECT/INSERT/REPLACE statements are lifted into bind
//! variables so that statements differing only in their constants share one
//! cached plan.

use sluice_common::datum::{Datum, MAX_DECIMAL_SCALE};
use sluice_common::types::{BindValue, BindVars, StatementKind};

const BIND_PREFIX: &str = "vtg";
const SKIP_CACHE_DIRECTIVE: &str = "SKIP_QUERY_PLAN_CACHE=1";

/// Rewritten statement text plus the caller's bind variables extended with
/// the extracted literals.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedStatement {
    pub sql: String,
    pub bind_vars: BindVars,
    /// Number of literals lifted into bind variables.
    pub extracted: usize,
}

/// Collapse runs of whitespace outside quoted text into one space and trim
/// the ends.
pub fn collapse_whitespace(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    let mut chars = sql.trim().chars();
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(n) = chars.next() {
                    out.push(n);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if matches!(c, '\'' | '"' | '`') {
            quote = Some(c);
        }
        out.push(c);
    }
    out
}

/// Whether a `/*vt+ ... */` directive comment asks to bypass the plan cache.
pub fn has_skip_cache_directive(sql: &str) -> bool {
    let mut rest = sql;
    while let Some(start) = rest.find("/*") {
        let body = &rest[start + 2..];
        let Some(end) = body.find("*/") else {
            return false;
        };
        let comment = body[..end].trim_start();
        if comment.starts_with("vt+")
            && comment[3..]
                .split_whitespace()
                .any(|d| d.eq_ignore_ascii_case(SKIP_CACHE_DIRECTIVE))
        {
            return true;
        }
        rest = &body[end + 2..];
    }
    false
}

/// `keyspace:sql`, with ` hint` appended when the session targets a shard.
pub fn cache_key(keyspace: &str, sql: &str, shard_hint: Option<&str>) -> String {
    match shard_hint {
        Some(hint) => format!("{keyspace}:{sql} {hint}"),
        None => format!("{keyspace}:{sql}"),
    }
}

/// Normalize whitespace and, for parameterizable statements, extract
/// numeric and single-quoted string literals into `:vtgN` bind variables.
/// Names already present in `bind_vars` or in the text are skipped.
pub fn normalize(sql: &str, kind: StatementKind, bind_vars: &BindVars) -> NormalizedStatement {
    let collapsed = collapse_whitespace(sql);
    if !kind.is_cacheable() {
        return NormalizedStatement {
            sql: collapsed,
            bind_vars: bind_vars.clone(),
            extracted: 0,
        };
    }
    let mut namer = BindNamer::new(&collapsed, bind_vars);
    let mut out_vars = bind_vars.clone();
    let mut extracted = 0;
    let out = rewrite_literals(&collapsed, |value| {
        let name = namer.next_name();
        out_vars.insert(name.clone(), BindValue::Scalar(value));
        extracted += 1;
        name
    });
    NormalizedStatement {
        sql: out,
        bind_vars: out_vars,
        extracted,
    }
}

struct BindNamer<'a> {
    sql: &'a str,
    existing: &'a BindVars,
    counter: usize,
}

impl<'a> BindNamer<'a> {
    fn new(sql: &'a str, existing: &'a BindVars) -> Self {
        Self {
            sql,
            existing,
            counter: 0,
        }
    }

    fn next_name(&mut self) -> String {
        loop {
            self.counter += 1;
            let name = format!("{BIND_PREFIX}{}", self.counter);
            if !self.existing.contains_key(&name) && !self.sql.contains(&format!(":{name}")) {
                return name;
            }
        }
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Replace every literal with `:name`, where `name` comes from `bind`.
/// Comments, identifiers and double-quoted or backquoted text pass through
/// untouched.
fn rewrite_literals(sql: &str, mut bind: impl FnMut(Datum) -> String) -> String {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(len);
    let mut last = 0;
    let mut i = 0;
    while i < len {
        let c = bytes[i];
        match c {
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = sql[i + 2..].find("*/").map_or(len, |p| i + 2 + p + 2);
            }
            b'"' | b'`' => {
                i = skip_quoted(bytes, i, c).1;
            }
            b'\'' => {
                let (value, end) = skip_quoted(bytes, i, c);
                if let Some(text) = value {
                    out.push_str(&sql[last..i]);
                    out.push(':');
                    out.push_str(&bind(Datum::Text(text)));
                    last = end;
                }
                i = end;
            }
            b':' => {
                // existing bind variable: skip its name
                i += 1;
                while i < len && (bytes[i] == b':' || is_word_byte(bytes[i])) {
                    i += 1;
                }
            }
            _ if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) => {
                let after_word = i > 0 && (is_word_byte(bytes[i - 1]) || bytes[i - 1] == b'.');
                let end = scan_number(bytes, i);
                let ends_in_word = bytes.get(end).is_some_and(|b| is_word_byte(*b));
                if !after_word && !ends_in_word {
                    if let Some(value) = parse_number(&sql[i..end]) {
                        out.push_str(&sql[last..i]);
                        out.push(':');
                        out.push_str(&bind(value));
                        last = end;
                    }
                }
                i = end.max(i + 1);
            }
            _ if is_word_byte(c) => {
                while i < len && is_word_byte(bytes[i]) {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[last..]);
    out
}

/// Returns the unescaped contents (for single quotes) and the index just
/// past the closing quote. Unterminated quotes yield `None`.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> (Option<String>, usize) {
    let mut buf: Vec<u8> = Vec::new();
    let mut i = start + 1;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'\\' && i + 1 < bytes.len() {
            buf.push(match bytes[i + 1] {
                b'n' => b'\n',
                b't' => b'\t',
                b'r' => b'\r',
                b'0' => 0,
                other => other,
            });
            i += 2;
            continue;
        }
        if c == quote {
            if bytes.get(i + 1) == Some(&quote) {
                buf.push(quote);
                i += 2;
                continue;
            }
            let text = String::from_utf8(buf).ok();
            return (text, i + 1);
        }
        buf.push(c);
        i += 1;
    }
    (None, bytes.len())
}

fn scan_number(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if bytes.get(i) == Some(&b'.') {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if matches!(bytes.get(i), Some(b'e' | b'E')) {
        let mut j = i + 1;
        if matches!(bytes.get(j), Some(b'+' | b'-')) {
            j += 1;
        }
        if bytes.get(j).is_some_and(u8::is_ascii_digit) {
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    i
}

fn parse_number(text: &str) -> Option<Datum> {
    if text.contains(['e', 'E']) {
        return text.parse::<f64>().ok().map(Datum::Float64);
    }
    match text.split_once('.') {
        None => text
            .parse::<i64>()
            .map(Datum::Int64)
            .or_else(|_| text.parse::<u64>().map(Datum::UInt64))
            .ok(),
        Some((int_part, frac)) => {
            let digits = format!("{int_part}{frac}");
            let exact = u8::try_from(frac.len())
                .ok()
                .filter(|scale| *scale <= MAX_DECIMAL_SCALE)
                .and_then(|scale| {
                    let mantissa = if digits.is_empty() { 0 } else { digits.parse::<i128>().ok()? };
                    Some(Datum::Decimal(mantissa, scale))
                });
            // Too wide for an i128 mantissa: keep the approximate value.
            exact.or_else(|| text.parse::<f64>().ok().map(Datum::Float64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_whitespace_keeps_quoted_text() {
        assert_eq!(
            collapse_whitespace("  select  a,\n\tb from t where c = 'x   y'  "),
            "select a, b from t where c = 'x   y'"
        );
    }

    #[test]
    fn test_extracts_literals() {
        let n = normalize(
            "select * from t where id = 5 and name = 'bob' and score > 1.50",
            StatementKind::Select,
            &BindVars::new(),
        );
        assert_eq!(
            n.sql,
            "select * from t where id = :vtg1 and name = :vtg2 and score > :vtg3"
        );
        assert_eq!(n.extracted, 3);
        assert_eq!(n.bind_vars["vtg1"], BindValue::Scalar(Datum::Int64(5)));
        assert_eq!(n.bind_vars["vtg2"], BindValue::Scalar(Datum::Text("bob".into())));
        assert_eq!(n.bind_vars["vtg3"], BindValue::Scalar(Datum::Decimal(150, 2)));
    }

    #[test]
    fn test_wide_fraction_becomes_float() {
        let sql = format!("select * from t where id = 0.{}1", "0".repeat(40));
        let n = normalize(&sql, StatementKind::Select, &BindVars::new());
        assert_eq!(n.sql, "select * from t where id = :vtg1");
        assert!(matches!(n.bind_vars["vtg1"], BindValue::Scalar(Datum::Float64(_))));

        let widest = format!("select 0.{}1", "0".repeat(37));
        let n = normalize(&widest, StatementKind::Select, &BindVars::new());
        assert_eq!(n.bind_vars["vtg1"], BindValue::Scalar(Datum::Decimal(1, 38)));
    }

    #[test]
    fn test_same_shape_same_text() {
        let a = normalize("select a from t where id = 1", StatementKind::Select, &BindVars::new());
        let b = normalize("select  a from t where id = 2", StatementKind::Select, &BindVars::new());
        assert_eq!(a.sql, b.sql);
        assert_ne!(a.bind_vars, b.bind_vars);
    }

    #[test]
    fn test_identifiers_and_bind_vars_untouched() {
        let mut bv = BindVars::new();
        bv.insert("vtg1".into(), BindValue::Scalar(Datum::Int64(9)));
        let n = normalize(
            "select t1.c2, `col 3` from t1 where x = :vtg1 and y in ::ids and z = 7",
            StatementKind::Select,
            &bv,
        );
        assert_eq!(
            n.sql,
            "select t1.c2, `col 3` from t1 where x = :vtg1 and y in ::ids and z = :vtg2"
        );
        assert_eq!(n.bind_vars["vtg1"], BindValue::Scalar(Datum::Int64(9)));
    }

    #[test]
    fn test_escaped_strings_and_comments() {
        let n = normalize(
            "insert /* 42 */ into t values ('it''s', 'a\\'b', 1e3)",
            StatementKind::Insert,
            &BindVars::new(),
        );
        assert_eq!(n.sql, "insert /* 42 */ into t values (:vtg1, :vtg2, :vtg3)");
        assert_eq!(n.bind_vars["vtg1"], BindValue::Scalar(Datum::Text("it's".into())));
        assert_eq!(n.bind_vars["vtg2"], BindValue::Scalar(Datum::Text("a'b".into())));
        assert_eq!(n.bind_vars["vtg3"], BindValue::Scalar(Datum::Float64(1000.0)));
    }

    #[test]
    fn test_update_not_rewritten() {
        let n = normalize("update t  set a = 1", StatementKind::Update, &BindVars::new());
        assert_eq!(n.sql, "update t set a = 1");
        assert_eq!(n.extracted, 0);
    }

    #[test]
    fn test_skip_cache_directive() {
        assert!(has_skip_cache_directive(
            "select /*vt+ SKIP_QUERY_PLAN_CACHE=1 */ * from t"
        ));
        assert!(has_skip_cache_directive(
            "select /*vt+ QUERY_TIMEOUT_MS=10 skip_query_plan_cache=1 */ 1"
        ));
        assert!(!has_skip_cache_directive("select /* SKIP_QUERY_PLAN_CACHE=1 */ 1"));
        assert!(!has_skip_cache_directive("select 1"));
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("user", "select 1", None), "user:select 1");
        assert_eq!(cache_key("user", "select 1", Some("user:-80")), "user:select 1 user:-80");
    }
}
