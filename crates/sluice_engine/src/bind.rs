//! Bound statements and SQL text rewriting.
//!
//! Two rewrites happen on SQL templates before they leave the router:
//! - bind-variable substitution (`:name` → literal, `::name` → `(a, b, ..)`)
//! - logical → physical table renaming for table-sharded statements.
//!
//! Both scan the text once and leave quoted strings untouched.

use std::fmt;

use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::{BindValue, BindVars};
use sluice_sharding::TableMapping;

/// A SQL template plus the bind variables it will be rendered with.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub bind_vars: BindVars,
}

impl BoundQuery {
    pub fn new(sql: impl Into<String>, bind_vars: BindVars) -> Self {
        Self {
            sql: sql.into(),
            bind_vars,
        }
    }

    /// Statement text with every bind variable replaced by its literal.
    pub fn to_sql_text(&self) -> SluiceResult<String> {
        render_bind_vars(&self.sql, &self.bind_vars)
    }
}

impl fmt::Display for BoundQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_sql_text() {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str(&self.sql),
        }
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Walks `sql` and calls `on_token(start, end, prefix_len)` for each bind
/// variable (`prefix_len` 1 or 2) or bare identifier (`prefix_len` 0)
/// outside string literals. Backtick-quoted identifiers are reported with
/// their quotes stripped.
fn scan_tokens(sql: &str, mut on_token: impl FnMut(usize, usize, usize)) {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < len {
        let c = bytes[i];
        if let Some(q) = quote {
            if c == b'\\' {
                i += 2;
                continue;
            }
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            b'\'' | b'"' => {
                quote = Some(c);
                i += 1;
            }
            b'`' => {
                let start = i + 1;
                let end = sql[start..].find('`').map(|p| start + p).unwrap_or(len);
                on_token(start, end, 0);
                i = end + 1;
            }
            b':' => {
                let prefix = if bytes.get(i + 1) == Some(&b':') { 2 } else { 1 };
                let name_start = i + prefix;
                if bytes.get(name_start).is_some_and(|b| is_ident_start(*b)) {
                    let mut end = name_start + 1;
                    while end < len && is_ident_char(bytes[end]) {
                        end += 1;
                    }
                    on_token(name_start, end, prefix);
                    i = end;
                } else {
                    i += prefix;
                }
            }
            _ if is_ident_start(c) => {
                let mut end = i + 1;
                while end < len && (is_ident_char(bytes[end]) || bytes[end] == b'$') {
                    end += 1;
                }
                on_token(i, end, 0);
                i = end;
            }
            _ if c.is_ascii_digit() => {
                // skip numeric literals so `1e5` is never read as identifier `e5`
                let mut end = i + 1;
                while end < len && (is_ident_char(bytes[end]) || bytes[end] == b'.') {
                    end += 1;
                }
                i = end;
            }
            _ => i += 1,
        }
    }
}

fn render_value(name: &str, value: &BindValue, list_syntax: bool) -> SluiceResult<String> {
    match value {
        BindValue::Scalar(d) if !list_syntax => Ok(d.to_sql_literal()),
        BindValue::Scalar(_) => Err(SluiceError::Execution(format!(
            "bind variable {name} is used as a list but holds a scalar"
        ))),
        BindValue::List(items) if items.is_empty() => Err(SluiceError::Execution(format!(
            "bind variable {name} is an empty list"
        ))),
        BindValue::List(items) => {
            let parts: Vec<String> = items.iter().map(|d| d.to_sql_literal()).collect();
            Ok(format!("({})", parts.join(", ")))
        }
    }
}

/// Substitute bind variables into `sql`.
pub fn render_bind_vars(sql: &str, bind_vars: &BindVars) -> SluiceResult<String> {
    let mut out = String::with_capacity(sql.len() + 16);
    let mut last = 0;
    let mut failure: Option<SluiceError> = None;
    scan_tokens(sql, |start, end, prefix| {
        if prefix == 0 || failure.is_some() {
            return;
        }
        let name = &sql[start..end];
        let rendered = match bind_vars.get(name) {
            Some(v) => render_value(name, v, prefix == 2),
            None => Err(SluiceError::Execution(format!(
                "missing bind variable: {name}"
            ))),
        };
        match rendered {
            Ok(text) => {
                out.push_str(&sql[last..start - prefix]);
                out.push_str(&text);
                last = end;
            }
            Err(e) => failure = Some(e),
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    out.push_str(&sql[last..]);
    Ok(out)
}

/// Rename logical tables to their physical partitions. Identifiers that
/// match a key of `mapping` exactly are replaced; bind variables, string
/// literals and every other identifier are left alone.
pub fn bind_query_tables(sql: &str, mapping: &TableMapping) -> String {
    if mapping.is_empty() {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len() + 8 * mapping.len());
    let mut last = 0;
    scan_tokens(sql, |start, end, prefix| {
        if prefix != 0 {
            return;
        }
        if let Some(physical) = mapping.get(&sql[start..end]) {
            out.push_str(&sql[last..start]);
            out.push_str(physical);
            last = end;
        }
    });
    out.push_str(&sql[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_common::datum::Datum;

    fn bv(pairs: &[(&str, BindValue)]) -> BindVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_render_scalars_and_lists() {
        let vars = bv(&[
            ("id", BindValue::Scalar(Datum::Int64(5))),
            ("name", BindValue::Scalar(Datum::Text("o'neil".into()))),
            (
                "__vals",
                BindValue::List(vec![Datum::Int64(1), Datum::Int64(3)]),
            ),
        ]);
        let out = render_bind_vars(
            "select * from t where id = :id and name = :name or k in ::__vals",
            &vars,
        )
        .unwrap();
        assert_eq!(
            out,
            "select * from t where id = 5 and name = 'o\\'neil' or k in (1, 3)"
        );
    }

    #[test]
    fn test_render_skips_string_literals() {
        let vars = bv(&[("a", BindValue::Scalar(Datum::Int64(1)))]);
        let out = render_bind_vars("select ':a', \"x:a\", :a", &vars).unwrap();
        assert_eq!(out, "select ':a', \"x:a\", 1");
    }

    #[test]
    fn test_render_missing_var_is_error() {
        let err = render_bind_vars("select :nope", &BindVars::new()).unwrap_err();
        assert!(err.to_string().contains("missing bind variable: nope"));
    }

    #[test]
    fn test_render_ignores_assignment_colon() {
        let out = render_bind_vars("set @x := 1", &BindVars::new()).unwrap();
        assert_eq!(out, "set @x := 1");
    }

    #[test]
    fn test_bind_query_tables() {
        let mut m = TableMapping::new();
        m.insert("orders".into(), "orders_3".into());
        let out = bind_query_tables(
            "select orders.id from `orders` join orders_x on orders.id = :orders where c = 'orders'",
            &m,
        );
        assert_eq!(
            out,
            "select orders_3.id from `orders_3` join orders_x on orders_3.id = :orders where c = 'orders'"
        );
    }

    #[test]
    fn test_utf8_passthrough() {
        let vars = bv(&[("v", BindValue::Scalar(Datum::Text("żółw".into())))]);
        let out = render_bind_vars("select 'ą', :v", &vars).unwrap();
        assert_eq!(out, "select 'ą', 'żółw'");
    }
}
