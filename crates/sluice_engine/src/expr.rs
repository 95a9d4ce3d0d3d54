//! Scalar expressions evaluated by the router itself: filter predicates,
//! LIMIT bounds and routing values.
//!
//! Comparison follows SQL three-valued logic: any comparison with NULL yields
//! NULL, and a filter only passes rows whose predicate is exactly TRUE.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use sluice_common::datum::{cmp_datum, Datum, OwnedRow};
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::{BindValue, BindVars};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::NotEq => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::LtEq => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::GtEq => ord != Ordering::Less,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtEq => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtEq => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Column(usize),
    Literal(Datum),
    /// Named bind variable; a list variable is only valid in list context.
    BindVar(String),
    /// Tuple of expressions, list context only.
    List(Vec<Expr>),
    Compare {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    InList {
        expr: Box<Expr>,
        list: Box<Expr>,
        negated: bool,
    },
}

impl Expr {
    pub fn column(idx: usize) -> Self {
        Expr::Column(idx)
    }

    pub fn literal(d: impl Into<Datum>) -> Self {
        Expr::Literal(d.into())
    }

    pub fn bind_var(name: impl Into<String>) -> Self {
        Expr::BindVar(name.into())
    }

    pub fn compare(op: CmpOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Evaluate in scalar context.
    pub fn eval(&self, row: &OwnedRow, bind_vars: &BindVars) -> SluiceResult<Datum> {
        match self {
            Expr::Column(idx) => row.get(*idx).cloned().ok_or_else(|| {
                SluiceError::Execution(format!(
                    "column index {} out of bounds for row of width {}",
                    idx,
                    row.len()
                ))
            }),
            Expr::Literal(d) => Ok(d.clone()),
            Expr::BindVar(name) => match bind_vars.get(name) {
                Some(BindValue::Scalar(d)) => Ok(d.clone()),
                Some(BindValue::List(_)) => Err(SluiceError::Execution(format!(
                    "bind variable {name} is a list, expected a scalar"
                ))),
                None => Err(SluiceError::Execution(format!(
                    "missing bind variable: {name}"
                ))),
            },
            Expr::List(_) => Err(SluiceError::Execution(
                "tuple used in scalar context".into(),
            )),
            Expr::Compare { op, left, right } => {
                let l = left.eval(row, bind_vars)?;
                let r = right.eval(row, bind_vars)?;
                if l.is_null() || r.is_null() {
                    return Ok(Datum::Null);
                }
                Ok(Datum::Boolean(op.holds(cmp_datum(&l, &r))))
            }
            Expr::And(items) => {
                let mut saw_null = false;
                for item in items {
                    match truth(&item.eval(row, bind_vars)?)? {
                        Some(false) => return Ok(Datum::Boolean(false)),
                        None => saw_null = true,
                        Some(true) => {}
                    }
                }
                Ok(if saw_null {
                    Datum::Null
                } else {
                    Datum::Boolean(true)
                })
            }
            Expr::Or(items) => {
                let mut saw_null = false;
                for item in items {
                    match truth(&item.eval(row, bind_vars)?)? {
                        Some(true) => return Ok(Datum::Boolean(true)),
                        None => saw_null = true,
                        Some(false) => {}
                    }
                }
                Ok(if saw_null {
                    Datum::Null
                } else {
                    Datum::Boolean(false)
                })
            }
            Expr::Not(inner) => Ok(match truth(&inner.eval(row, bind_vars)?)? {
                Some(b) => Datum::Boolean(!b),
                None => Datum::Null,
            }),
            Expr::IsNull(inner) => Ok(Datum::Boolean(inner.eval(row, bind_vars)?.is_null())),
            Expr::IsNotNull(inner) => {
                Ok(Datum::Boolean(!inner.eval(row, bind_vars)?.is_null()))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let val = expr.eval(row, bind_vars)?;
                if val.is_null() {
                    return Ok(Datum::Null);
                }
                let mut saw_null = false;
                for item in list.eval_list(row, bind_vars)? {
                    if item.is_null() {
                        saw_null = true;
                    } else if cmp_datum(&val, &item) == Ordering::Equal {
                        return Ok(Datum::Boolean(!negated));
                    }
                }
                Ok(if saw_null {
                    Datum::Null
                } else {
                    Datum::Boolean(*negated)
                })
            }
        }
    }

    /// Evaluate in list context: list bind variables and tuples expand,
    /// anything else is a one-element list.
    pub fn eval_list(&self, row: &OwnedRow, bind_vars: &BindVars) -> SluiceResult<Vec<Datum>> {
        match self {
            Expr::BindVar(name) => match bind_vars.get(name) {
                Some(BindValue::List(items)) => Ok(items.clone()),
                Some(BindValue::Scalar(d)) => Ok(vec![d.clone()]),
                None => Err(SluiceError::Execution(format!(
                    "missing bind variable: {name}"
                ))),
            },
            Expr::List(items) => items.iter().map(|e| e.eval(row, bind_vars)).collect(),
            other => Ok(vec![other.eval(row, bind_vars)?]),
        }
    }

    /// Predicate check: only TRUE passes.
    pub fn eval_filter(&self, row: &OwnedRow, bind_vars: &BindVars) -> SluiceResult<bool> {
        Ok(truth(&self.eval(row, bind_vars)?)?.unwrap_or(false))
    }

    /// Evaluate without a row (routing values, LIMIT bounds).
    pub fn eval_const(&self, bind_vars: &BindVars) -> SluiceResult<Datum> {
        self.eval(&OwnedRow::default(), bind_vars)
    }
}

fn truth(d: &Datum) -> SluiceResult<Option<bool>> {
    match d {
        Datum::Null => Ok(None),
        Datum::Boolean(b) => Ok(Some(*b)),
        Datum::Int64(v) => Ok(Some(*v != 0)),
        Datum::UInt64(v) => Ok(Some(*v != 0)),
        other => Err(SluiceError::Execution(format!(
            "expected boolean, got {}",
            other.to_sql_literal()
        ))),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(i) => write!(f, "#{i}"),
            Expr::Literal(d) => write!(f, "{}", d.to_sql_literal()),
            Expr::BindVar(n) => write!(f, ":{n}"),
            Expr::List(items) => {
                let parts: Vec<String> = items.iter().map(|e| e.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
            Expr::Compare { op, left, right } => write!(f, "{left} {} {right}", op.symbol()),
            Expr::And(items) => {
                let parts: Vec<String> = items.iter().map(|e| e.to_string()).collect();
                write!(f, "({})", parts.join(" and "))
            }
            Expr::Or(items) => {
                let parts: Vec<String> = items.iter().map(|e| e.to_string()).collect();
                write!(f, "({})", parts.join(" or "))
            }
            Expr::Not(e) => write!(f, "not {e}"),
            Expr::IsNull(e) => write!(f, "{e} is null"),
            Expr::IsNotNull(e) => write!(f, "{e} is not null"),
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                if *negated {
                    write!(f, "{expr} not in {list}")
                } else {
                    write!(f, "{expr} in {list}")
                }
            }
        }
    }
}
