use std::collections::BTreeMap;

use sluice_common::datum::{Datum, Field, OwnedRow, QueryResult};
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::{BindValue, BindVars};

use super::{Primitive, PrimitiveOps};
use crate::vcursor::VCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOpcode {
    Normal,
    /// Left outer: every LHS row appears at least once.
    Left,
}

/// Nested-loop join across routes: the RHS is executed once per LHS row
/// with that row's join columns bound as variables.
#[derive(Debug, Clone)]
pub struct Join {
    pub opcode: JoinOpcode,
    pub left: Box<Primitive>,
    pub right: Box<Primitive>,
    /// Output column mapping: `-n` is LHS column `n-1`, `+n` is RHS column
    /// `n-1`.
    pub cols: Vec<i32>,
    /// RHS bind variable name → LHS column index.
    pub vars: BTreeMap<String, usize>,
}

impl Join {
    pub fn new(
        opcode: JoinOpcode,
        left: Primitive,
        right: Primitive,
        cols: Vec<i32>,
        vars: BTreeMap<String, usize>,
    ) -> Self {
        Self {
            opcode,
            left: Box::new(left),
            right: Box::new(right),
            cols,
            vars,
        }
    }

    fn bind_lhs_row(&self, bind_vars: &BindVars, lrow: Option<&OwnedRow>) -> SluiceResult<BindVars> {
        let mut bv = bind_vars.clone();
        for (name, &col) in &self.vars {
            let value = match lrow {
                Some(row) => row.get(col).cloned().ok_or_else(|| {
                    SluiceError::Execution(format!(
                        "join variable {name} references LHS column {col} of a {}-column row",
                        row.len()
                    ))
                })?,
                None => Datum::Null,
            };
            bv.insert(name.clone(), BindValue::Scalar(value));
        }
        Ok(bv)
    }

    fn join_fields(&self, lfields: &[Field], rfields: &[Field]) -> SluiceResult<Vec<Field>> {
        self.cols
            .iter()
            .map(|&c| {
                let (fields, idx) = side(c, lfields, rfields);
                fields.get(idx).cloned().ok_or_else(|| {
                    SluiceError::Execution(format!("join column {c} has no matching field"))
                })
            })
            .collect()
    }

    fn join_rows(&self, lrow: &OwnedRow, rrow: Option<&OwnedRow>) -> SluiceResult<OwnedRow> {
        let mut values = Vec::with_capacity(self.cols.len());
        for &c in &self.cols {
            if c < 0 {
                let idx = (-c - 1) as usize;
                values.push(lrow.get(idx).cloned().ok_or_else(|| {
                    SluiceError::Execution(format!("join column {c} out of bounds on LHS"))
                })?);
            } else {
                let idx = (c - 1) as usize;
                match rrow {
                    Some(r) => values.push(r.get(idx).cloned().ok_or_else(|| {
                        SluiceError::Execution(format!("join column {c} out of bounds on RHS"))
                    })?),
                    None => values.push(Datum::Null),
                }
            }
        }
        Ok(OwnedRow::new(values))
    }
}

fn side<'a>(c: i32, lfields: &'a [Field], rfields: &'a [Field]) -> (&'a [Field], usize) {
    if c < 0 {
        (lfields, (-c - 1) as usize)
    } else {
        (rfields, (c - 1).max(0) as usize)
    }
}

impl PrimitiveOps for Join {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        let lresult = self.left.execute(vc, bind_vars)?;
        let mut rfields: Option<Vec<Field>> = None;
        let mut rows = Vec::new();

        for lrow in &lresult.rows {
            vc.check_cancelled()?;
            let bv = self.bind_lhs_row(bind_vars, Some(lrow))?;
            let rresult = self.right.execute(vc, &bv)?;
            if rfields.is_none() && !rresult.fields.is_empty() {
                rfields = Some(rresult.fields.clone());
            }
            if rresult.rows.is_empty() {
                if self.opcode == JoinOpcode::Left {
                    rows.push(self.join_rows(lrow, None)?);
                }
            } else {
                for rrow in &rresult.rows {
                    rows.push(self.join_rows(lrow, Some(rrow))?);
                }
            }
            vc.check_memory_rows(rows.len())?;
        }

        let rfields = match rfields {
            Some(f) => f,
            None => {
                let bv = self.bind_lhs_row(bind_vars, None)?;
                self.right.get_fields(vc, &bv)?
            }
        };
        let fields = if lresult.fields.is_empty() && rfields.is_empty() {
            Vec::new()
        } else {
            self.join_fields(&lresult.fields, &rfields)?
        };
        Ok(QueryResult::new(fields, rows))
    }

    fn get_fields(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        let lfields = self.left.get_fields(vc, bind_vars)?;
        let bv = self.bind_lhs_row(bind_vars, None)?;
        let rfields = self.right.get_fields(vc, &bv)?;
        self.join_fields(&lfields, &rfields)
    }

    fn needs_transaction(&self) -> bool {
        self.left.needs_transaction() || self.right.needs_transaction()
    }

    fn description(&self) -> String {
        let op = match self.opcode {
            JoinOpcode::Normal => "Join",
            JoinOpcode::Left => "LeftJoin",
        };
        let cols: Vec<String> = self.cols.iter().map(|c| c.to_string()).collect();
        let vars: Vec<String> = self.vars.iter().map(|(k, v)| format!("{k}:{v}")).collect();
        format!("{op} cols=[{}] vars=[{}]", cols.join(","), vars.join(","))
    }

    fn inputs(&self) -> Vec<&Primitive> {
        vec![self.left.as_ref(), self.right.as_ref()]
    }
}
