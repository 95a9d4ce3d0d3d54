use sluice_common::datum::{Datum, Field, QueryResult};
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::{BindValue, BindVars};

use super::{Primitive, PrimitiveOps, StreamCallback};
use crate::expr::Expr;
use crate::vcursor::VCursor;

/// Bind variable telling the input how many rows the limit will consume,
/// so shards can push `LIMIT :__upper_limit` down.
pub const UPPER_LIMIT_VAR: &str = "__upper_limit";

/// Applies OFFSET then LIMIT. Both bounds are evaluated at execute time so
/// they may come from bind variables.
#[derive(Debug, Clone)]
pub struct Limit {
    pub count: Expr,
    pub offset: Option<Expr>,
    pub input: Box<Primitive>,
}

impl Limit {
    pub fn new(count: Expr, offset: Option<Expr>, input: Primitive) -> Self {
        Self {
            count,
            offset,
            input: Box::new(input),
        }
    }

    fn bound(expr: &Expr, what: &str, bind_vars: &BindVars) -> SluiceResult<usize> {
        match expr.eval_const(bind_vars)? {
            Datum::Int64(v) if v >= 0 => Ok(v as usize),
            Datum::UInt64(v) => Ok(v as usize),
            other => Err(SluiceError::Execution(format!(
                "invalid {what} value: {}",
                other.to_sql_literal()
            ))),
        }
    }

    fn bounds(&self, bind_vars: &BindVars) -> SluiceResult<(usize, usize)> {
        let count = Self::bound(&self.count, "limit", bind_vars)?;
        let offset = match &self.offset {
            Some(e) => Self::bound(e, "offset", bind_vars)?,
            None => 0,
        };
        Ok((count, offset))
    }

    fn input_vars(bind_vars: &BindVars, count: usize, offset: usize) -> BindVars {
        let mut bv = bind_vars.clone();
        bv.insert(
            UPPER_LIMIT_VAR.to_string(),
            BindValue::Scalar(Datum::Int64(count.saturating_add(offset) as i64)),
        );
        bv
    }
}

impl PrimitiveOps for Limit {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        let (count, offset) = self.bounds(bind_vars)?;
        let bv = Self::input_vars(bind_vars, count, offset);
        let mut result = self.input.execute(vc, &bv)?;
        let skip = offset.min(result.rows.len());
        result.rows.drain(..skip);
        result.rows.truncate(count);
        Ok(result)
    }

    fn stream_execute(
        &self,
        vc: &dyn VCursor,
        bind_vars: &BindVars,
        callback: &mut StreamCallback<'_>,
    ) -> SluiceResult<()> {
        let (count, offset) = self.bounds(bind_vars)?;
        let bv = Self::input_vars(bind_vars, count, offset);
        let mut to_skip = offset;
        let mut remaining = count;
        let mut sent_fields = false;
        self.input.stream_execute(vc, &bv, &mut |mut batch| {
            let skip = to_skip.min(batch.rows.len());
            batch.rows.drain(..skip);
            to_skip -= skip;
            batch.rows.truncate(remaining);
            remaining -= batch.rows.len();
            // Once the limit is met only a field-carrying batch is still worth sending.
            if batch.rows.is_empty() && (sent_fields || batch.fields.is_empty()) {
                return Ok(());
            }
            sent_fields |= !batch.fields.is_empty();
            callback(batch)
        })
    }

    fn get_fields(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        self.input.get_fields(vc, bind_vars)
    }

    fn needs_transaction(&self) -> bool {
        self.input.needs_transaction()
    }

    fn description(&self) -> String {
        match &self.offset {
            Some(o) => format!("Limit count={} offset={}", self.count, o),
            None => format!("Limit count={}", self.count),
        }
    }

    fn inputs(&self) -> Vec<&Primitive> {
        vec![self.input.as_ref()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::{Route, RouteOpcode};
    use crate::testing::{int_result, int_row, FakeCursor};

    fn five_rows() -> FakeCursor {
        FakeCursor::new(|_, _| Ok(int_result(&["a"], &[&[1], &[2], &[3], &[4], &[5]])))
    }

    #[test]
    fn test_limit_offset_from_bind_vars() {
        let vc = five_rows();
        let input = Route::new(RouteOpcode::Unsharded, "main", "select a from t limit :__upper_limit");
        let limit = Limit::new(Expr::bind_var("n"), Some(Expr::bind_var("off")), input.into());
        let mut bv = BindVars::new();
        bv.insert("n".into(), BindValue::Scalar(Datum::Int64(2)));
        bv.insert("off".into(), BindValue::Scalar(Datum::Int64(1)));
        let res = limit.execute(&vc, &bv).unwrap();
        assert_eq!(res.rows, vec![int_row(&[2]), int_row(&[3])]);
        assert_eq!(vc.sql_calls(), vec!["select a from t limit 3".to_string()]);
    }

    #[test]
    fn test_offset_past_end() {
        let vc = five_rows();
        let input = Route::new(RouteOpcode::Unsharded, "main", "select a from t");
        let limit = Limit::new(
            Expr::literal(Datum::Int64(10)),
            Some(Expr::literal(Datum::Int64(9))),
            input.into(),
        );
        assert!(limit.execute(&vc, &BindVars::new()).unwrap().rows.is_empty());
    }

    #[test]
    fn test_negative_limit_rejected() {
        let vc = five_rows();
        let input = Route::new(RouteOpcode::Unsharded, "main", "select a from t");
        let limit = Limit::new(Expr::literal(Datum::Int64(-1)), None, input.into());
        assert!(matches!(
            limit.execute(&vc, &BindVars::new()),
            Err(SluiceError::Execution(_))
        ));
    }

    #[test]
    fn test_stream_limit_across_batches() {
        let vc = FakeCursor::new(|_, _| Ok(int_result(&["a"], &[&[1], &[2]])));
        let input = Route::new(RouteOpcode::Scatter, "user", "select a from t");
        let limit = Limit::new(Expr::literal(Datum::Int64(3)), None, input.into());
        let mut rows = Vec::new();
        limit
            .stream_execute(&vc, &BindVars::new(), &mut |b| {
                rows.extend(b.rows);
                Ok(())
            })
            .unwrap();
        assert_eq!(rows.len(), 3);
    }
}
