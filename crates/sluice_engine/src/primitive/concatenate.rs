use sluice_common::datum::{Field, QueryResult};
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::BindVars;

use super::{Primitive, PrimitiveOps, StreamCallback};
use crate::vcursor::VCursor;

/// UNION ALL of its sources, in source order. Wrap in `Distinct` for
/// UNION semantics.
#[derive(Debug, Clone)]
pub struct Concatenate {
    pub sources: Vec<Primitive>,
}

impl Concatenate {
    pub fn new(sources: Vec<Primitive>) -> Self {
        Self { sources }
    }
}

fn result_width(result: &QueryResult) -> Option<usize> {
    if !result.fields.is_empty() {
        Some(result.fields.len())
    } else {
        result.rows.first().map(|r| r.len())
    }
}

fn check_arity(expected: &mut Option<usize>, got: Option<usize>, source: usize) -> SluiceResult<()> {
    match (*expected, got) {
        (Some(e), Some(g)) if e != g => Err(SluiceError::Execution(format!(
            "concatenate source {source} has {g} columns, expected {e}"
        ))),
        (None, Some(g)) => {
            *expected = Some(g);
            Ok(())
        }
        _ => Ok(()),
    }
}

impl PrimitiveOps for Concatenate {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        let mut merged = QueryResult::default();
        let mut width = None;
        for (i, source) in self.sources.iter().enumerate() {
            let result = source.execute(vc, bind_vars)?;
            check_arity(&mut width, result_width(&result), i)?;
            merged.append(result);
            vc.check_memory_rows(merged.rows.len())?;
        }
        Ok(merged)
    }

    fn stream_execute(
        &self,
        vc: &dyn VCursor,
        bind_vars: &BindVars,
        callback: &mut StreamCallback<'_>,
    ) -> SluiceResult<()> {
        let mut width = None;
        let mut sent_fields = false;
        for (i, source) in self.sources.iter().enumerate() {
            source.stream_execute(vc, bind_vars, &mut |mut batch| {
                check_arity(&mut width, result_width(&batch), i)?;
                if sent_fields {
                    batch.fields.clear();
                } else if !batch.fields.is_empty() {
                    sent_fields = true;
                }
                if batch.rows.is_empty() && batch.fields.is_empty() {
                    return Ok(());
                }
                callback(batch)
            })?;
        }
        Ok(())
    }

    fn get_fields(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        let mut fields = Vec::new();
        let mut width = None;
        for (i, source) in self.sources.iter().enumerate() {
            let f = source.get_fields(vc, bind_vars)?;
            let got = (!f.is_empty()).then_some(f.len());
            check_arity(&mut width, got, i)?;
            if fields.is_empty() {
                fields = f;
            }
        }
        Ok(fields)
    }

    fn needs_transaction(&self) -> bool {
        self.sources.iter().any(|s| s.needs_transaction())
    }

    fn description(&self) -> String {
        format!("Concatenate sources={}", self.sources.len())
    }

    fn inputs(&self) -> Vec<&Primitive> {
        self.sources.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::{Route, RouteOpcode};
    use crate::testing::{int_result, int_row, FakeCursor};

    fn responder(_: &sluice_common::types::ShardTarget, sql: &str) -> SluiceResult<QueryResult> {
        match sql {
            "select a from t1" => Ok(int_result(&["a"], &[&[1], &[2]])),
            "select a from t2" => Ok(int_result(&["a"], &[&[2], &[3]])),
            _ => Ok(int_result(&["a", "b"], &[&[1, 1]])),
        }
    }

    fn source(sql: &str) -> Primitive {
        Route::new(RouteOpcode::Unsharded, "main", sql).into()
    }

    #[test]
    fn test_concatenate_keeps_child_order_and_duplicates() {
        let vc = FakeCursor::new(responder);
        let c = Concatenate::new(vec![source("select a from t1"), source("select a from t2")]);
        let res = c.execute(&vc, &BindVars::new()).unwrap();
        assert_eq!(
            res.rows,
            vec![int_row(&[1]), int_row(&[2]), int_row(&[2]), int_row(&[3])]
        );
        assert_eq!(res.fields.len(), 1);
    }

    #[test]
    fn test_arity_mismatch() {
        let vc = FakeCursor::new(responder);
        let c = Concatenate::new(vec![source("select a from t1"), source("select a, b from t3")]);
        let err = c.execute(&vc, &BindVars::new()).unwrap_err();
        assert!(err.to_string().contains("expected 1"));
    }

    #[test]
    fn test_stream_fields_once() {
        let vc = FakeCursor::new(responder);
        let c = Concatenate::new(vec![source("select a from t1"), source("select a from t2")]);
        let mut batches = Vec::new();
        c.stream_execute(&vc, &BindVars::new(), &mut |b| {
            batches.push(b);
            Ok(())
        })
        .unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches[1].fields.is_empty());
        assert_eq!(c.inputs().len(), 2);
    }
}
