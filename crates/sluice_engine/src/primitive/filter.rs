use sluice_common::datum::{Field, QueryResult};
use sluice_common::error::SluiceResult;
use sluice_common::types::BindVars;

use super::{Primitive, PrimitiveOps, StreamCallback};
use crate::expr::Expr;
use crate::vcursor::VCursor;

/// Keeps the rows of its input for which `predicate` is TRUE.
#[derive(Debug, Clone)]
pub struct Filter {
    pub predicate: Expr,
    pub input: Box<Primitive>,
}

impl Filter {
    pub fn new(predicate: Expr, input: Primitive) -> Self {
        Self {
            predicate,
            input: Box::new(input),
        }
    }

    fn apply(&self, result: &mut QueryResult, bind_vars: &BindVars) -> SluiceResult<()> {
        let mut kept = Vec::with_capacity(result.rows.len());
        for row in result.rows.drain(..) {
            if self.predicate.eval_filter(&row, bind_vars)? {
                kept.push(row);
            }
        }
        result.rows = kept;
        Ok(())
    }
}

impl PrimitiveOps for Filter {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        let mut result = self.input.execute(vc, bind_vars)?;
        self.apply(&mut result, bind_vars)?;
        Ok(result)
    }

    fn stream_execute(
        &self,
        vc: &dyn VCursor,
        bind_vars: &BindVars,
        callback: &mut StreamCallback<'_>,
    ) -> SluiceResult<()> {
        self.input.stream_execute(vc, bind_vars, &mut |mut batch| {
            self.apply(&mut batch, bind_vars)?;
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
        format!("Filter {}", self.predicate)
    }

    fn inputs(&self) -> Vec<&Primitive> {
        vec![self.input.as_ref()]
    }
}
