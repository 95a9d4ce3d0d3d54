use sluice_common::datum::{Datum, Field, QueryResult};
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::BindVars;

use super::{Primitive, PrimitiveOps, TableRoute};
use crate::expr::Expr;
use crate::vcursor::{ResolvedShardQuery, VCursor};

/// Runs a table route's physical statements one at a time instead of
/// fanning them out, stopping as soon as `limit` rows are collected.
/// Suits paged scans over many partitions where most results come early.
#[derive(Debug, Clone)]
pub struct TableQueryMultiplexer {
    pub route: TableRoute,
    pub limit: Option<Expr>,
}

impl TableQueryMultiplexer {
    pub fn new(route: TableRoute, limit: Option<Expr>) -> Self {
        Self { route, limit }
    }

    fn row_limit(&self, bind_vars: &BindVars) -> SluiceResult<Option<usize>> {
        let Some(expr) = &self.limit else {
            return Ok(None);
        };
        match expr.eval_const(bind_vars)? {
            Datum::Int64(v) if v >= 0 => Ok(Some(v as usize)),
            Datum::UInt64(v) => Ok(Some(v as usize)),
            other => Err(SluiceError::Execution(format!(
                "invalid limit value: {}",
                other.to_sql_literal()
            ))),
        }
    }
}

impl PrimitiveOps for TableQueryMultiplexer {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        let limit = self.row_limit(bind_vars)?;
        let items = self.route.work_items(vc, bind_vars)?;
        if items.is_empty() {
            return self.route.empty_result(vc, bind_vars);
        }
        let total = items.len();
        let mut merged = QueryResult::default();
        let mut issued = 0;
        for item in &items {
            if limit.is_some_and(|l| merged.rows.len() >= l) {
                break;
            }
            vc.check_cancelled()?;
            let query = ResolvedShardQuery::single(item.target.clone(), item.bound_query(&self.route.query));
            merged.append(vc.execute_multi_shard(vec![query], false, false)?);
            vc.check_memory_rows(merged.rows.len())?;
            issued += 1;
        }
        tracing::debug!(issued, total, "multiplexed table route finished");
        let mut result = self.route.finish(vc, merged)?;
        if let Some(l) = limit {
            result.rows.truncate(l);
        }
        Ok(result)
    }

    fn get_fields(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        self.route.get_fields(vc, bind_vars)
    }

    fn needs_transaction(&self) -> bool {
        false
    }

    fn description(&self) -> String {
        match &self.limit {
            Some(l) => format!("TableQueryMultiplexer limit={l} over {}", self.route.description()),
            None => format!("TableQueryMultiplexer over {}", self.route.description()),
        }
    }

    fn inputs(&self) -> Vec<&Primitive> {
        Vec::new()
    }
}
