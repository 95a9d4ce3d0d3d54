use std::cmp::Ordering;

use sluice_common::datum::{cmp_datum, Datum, Field, OwnedRow, QueryResult};
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::{BindValue, BindVars, ShardTarget};
use sluice_sharding::Destination;

use super::{Primitive, PrimitiveOps, StreamCallback};
use crate::bind::BoundQuery;
use crate::expr::Expr;
use crate::vcursor::{ResolvedShardQuery, VCursor};

/// Bind variable carrying each shard's share of an IN list.
pub const LIST_VAR: &str = "__vals";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOpcode {
    /// Single-shard keyspace.
    Unsharded,
    /// Exactly one shard, from a unique routing value.
    EqualUnique,
    /// Shards owning a non-unique routing value.
    Equal,
    /// One query per shard, each with its own IN sub-list.
    In,
    Scatter,
    /// Pre-resolved destination; routing values are ignored.
    ByDestination,
}

impl RouteOpcode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteOpcode::Unsharded => "Unsharded",
            RouteOpcode::EqualUnique => "EqualUnique",
            RouteOpcode::Equal => "Equal",
            RouteOpcode::In => "In",
            RouteOpcode::Scatter => "Scatter",
            RouteOpcode::ByDestination => "ByDestination",
        }
    }
}

/// Merge-sort key for multi-shard results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderByParam {
    pub col: usize,
    /// Column holding a binary-comparable weight string for `col`.
    pub weight_string_col: Option<usize>,
    pub desc: bool,
}

impl OrderByParam {
    pub fn asc(col: usize) -> Self {
        Self {
            col,
            weight_string_col: None,
            desc: false,
        }
    }

    pub fn desc(col: usize) -> Self {
        Self {
            col,
            weight_string_col: None,
            desc: true,
        }
    }

    fn sort_col(&self, row: &OwnedRow) -> usize {
        match self.weight_string_col {
            Some(ws) if row.get(ws).is_some_and(|d| !d.is_null()) => ws,
            _ => self.col,
        }
    }
}

pub(crate) fn compare_rows(a: &OwnedRow, b: &OwnedRow, order_by: &[OrderByParam]) -> Ordering {
    for param in order_by {
        let ca = param.sort_col(a);
        let cb = param.sort_col(b);
        let ord = match (a.get(ca), b.get(cb)) {
            (Some(x), Some(y)) => cmp_datum(x, y),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ord = if param.desc { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Stable sort of merged shard rows. Every row must carry the sort columns.
pub(crate) fn sort_rows(rows: &mut [OwnedRow], order_by: &[OrderByParam]) -> SluiceResult<()> {
    for row in rows.iter() {
        for p in order_by {
            if p.col >= row.len() {
                return Err(SluiceError::Execution(format!(
                    "order by column {} out of bounds for row of width {}",
                    p.col,
                    row.len()
                )));
            }
        }
    }
    rows.sort_by(|a, b| compare_rows(a, b, order_by));
    Ok(())
}

/// Read leaf: sends one statement to the shards picked by its opcode.
#[derive(Debug, Clone)]
pub struct Route {
    pub opcode: RouteOpcode,
    pub keyspace: String,
    pub query: String,
    /// Returns no rows, only the field list (`... where 1 != 1`).
    pub field_query: String,
    pub values: Vec<Expr>,
    pub target_destination: Option<Destination>,
    pub order_by: Vec<OrderByParam>,
    /// Drop helper columns beyond this width (0 keeps everything).
    pub truncate_column_count: usize,
}

impl Route {
    pub fn new(opcode: RouteOpcode, keyspace: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            opcode,
            keyspace: keyspace.into(),
            query: query.into(),
            field_query: String::new(),
            values: Vec::new(),
            target_destination: None,
            order_by: Vec::new(),
            truncate_column_count: 0,
        }
    }

    pub fn with_field_query(mut self, field_query: impl Into<String>) -> Self {
        self.field_query = field_query.into();
        self
    }

    pub fn with_values(mut self, values: Vec<Expr>) -> Self {
        self.values = values;
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.target_destination = Some(destination);
        self
    }

    pub fn with_order_by(mut self, order_by: Vec<OrderByParam>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn with_truncate_column_count(mut self, width: usize) -> Self {
        self.truncate_column_count = width;
        self
    }

    fn routing_value(&self) -> SluiceResult<&Expr> {
        self.values.first().ok_or_else(|| {
            SluiceError::internal_bug(
                "E-ROUTE-001",
                format!("{} route has no routing value", self.opcode.as_str()),
                format!("keyspace={} query={}", self.keyspace, self.query),
            )
        })
    }

    fn resolve_one(&self, vc: &dyn VCursor, dest: Destination) -> SluiceResult<Vec<ShardTarget>> {
        let mut resolved = vc.resolve_destinations(&self.keyspace, &[dest])?;
        Ok(resolved.pop().unwrap_or_default())
    }

    /// Target shards, each with the bind variables its query is rendered with.
    fn resolve_shards(
        &self,
        vc: &dyn VCursor,
        bind_vars: &BindVars,
    ) -> SluiceResult<Vec<(ShardTarget, BindVars)>> {
        if let Some(hint) = vc.shard_hint().filter(|h| h.keyspace == self.keyspace) {
            tracing::debug!(
                keyspace = %self.keyspace,
                shard = %hint.shard,
                opcode = self.opcode.as_str(),
                "explicit shard target overrides routing"
            );
            let mut bv = bind_vars.clone();
            if self.opcode == RouteOpcode::In {
                let vals: Vec<Datum> = self
                    .routing_value()?
                    .eval_list(&OwnedRow::default(), bind_vars)?
                    .into_iter()
                    .filter(|v| !v.is_null())
                    .collect();
                if vals.is_empty() {
                    return Ok(Vec::new());
                }
                bv.insert(LIST_VAR.to_string(), BindValue::List(vals));
            }
            return Ok(self
                .resolve_one(vc, Destination::Shard(hint.shard))?
                .into_iter()
                .map(|t| (t, bv.clone()))
                .collect());
        }

        let with_vars = |targets: Vec<ShardTarget>| -> Vec<(ShardTarget, BindVars)> {
            targets.into_iter().map(|t| (t, bind_vars.clone())).collect()
        };

        match self.opcode {
            RouteOpcode::Unsharded | RouteOpcode::Scatter => {
                Ok(with_vars(self.resolve_one(vc, Destination::AllShards)?))
            }
            RouteOpcode::EqualUnique | RouteOpcode::Equal => {
                let value = self.routing_value()?.eval_const(bind_vars)?;
                let targets = self.resolve_one(vc, Destination::Value(value))?;
                if self.opcode == RouteOpcode::EqualUnique && targets.len() > 1 {
                    return Err(SluiceError::internal_bug(
                        "E-ROUTE-002",
                        "unique routing value resolved to more than one shard",
                        format!("keyspace={} shards={}", self.keyspace, targets.len()),
                    ));
                }
                Ok(with_vars(targets))
            }
            RouteOpcode::In => {
                let values = self
                    .routing_value()?
                    .eval_list(&OwnedRow::default(), bind_vars)?;
                let dests: Vec<Destination> =
                    values.iter().cloned().map(Destination::Value).collect();
                let resolved = vc.resolve_destinations(&self.keyspace, &dests)?;
                let mut groups: Vec<(ShardTarget, Vec<Datum>)> = Vec::new();
                for (value, targets) in values.into_iter().zip(resolved) {
                    for target in targets {
                        match groups.iter_mut().find(|(t, _)| *t == target) {
                            Some((_, vals)) => vals.push(value.clone()),
                            None => groups.push((target, vec![value.clone()])),
                        }
                    }
                }
                Ok(groups
                    .into_iter()
                    .map(|(target, vals)| {
                        let mut bv = bind_vars.clone();
                        bv.insert(LIST_VAR.to_string(), BindValue::List(vals));
                        (target, bv)
                    })
                    .collect())
            }
            RouteOpcode::ByDestination => {
                let dest = self.target_destination.clone().ok_or_else(|| {
                    SluiceError::Unsupported(format!(
                        "ByDestination route on keyspace {} has no destination",
                        self.keyspace
                    ))
                })?;
                Ok(with_vars(self.resolve_one(vc, dest)?))
            }
        }
    }

    fn shard_queries(
        &self,
        vc: &dyn VCursor,
        bind_vars: &BindVars,
    ) -> SluiceResult<Vec<ResolvedShardQuery>> {
        let shards = self.resolve_shards(vc, bind_vars)?;
        tracing::debug!(
            keyspace = %self.keyspace,
            opcode = self.opcode.as_str(),
            shards = shards.len(),
            "route resolved"
        );
        Ok(shards
            .into_iter()
            .map(|(target, bv)| ResolvedShardQuery::single(target, BoundQuery::new(&self.query, bv)))
            .collect())
    }

    fn empty_result(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        Ok(QueryResult::with_fields(self.get_fields(vc, bind_vars)?))
    }
}

impl PrimitiveOps for Route {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        let queries = self.shard_queries(vc, bind_vars)?;
        if queries.is_empty() {
            return self.empty_result(vc, bind_vars);
        }
        let mut result = vc.execute_multi_shard(queries, false, false)?;
        vc.check_memory_rows(result.rows.len())?;
        if !self.order_by.is_empty() {
            sort_rows(&mut result.rows, &self.order_by)?;
        }
        result.truncate_columns(self.truncate_column_count);
        Ok(result)
    }

    fn stream_execute(
        &self,
        vc: &dyn VCursor,
        bind_vars: &BindVars,
        callback: &mut StreamCallback<'_>,
    ) -> SluiceResult<()> {
        // Merging needs every shard's rows.
        if !self.order_by.is_empty() {
            let result = self.execute(vc, bind_vars)?;
            return callback(result);
        }
        let queries = self.shard_queries(vc, bind_vars)?;
        if queries.is_empty() {
            return callback(self.empty_result(vc, bind_vars)?);
        }
        let mut sent_fields = false;
        for stream in vc.stream_execute_multi(queries)? {
            for batch in stream {
                vc.check_cancelled()?;
                let mut batch = batch?;
                if sent_fields {
                    batch.fields.clear();
                } else if !batch.fields.is_empty() {
                    sent_fields = true;
                }
                batch.truncate_columns(self.truncate_column_count);
                callback(batch)?;
            }
        }
        if !sent_fields {
            callback(self.empty_result(vc, bind_vars)?)?;
        }
        Ok(())
    }

    fn get_fields(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        if self.field_query.is_empty() {
            return Ok(Vec::new());
        }
        let targets = self.resolve_one(vc, Destination::AnyShard)?;
        let Some(target) = targets.into_iter().next() else {
            return Err(SluiceError::Routing(format!(
                "no shard available in keyspace {} to fetch fields",
                self.keyspace
            )));
        };
        let query = BoundQuery::new(&self.field_query, bind_vars.clone());
        let mut result = vc.execute_multi_shard(vec![ResolvedShardQuery::single(target, query)], false, false)?;
        result.truncate_columns(self.truncate_column_count);
        Ok(result.fields)
    }

    fn needs_transaction(&self) -> bool {
        false
    }

    fn description(&self) -> String {
        let mut s = format!("Route({}) ks={}", self.opcode.as_str(), self.keyspace);
        if !self.values.is_empty() {
            let vals: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
            s.push_str(&format!(" values=[{}]", vals.join(", ")));
        }
        if let Some(dest) = &self.target_destination {
            s.push_str(&format!(" destination={dest}"));
        }
        if !self.order_by.is_empty() {
            let cols: Vec<String> = self
                .order_by
                .iter()
                .map(|o| format!("{}{}", o.col, if o.desc { " desc" } else { "" }))
                .collect();
            s.push_str(&format!(" order_by=[{}]", cols.join(", ")));
        }
        s
    }

    fn inputs(&self) -> Vec<&Primitive> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{int_result, int_row, FakeCursor};
    use crate::vcursor::ShardHint;
    use sluice_common::datum::DataType;

    #[test]
    fn test_equal_unique_hits_one_shard() {
        let vc = FakeCursor::new(|_, _| Ok(int_result(&["id"], &[&[7]])));
        let route = Route::new(RouteOpcode::EqualUnique, "user", "select id from u where id = :id")
            .with_values(vec![Expr::bind_var("id")]);
        let mut bv = BindVars::new();
        bv.insert("id".into(), BindValue::Scalar(Datum::Int64(7)));
        let res = route.execute(&vc, &bv).unwrap();
        assert_eq!(res.rows, vec![int_row(&[7])]);
        let calls = vc.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "select id from u where id = 7");
    }

    #[test]
    fn test_scatter_merges_all_shards() {
        let vc = FakeCursor::new(|t, _| {
            let v = if t.shard == "-80" { 1 } else { 2 };
            Ok(int_result(&["id"], &[&[v]]))
        });
        let route = Route::new(RouteOpcode::Scatter, "user", "select id from u");
        let res = route.execute(&vc, &BindVars::new()).unwrap();
        assert_eq!(res.row_count(), 2);
        assert_eq!(vc.calls().len(), 2);
    }

    #[test]
    fn test_in_splits_list_per_shard_in_order() {
        let vc = FakeCursor::new(|_, _| Ok(QueryResult::default()));
        let route = Route::new(RouteOpcode::In, "user", "select * from u where id in ::__vals")
            .with_values(vec![Expr::bind_var("ids")]);
        let ids: Vec<Datum> = (1..=8).map(Datum::Int64).collect();
        let mut bv = BindVars::new();
        bv.insert("ids".into(), BindValue::List(ids.clone()));
        route.execute(&vc, &bv).unwrap();

        let calls = vc.calls();
        assert!(!calls.is_empty() && calls.len() <= 2);
        // every id is sent exactly once, in original relative order per shard
        let mut seen = Vec::new();
        for (_, sql) in &calls {
            let list = sql.trim_start_matches("select * from u where id in (").trim_end_matches(')');
            let nums: Vec<i64> = list.split(", ").map(|s| s.parse().unwrap()).collect();
            assert!(nums.windows(2).all(|w| w[0] < w[1]));
            seen.extend(nums);
        }
        seen.sort();
        assert_eq!(seen, (1..=8).collect::<Vec<i64>>());
    }

    #[test]
    fn test_no_destination_returns_fields_only() {
        let vc = FakeCursor::new(|_, sql| {
            assert!(sql.contains("1 != 1"));
            Ok(QueryResult::with_fields(vec![Field::new("id", DataType::Int64)]))
        });
        let route = Route::new(RouteOpcode::EqualUnique, "user", "select id from u where id = :id")
            .with_field_query("select id from u where 1 != 1")
            .with_values(vec![Expr::literal(Datum::Null)]);
        let res = route.execute(&vc, &BindVars::new()).unwrap();
        assert!(res.rows.is_empty());
        assert_eq!(res.fields.len(), 1);
    }

    #[test]
    fn test_order_by_merge_and_truncate() {
        let vc = FakeCursor::new(|t, _| {
            if t.shard == "-80" {
                Ok(int_result(&["a", "w"], &[&[1, 10], &[5, 50]]))
            } else {
                Ok(int_result(&["a", "w"], &[&[3, 30], &[4, 40]]))
            }
        });
        let route = Route::new(RouteOpcode::Scatter, "user", "select a, w from u order by a desc")
            .with_order_by(vec![OrderByParam::desc(0)])
            .with_truncate_column_count(1);
        let res = route.execute(&vc, &BindVars::new()).unwrap();
        assert_eq!(
            res.rows,
            vec![int_row(&[5]), int_row(&[4]), int_row(&[3]), int_row(&[1])]
        );
        assert_eq!(res.fields.len(), 1);
    }

    #[test]
    fn test_shard_hint_wins_over_routing_value() {
        let mut vc = FakeCursor::new(|_, _| Ok(QueryResult::default()));
        vc.hint = Some(ShardHint {
            keyspace: "user".into(),
            shard: "80-".into(),
        });
        let route = Route::new(RouteOpcode::Scatter, "user", "select 1");
        route.execute(&vc, &BindVars::new()).unwrap();
        let calls = vc.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.shard, "80-");

        let in_route = Route::new(RouteOpcode::In, "user", "select 1 from u where id in ::__vals")
            .with_values(vec![Expr::bind_var("ids")]);
        let mut bv = BindVars::new();
        bv.insert(
            "ids".into(),
            BindValue::List(vec![Datum::Int64(1), Datum::Null, Datum::Int64(3)]),
        );
        in_route.execute(&vc, &bv).unwrap();
        let calls = vc.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0.shard, "80-");
        assert_eq!(calls[1].1, "select 1 from u where id in (1, 3)");

        bv.insert("ids".into(), BindValue::List(vec![Datum::Null]));
        in_route.execute(&vc, &bv).unwrap();
        assert_eq!(vc.calls().len(), 2);
    }

    #[test]
    fn test_max_rows_guard() {
        let mut vc = FakeCursor::new(|_, _| Ok(int_result(&["a"], &[&[1], &[2], &[3]])));
        vc.max_rows = 4;
        let route = Route::new(RouteOpcode::Scatter, "user", "select a from u");
        let err = route.execute(&vc, &BindVars::new()).unwrap_err();
        assert!(matches!(err, SluiceError::ResourceLimit(_)));

        vc.ignore_max_rows = true;
        assert_eq!(route.execute(&vc, &BindVars::new()).unwrap().row_count(), 6);
    }

    #[test]
    fn test_stream_sends_fields_once() {
        let vc = FakeCursor::new(|_, _| Ok(int_result(&["a"], &[&[1]])));
        let route = Route::new(RouteOpcode::Scatter, "user", "select a from u");
        let mut batches = Vec::new();
        route
            .stream_execute(&vc, &BindVars::new(), &mut |b| {
                batches.push(b);
                Ok(())
            })
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].fields.len(), 1);
        assert!(batches[1].fields.is_empty());
    }

    #[test]
    fn test_description() {
        let route = Route::new(RouteOpcode::EqualUnique, "user", "select 1")
            .with_values(vec![Expr::bind_var("id")]);
        assert_eq!(route.description(), "Route(EqualUnique) ks=user values=[:id]");
    }
}
