use sluice_common::datum::{Datum, Field, OwnedRow, QueryResult};
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::{BindValue, BindVars, ShardTarget};
use sluice_sharding::{Destination, TableMapping, TableShardingIndex};

use super::route::{sort_rows, LIST_VAR};
use super::{OrderByParam, Primitive, PrimitiveOps, StreamCallback};
use crate::bind::{bind_query_tables, BoundQuery};
use crate::expr::Expr;
use crate::vcursor::{ResolvedShardQuery, VCursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableRouteOpcode {
    /// One routing value, one partition per logic table.
    EqualUnique,
    /// IN list grouped by the partition combination each value maps to.
    In,
    /// Every partition combination on every shard.
    Scatter,
}

impl TableRouteOpcode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableRouteOpcode::EqualUnique => "EqualUnique",
            TableRouteOpcode::In => "In",
            TableRouteOpcode::Scatter => "Scatter",
        }
    }
}

/// One physical statement to issue: a shard, the logic→actual table
/// substitution, and the bind variables to render with.
#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    pub target: ShardTarget,
    pub tables: TableMapping,
    pub bind_vars: BindVars,
}

impl WorkItem {
    pub(crate) fn bound_query(&self, query: &str) -> BoundQuery {
        BoundQuery::new(bind_query_tables(query, &self.tables), self.bind_vars.clone())
    }
}

/// Collect work items into per-shard query lists. Shards keep first-seen
/// order; queries keep item order within a shard.
pub(crate) fn group_by_target(items: &[WorkItem], query: &str) -> Vec<ResolvedShardQuery> {
    let mut out: Vec<ResolvedShardQuery> = Vec::new();
    for item in items {
        let q = item.bound_query(query);
        match out.iter_mut().find(|r| r.target == item.target) {
            Some(r) => r.queries.push(q),
            None => out.push(ResolvedShardQuery::single(item.target.clone(), q)),
        }
    }
    out
}

/// Routing shared by every table-sharded primitive: which partitions of
/// the referenced logic tables a statement touches, and on which shards.
#[derive(Debug, Clone)]
pub struct TableRouting {
    pub opcode: TableRouteOpcode,
    pub keyspace: String,
    pub index: TableShardingIndex,
    pub values: Vec<Expr>,
}

impl TableRouting {
    pub fn new(opcode: TableRouteOpcode, keyspace: impl Into<String>, index: TableShardingIndex) -> Self {
        Self {
            opcode,
            keyspace: keyspace.into(),
            index,
            values: Vec::new(),
        }
    }

    pub fn with_values(mut self, values: Vec<Expr>) -> Self {
        self.values = values;
        self
    }

    fn routing_value(&self) -> SluiceResult<&Expr> {
        self.values.first().ok_or_else(|| {
            SluiceError::internal_bug(
                "E-TROUTE-001",
                format!("{} table route has no routing value", self.opcode.as_str()),
                format!("keyspace={} tables={}", self.keyspace, self.table_names()),
            )
        })
    }

    pub fn table_names(&self) -> String {
        self.index
            .tables()
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn resolve(&self, vc: &dyn VCursor, dests: &[Destination]) -> SluiceResult<Vec<Vec<ShardTarget>>> {
        vc.resolve_destinations(&self.keyspace, dests)
    }

    fn hinted_shards(&self, vc: &dyn VCursor) -> SluiceResult<Option<Vec<ShardTarget>>> {
        let Some(hint) = vc.shard_hint().filter(|h| h.keyspace == self.keyspace) else {
            return Ok(None);
        };
        tracing::debug!(
            keyspace = %self.keyspace,
            shard = %hint.shard,
            "explicit shard target overrides table routing"
        );
        Ok(self.resolve(vc, &[Destination::Shard(hint.shard)])?.pop())
    }

    fn items_for(
        targets: Vec<ShardTarget>,
        tables: &TableMapping,
        bind_vars: &BindVars,
        out: &mut Vec<WorkItem>,
    ) {
        out.extend(targets.into_iter().map(|target| WorkItem {
            target,
            tables: tables.clone(),
            bind_vars: bind_vars.clone(),
        }));
    }

    pub(crate) fn work_items(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<Vec<WorkItem>> {
        let hinted = self.hinted_shards(vc)?;
        let mut items = Vec::new();
        match self.opcode {
            TableRouteOpcode::EqualUnique => {
                let value = self.routing_value()?.eval_const(bind_vars)?;
                let tables = self.index.map(&value)?;
                let targets = match hinted {
                    Some(t) => t,
                    None => self
                        .resolve(vc, &[Destination::Value(value)])?
                        .pop()
                        .unwrap_or_default(),
                };
                Self::items_for(targets, &tables, bind_vars, &mut items);
            }
            TableRouteOpcode::In => {
                // NULL never matches an IN list.
                let values: Vec<Datum> = self
                    .routing_value()?
                    .eval_list(&OwnedRow::default(), bind_vars)?
                    .into_iter()
                    .filter(|v| !v.is_null())
                    .collect();
                for group in self.index.resolve_in(&values)? {
                    let per_shard: Vec<(ShardTarget, Vec<Datum>)> = match &hinted {
                        Some(targets) => targets
                            .iter()
                            .map(|t| (t.clone(), group.values.clone()))
                            .collect(),
                        None => self.split_by_shard(vc, group.values)?,
                    };
                    for (target, vals) in per_shard {
                        let mut bv = bind_vars.clone();
                        bv.insert(LIST_VAR.to_string(), BindValue::List(vals));
                        items.push(WorkItem {
                            target,
                            tables: group.tables.clone(),
                            bind_vars: bv,
                        });
                    }
                }
            }
            TableRouteOpcode::Scatter => {
                let targets = match hinted {
                    Some(t) => t,
                    None => self.resolve(vc, &[Destination::AllShards])?.pop().unwrap_or_default(),
                };
                let partitions = self.index.resolve_all_partitions();
                for target in targets {
                    for tables in &partitions {
                        Self::items_for(vec![target.clone()], tables, bind_vars, &mut items);
                    }
                }
            }
        }
        tracing::debug!(
            keyspace = %self.keyspace,
            opcode = self.opcode.as_str(),
            tables = %self.table_names(),
            items = items.len(),
            "table route resolved"
        );
        Ok(items)
    }

    /// Sub-group one partition group's values by owning shard.
    fn split_by_shard(&self, vc: &dyn VCursor, values: Vec<Datum>) -> SluiceResult<Vec<(ShardTarget, Vec<Datum>)>> {
        let dests: Vec<Destination> = values.iter().cloned().map(Destination::Value).collect();
        let resolved = self.resolve(vc, &dests)?;
        let mut groups: Vec<(ShardTarget, Vec<Datum>)> = Vec::new();
        for (value, targets) in values.into_iter().zip(resolved) {
            for target in targets {
                match groups.iter_mut().find(|(t, _)| *t == target) {
                    Some((_, vals)) => vals.push(value.clone()),
                    None => groups.push((target, vec![value.clone()])),
                }
            }
        }
        Ok(groups)
    }

    pub(crate) fn describe(&self, kind: &str) -> String {
        let mut s = format!(
            "{kind}({}) ks={} tables=[{}]",
            self.opcode.as_str(),
            self.keyspace,
            self.table_names()
        );
        if !self.values.is_empty() {
            let vals: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
            s.push_str(&format!(" values=[{}]", vals.join(", ")));
        }
        s
    }
}

/// Read leaf over table-sharded logic tables: the statement is rewritten
/// once per partition combination it touches.
#[derive(Debug, Clone)]
pub struct TableRoute {
    pub routing: TableRouting,
    /// Statement text naming logic tables.
    pub query: String,
    pub field_query: String,
    pub order_by: Vec<OrderByParam>,
    pub truncate_column_count: usize,
}

impl TableRoute {
    pub fn new(routing: TableRouting, query: impl Into<String>) -> Self {
        Self {
            routing,
            query: query.into(),
            field_query: String::new(),
            order_by: Vec::new(),
            truncate_column_count: 0,
        }
    }

    pub fn with_field_query(mut self, field_query: impl Into<String>) -> Self {
        self.field_query = field_query.into();
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

    pub(crate) fn work_items(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<Vec<WorkItem>> {
        self.routing.work_items(vc, bind_vars)
    }

    pub(crate) fn empty_result(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        Ok(QueryResult::with_fields(self.get_fields(vc, bind_vars)?))
    }

    /// Post-process merged rows: memory guard, merge sort, helper column
    /// truncation.
    pub(crate) fn finish(&self, vc: &dyn VCursor, mut result: QueryResult) -> SluiceResult<QueryResult> {
        vc.check_memory_rows(result.rows.len())?;
        if !self.order_by.is_empty() {
            sort_rows(&mut result.rows, &self.order_by)?;
        }
        result.truncate_columns(self.truncate_column_count);
        Ok(result)
    }
}

impl PrimitiveOps for TableRoute {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        let items = self.work_items(vc, bind_vars)?;
        if items.is_empty() {
            return self.empty_result(vc, bind_vars);
        }
        let queries = group_by_target(&items, &self.query);
        let result = vc.execute_multi_shard(queries, false, false)?;
        self.finish(vc, result)
    }

    fn stream_execute(
        &self,
        vc: &dyn VCursor,
        bind_vars: &BindVars,
        callback: &mut StreamCallback<'_>,
    ) -> SluiceResult<()> {
        if !self.order_by.is_empty() {
            let result = self.execute(vc, bind_vars)?;
            return callback(result);
        }
        let items = self.work_items(vc, bind_vars)?;
        if items.is_empty() {
            return callback(self.empty_result(vc, bind_vars)?);
        }
        let queries = group_by_target(&items, &self.query);
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
        let tables = self
            .routing
            .index
            .resolve_all_partitions()
            .into_iter()
            .next()
            .unwrap_or_default();
        let target = vc
            .resolve_destinations(&self.routing.keyspace, &[Destination::AnyShard])?
            .pop()
            .and_then(|t| t.into_iter().next())
            .ok_or_else(|| {
                SluiceError::Routing(format!(
                    "no shard available in keyspace {} to fetch fields",
                    self.routing.keyspace
                ))
            })?;
        let query = BoundQuery::new(bind_query_tables(&self.field_query, &tables), bind_vars.clone());
        let mut result = vc.execute_multi_shard(vec![ResolvedShardQuery::single(target, query)], false, false)?;
        result.truncate_columns(self.truncate_column_count);
        Ok(result.fields)
    }

    fn needs_transaction(&self) -> bool {
        false
    }

    fn description(&self) -> String {
        self.routing.describe("TableRoute")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{int_result, int_row, FakeCursor};
    use crate::vcursor::ShardHint;
    use sluice_sharding::{LogicTable, ShardingFunction};

    fn index(tables: &[&str]) -> TableShardingIndex {
        TableShardingIndex::new(
            tables
                .iter()
                .map(|t| Arc::new(LogicTable::with_partitions(*t, "id", ShardingFunction::Modulo, 2)))
                .collect(),
        )
    }

    fn ids(vals: &[i64]) -> BindVars {
        let mut bv = BindVars::new();
        bv.insert(
            "ids".into(),
            BindValue::List(vals.iter().map(|v| Datum::Int64(*v)).collect()),
        );
        bv
    }

    #[test]
    fn test_equal_unique_rewrites_table() {
        let vc = FakeCursor::new(|_, _| Ok(int_result(&["id"], &[&[3]])));
        let routing = TableRouting::new(TableRouteOpcode::EqualUnique, "main", index(&["orders"]))
            .with_values(vec![Expr::literal(Datum::Int64(3))]);
        let route = TableRoute::new(routing, "select id from orders where id = 3");
        let res = route.execute(&vc, &BindVars::new()).unwrap();
        assert_eq!(res.rows, vec![int_row(&[3])]);
        assert_eq!(vc.sql_calls(), vec!["select id from orders_1 where id = 3".to_string()]);
    }

    #[test]
    fn test_in_groups_by_partition() {
        let vc = FakeCursor::new(|_, _| Ok(QueryResult::default()));
        let routing = TableRouting::new(TableRouteOpcode::In, "main", index(&["orders"]))
            .with_values(vec![Expr::bind_var("ids")]);
        let route = TableRoute::new(routing, "select * from orders where id in ::__vals");
        route.execute(&vc, &ids(&[1, 2, 3, 4])).unwrap();
        assert_eq!(
            vc.sql_calls(),
            vec![
                "select * from orders_1 where id in (1, 3)".to_string(),
                "select * from orders_0 where id in (2, 4)".to_string(),
            ]
        );
    }

    #[test]
    fn test_in_groups_by_table_combination() {
        let vc = FakeCursor::new(|_, _| Ok(QueryResult::default()));
        let routing = TableRouting::new(TableRouteOpcode::In, "main", index(&["a", "b"]))
            .with_values(vec![Expr::bind_var("ids")]);
        let route = TableRoute::new(routing, "select * from a join b on a.id = b.id where a.id in ::__vals");
        route.execute(&vc, &ids(&[2, 5, 4])).unwrap();
        assert_eq!(
            vc.sql_calls(),
            vec![
                "select * from a_0 join b_0 on a_0.id = b_0.id where a_0.id in (2, 4)".to_string(),
                "select * from a_1 join b_1 on a_1.id = b_1.id where a_1.id in (5)".to_string(),
            ]
        );
    }

    #[test]
    fn test_scatter_is_cartesian_product() {
        let vc = FakeCursor::new(|_, _| Ok(QueryResult::default()));
        let routing = TableRouting::new(TableRouteOpcode::Scatter, "main", index(&["a", "b"]));
        let route = TableRoute::new(routing, "select * from a, b");
        route.execute(&vc, &BindVars::new()).unwrap();
        assert_eq!(
            vc.sql_calls(),
            vec![
                "select * from a_0, b_0".to_string(),
                "select * from a_0, b_1".to_string(),
                "select * from a_1, b_0".to_string(),
                "select * from a_1, b_1".to_string(),
            ]
        );
    }

    #[test]
    fn test_scatter_over_sharded_keyspace() {
        let vc = FakeCursor::new(|_, _| Ok(QueryResult::default()));
        let routing = TableRouting::new(TableRouteOpcode::Scatter, "user", index(&["t"]));
        TableRoute::new(routing, "select * from t")
            .execute(&vc, &BindVars::new())
            .unwrap();
        let calls = vc.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0].0.shard, "-80");
        assert_eq!(calls[3].0.shard, "80-");
    }

    #[test]
    fn test_unresolvable_value_is_routing_error() {
        let vc = FakeCursor::new(|_, _| Ok(QueryResult::default()));
        let routing = TableRouting::new(TableRouteOpcode::EqualUnique, "main", index(&["orders"]))
            .with_values(vec![Expr::literal(Datum::Null)]);
        let err = TableRoute::new(routing, "select 1")
            .execute(&vc, &BindVars::new())
            .unwrap_err();
        assert!(matches!(err, SluiceError::Routing(_)));
        assert!(err.to_string().contains("logic table orders"));
    }

    #[test]
    fn test_all_null_in_list_returns_fields_only() {
        let vc = FakeCursor::new(|_, sql| {
            assert!(sql.contains("orders_0 where 1 != 1"));
            Ok(QueryResult::with_fields(crate::testing::int_fields(&["id"])))
        });
        let routing = TableRouting::new(TableRouteOpcode::In, "main", index(&["orders"]))
            .with_values(vec![Expr::literal(Datum::Null)]);
        let route = TableRoute::new(routing, "select id from orders where id in ::__vals")
            .with_field_query("select id from orders where 1 != 1");
        let res = route.execute(&vc, &BindVars::new()).unwrap();
        assert!(res.rows.is_empty());
        assert_eq!(res.fields.len(), 1);
    }

    #[test]
    fn test_hint_overrides_shard_but_not_table() {
        let mut vc = FakeCursor::new(|_, _| Ok(QueryResult::default()));
        vc.hint = Some(ShardHint {
            keyspace: "user".into(),
            shard: "-80".into(),
        });
        let routing = TableRouting::new(TableRouteOpcode::EqualUnique, "user", index(&["orders"]))
            .with_values(vec![Expr::literal(Datum::Int64(1))]);
        TableRoute::new(routing, "select * from orders")
            .execute(&vc, &BindVars::new())
            .unwrap();
        let calls = vc.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.shard, "-80");
        assert_eq!(calls[0].1, "select * from orders_1");
    }

    #[test]
    fn test_description() {
        let routing = TableRouting::new(TableRouteOpcode::In, "main", index(&["a", "b"]))
            .with_values(vec![Expr::bind_var("ids")]);
        assert_eq!(
            TableRoute::new(routing, "select 1").description(),
            "TableRoute(In) ks=main tables=[a,b] values=[:ids]"
        );
    }
}
