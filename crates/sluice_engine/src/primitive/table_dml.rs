//! Writes against table-sharded logic tables. Every variant requires a
//! transaction and asks the cursor to roll back on a shard failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use sluice_common::datum::{Field, QueryResult};
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::{BindVars, ShardTarget};
use sluice_sharding::{Destination, LogicTable, TableMapping};

use super::table_route::{group_by_target, TableRouting};
use super::{Primitive, PrimitiveOps};
use crate::bind::{bind_query_tables, BoundQuery};
use crate::expr::Expr;
use crate::vcursor::{ResolvedShardQuery, VCursor};

/// Run a write across every resolved target. Autocommit is only allowed
/// when the whole statement is a single query on a single shard.
fn execute_dml(
    vc: &dyn VCursor,
    routing: &TableRouting,
    query: &str,
    bind_vars: &BindVars,
) -> SluiceResult<QueryResult> {
    let items = routing.work_items(vc, bind_vars)?;
    if items.is_empty() {
        return Err(SluiceError::Routing(format!(
            "{} on logic tables [{}] in keyspace {} resolved to no targets",
            routing.opcode.as_str(),
            routing.table_names(),
            routing.keyspace
        )));
    }
    let queries = group_by_target(&items, query);
    let can_autocommit = queries.len() == 1 && queries[0].queries.len() == 1;
    vc.execute_multi_shard(queries, true, can_autocommit)
}

#[derive(Debug, Clone)]
pub struct TableUpdate {
    pub routing: TableRouting,
    pub query: String,
}

impl TableUpdate {
    pub fn new(routing: TableRouting, query: impl Into<String>) -> Self {
        Self {
            routing,
            query: query.into(),
        }
    }
}

impl PrimitiveOps for TableUpdate {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        execute_dml(vc, &self.routing, &self.query, bind_vars)
    }

    fn get_fields(&self, _vc: &dyn VCursor, _bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        Ok(Vec::new())
    }

    fn needs_transaction(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        self.routing.describe("TableUpdate")
    }
}

#[derive(Debug, Clone)]
pub struct TableDelete {
    pub routing: TableRouting,
    pub query: String,
}

impl TableDelete {
    pub fn new(routing: TableRouting, query: impl Into<String>) -> Self {
        Self {
            routing,
            query: query.into(),
        }
    }
}

impl PrimitiveOps for TableDelete {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        execute_dml(vc, &self.routing, &self.query, bind_vars)
    }

    fn get_fields(&self, _vc: &dyn VCursor, _bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        Ok(Vec::new())
    }

    fn needs_transaction(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        self.routing.describe("TableDelete")
    }
}

/// One VALUES tuple of a multi-row insert.
#[derive(Debug, Clone)]
pub struct InsertRow {
    /// Evaluates to the row's sharding column value.
    pub routing_value: Expr,
    /// Tuple text, e.g. `(:v1, :v2)`.
    pub tuple: String,
}

impl InsertRow {
    pub fn new(routing_value: Expr, tuple: impl Into<String>) -> Self {
        Self {
            routing_value,
            tuple: tuple.into(),
        }
    }
}

/// Multi-row insert split by destination partition: rows landing in the
/// same actual table on the same shard share one statement, and each shard
/// receives its statements as a batch.
#[derive(Debug, Clone)]
pub struct TableInsert {
    pub keyspace: String,
    pub table: Arc<LogicTable>,
    /// `insert into t (a, b) values `
    pub prefix: String,
    pub rows: Vec<InsertRow>,
    /// Trailing clause such as `on duplicate key update ...`.
    pub suffix: String,
}

impl TableInsert {
    pub fn new(
        keyspace: impl Into<String>,
        table: Arc<LogicTable>,
        prefix: impl Into<String>,
        rows: Vec<InsertRow>,
    ) -> Self {
        Self {
            keyspace: keyspace.into(),
            table,
            prefix: prefix.into(),
            rows,
            suffix: String::new(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    fn shard_for(&self, vc: &dyn VCursor, dest: Destination) -> SluiceResult<ShardTarget> {
        let described = dest.to_string();
        let mut targets = vc
            .resolve_destinations(&self.keyspace, &[dest])?
            .pop()
            .unwrap_or_default();
        if targets.len() != 1 {
            return Err(SluiceError::Routing(format!(
                "insert row for logic table {} must reach exactly one shard, {} resolved to {}",
                self.table.name,
                described,
                targets.len()
            )));
        }
        Ok(targets.remove(0))
    }
}

impl PrimitiveOps for TableInsert {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        if self.rows.is_empty() {
            return Err(SluiceError::Routing(format!(
                "insert into logic table {} has no rows",
                self.table.name
            )));
        }
        let hint = vc.shard_hint().filter(|h| h.keyspace == self.keyspace);

        // (shard, actual table) → tuples, first-seen order.
        let mut groups: Vec<(ShardTarget, String, Vec<&str>)> = Vec::new();
        for row in &self.rows {
            let value = row.routing_value.eval_const(bind_vars)?;
            let actual = self.table.map(&value)?;
            let dest = match &hint {
                Some(h) => Destination::Shard(h.shard.clone()),
                None => Destination::Value(value.clone()),
            };
            let target = self.shard_for(vc, dest)?;
            match groups
                .iter_mut()
                .find(|(t, name, _)| *t == target && *name == actual.name)
            {
                Some((_, _, tuples)) => tuples.push(&row.tuple),
                None => groups.push((target, actual.name.clone(), vec![&row.tuple])),
            }
        }

        let mut queries: Vec<ResolvedShardQuery> = Vec::new();
        for (target, actual, tuples) in groups {
            let mapping: TableMapping = BTreeMap::from([(self.table.name.clone(), actual)]);
            let sql = format!(
                "{}{}{}",
                bind_query_tables(&self.prefix, &mapping),
                tuples.join(", "),
                bind_query_tables(&self.suffix, &mapping)
            );
            let query = BoundQuery::new(sql, bind_vars.clone());
            match queries.iter_mut().find(|r| r.target == target) {
                Some(r) => r.queries.push(query),
                None => queries.push(ResolvedShardQuery::single(target, query)),
            }
        }
        tracing::debug!(
            keyspace = %self.keyspace,
            table = %self.table.name,
            rows = self.rows.len(),
            shards = queries.len(),
            "insert split by partition"
        );
        let can_autocommit = queries.len() == 1 && queries[0].queries.len() == 1;
        vc.execute_batch_multi_shard(queries, true, can_autocommit)
    }

    fn get_fields(&self, _vc: &dyn VCursor, _bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        Ok(Vec::new())
    }

    fn needs_transaction(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        format!(
            "TableInsert ks={} table={} rows={}",
            self.keyspace,
            self.table.name,
            self.rows.len()
        )
    }

    fn inputs(&self) -> Vec<&Primitive> {
        Vec::new()
    }
}
