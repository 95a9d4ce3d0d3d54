//! Table-level sharding: a logic table is split into an ordered list of
//! actual (physical) tables, and a statement touching several logic tables
//! resolves each one to a partition.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sluice_common::datum::Datum;
use sluice_common::error::{SluiceError, SluiceResult};

use crate::function::ShardingFunction;

/// One physical partition of a logic table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActualTable {
    pub name: String,
    pub index: usize,
    /// Name of the owning logic table.
    pub logic_table: String,
}

impl fmt::Display for ActualTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicTable {
    pub name: String,
    /// Column whose value picks the partition.
    pub sharding_column: String,
    pub function: ShardingFunction,
    pub actual_tables: Vec<ActualTable>,
}

impl LogicTable {
    pub fn new(
        name: impl Into<String>,
        sharding_column: impl Into<String>,
        function: ShardingFunction,
        actual_names: Vec<String>,
    ) -> Self {
        let name = name.into();
        let actual_tables = actual_names
            .into_iter()
            .enumerate()
            .map(|(index, n)| ActualTable {
                name: n,
                index,
                logic_table: name.clone(),
            })
            .collect();
        Self {
            name,
            sharding_column: sharding_column.into(),
            function,
            actual_tables,
        }
    }

    /// `count` partitions named `{name}_0 .. {name}_{count-1}`.
    pub fn with_partitions(
        name: impl Into<String>,
        sharding_column: impl Into<String>,
        function: ShardingFunction,
        count: usize,
    ) -> Self {
        let name = name.into();
        let names = (0..count).map(|i| format!("{name}_{i}")).collect();
        Self::new(name, sharding_column, function, names)
    }

    pub fn partition_count(&self) -> usize {
        self.actual_tables.len()
    }

    /// Resolve `value` to its partition.
    pub fn map(&self, value: &Datum) -> SluiceResult<&ActualTable> {
        let n = self.actual_tables.len();
        let idx = self
            .function
            .partition_index(value, n)
            .ok_or_else(|| {
                SluiceError::Routing(format!(
                    "cannot resolve routing value for logic table {}: {}",
                    self.name,
                    value.to_sql_literal()
                ))
            })?;
        self.actual_tables.get(idx).ok_or_else(|| {
            SluiceError::internal_bug(
                "E-SHARD-001",
                format!(
                    "{} sharding function for logic table {} returned partition {} of {}",
                    self.function.name(),
                    self.name,
                    idx,
                    n
                ),
                format!("value={}", value.to_sql_literal()),
            )
        })
    }
}

/// Logical → physical table name substitution for one unit of work.
pub type TableMapping = BTreeMap<String, String>;

/// One IN-clause work group: the tables every value in `values` resolves
/// to, and those values in their original relative order.
#[derive(Debug, Clone, PartialEq)]
pub struct InGroup {
    pub tables: TableMapping,
    pub values: Vec<Datum>,
}

/// Resolves routing values across every logic table a statement touches.
/// All tables are keyed by the same routing value.
#[derive(Debug, Clone, Default)]
pub struct TableShardingIndex {
    tables: Vec<Arc<LogicTable>>,
}

impl TableShardingIndex {
    pub fn new(tables: Vec<Arc<LogicTable>>) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &[Arc<LogicTable>] {
        &self.tables
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Partition index tuple for `value`, one entry per logic table.
    fn partition_tuple(&self, value: &Datum) -> SluiceResult<Vec<usize>> {
        self.tables
            .iter()
            .map(|t| t.map(value).map(|a| a.index))
            .collect()
    }

    fn mapping_for(&self, tuple: &[usize]) -> TableMapping {
        self.tables
            .iter()
            .zip(tuple)
            .map(|(t, &i)| (t.name.clone(), t.actual_tables[i].name.clone()))
            .collect()
    }

    /// Physical tables for a single routing value.
    pub fn map(&self, value: &Datum) -> SluiceResult<TableMapping> {
        let tuple = self.partition_tuple(value)?;
        Ok(self.mapping_for(&tuple))
    }

    /// Group `values` by the combination of partitions they resolve to.
    /// Groups appear in first-seen order, values keep their relative order.
    pub fn resolve_in(&self, values: &[Datum]) -> SluiceResult<Vec<InGroup>> {
        let mut positions: HashMap<Vec<usize>, usize> = HashMap::new();
        let mut groups: Vec<InGroup> = Vec::new();
        for value in values {
            let tuple = self.partition_tuple(value)?;
            match positions.get(&tuple) {
                Some(&pos) => groups[pos].values.push(value.clone()),
                None => {
                    positions.insert(tuple.clone(), groups.len());
                    groups.push(InGroup {
                        tables: self.mapping_for(&tuple),
                        values: vec![value.clone()],
                    });
                }
            }
        }
        Ok(groups)
    }

    /// Cartesian product of every logic table's partitions, first table
    /// outermost.
    pub fn resolve_all_partitions(&self) -> Vec<TableMapping> {
        let mut combos: Vec<TableMapping> = vec![TableMapping::new()];
        for table in &self.tables {
            let mut next = Vec::with_capacity(combos.len() * table.actual_tables.len());
            for combo in &combos {
                for actual in &table.actual_tables {
                    let mut m = combo.clone();
                    m.insert(table.name.clone(), actual.name.clone());
                    next.push(m);
                }
            }
            combos = next;
        }
        combos
    }
}
