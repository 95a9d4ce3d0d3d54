//! The seam to the SQL planner, which lives outside the router core.

use sluice_common::error::SluiceResult;
use sluice_common::types::{BindVars, StatementKind, TabletType};
use sluice_engine::{Primitive, ShardHint};

/// Everything the planner sees for one cache miss.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    /// Normalized statement text, literals already lifted into bind
    /// variables.
    pub sql: &'a str,
    pub kind: StatementKind,
    pub keyspace: &'a str,
    pub tablet_type: TabletType,
    pub shard_hint: Option<&'a ShardHint>,
    pub bind_vars: &'a BindVars,
}

/// Compiles a statement into a primitive tree. Called only when the plan
/// cache misses or is bypassed.
pub trait Planner: Send + Sync {
    fn plan(&self, req: &PlanRequest<'_>) -> SluiceResult<(StatementKind, Primitive)>;
}

impl<F> Planner for F
where
    F: Fn(&PlanRequest<'_>) -> SluiceResult<(StatementKind, Primitive)> + Send + Sync,
{
    fn plan(&self, req: &PlanRequest<'_>) -> SluiceResult<(StatementKind, Primitive)> {
        self(req)
    }
}
