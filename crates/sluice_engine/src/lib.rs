//! Physical plan execution for the sluice router.
//!
//! A plan is a tree of [`Primitive`]s. Executing it walks the tree
//! post-order against a [`VCursor`], the per-statement handle that resolves
//! routing values to shards and dispatches bound statements to them.

pub mod bind;
pub mod expr;
pub mod primitive;
pub mod vcursor;

#[cfg(test)]
mod testing;

pub use bind::{bind_query_tables, render_bind_vars, BoundQuery};
pub use expr::{CmpOp, Expr};
pub use primitive::{
    AggregateOpcode, AggregateParams, CheckCol, Collation, Concatenate, Distinct, Filter,
    GroupByParam, InsertRow, Join, JoinOpcode, Limit, OrderByParam, OrderedAggregate,
    Passthrough, Primitive, PrimitiveOps, Route, RouteOpcode, ScalarAggregate, StreamCallback,
    TableDelete, TableInsert, TableQueryMultiplexer, TableRoute, TableRouteOpcode, TableRouting,
    TableUpdate,
};
pub use sluice_sharding::{Destination, DestinationResolver};
pub use vcursor::{ResolvedShardQuery, RowStream, ShardHint, VCursor};
