//! The physical plan: a closed tree of execution primitives.
//!
//! Every variant implements the full `PrimitiveOps` capability set, so
//! callers never inspect which kind of node they hold. Trees are immutable
//! once built and are shared read-only across concurrent executions.

mod aggregate;
mod concatenate;
mod distinct;
mod filter;
mod join;
mod limit;
mod multiplexer;
mod passthrough;
mod route;
mod table_dml;
mod table_route;

pub use aggregate::{AggregateOpcode, AggregateParams, GroupByParam, OrderedAggregate, ScalarAggregate};
pub use concatenate::Concatenate;
pub use distinct::{CheckCol, Collation, Distinct};
pub use filter::Filter;
pub use join::{Join, JoinOpcode};
pub use limit::{Limit, UPPER_LIMIT_VAR};
pub use multiplexer::TableQueryMultiplexer;
pub use passthrough::Passthrough;
pub use route::{OrderByParam, Route, RouteOpcode, LIST_VAR};
pub use table_dml::{InsertRow, TableDelete, TableInsert, TableUpdate};
pub use table_route::{TableRoute, TableRouteOpcode, TableRouting};

use std::fmt::Write as _;

use sluice_common::datum::{Field, QueryResult};
use sluice_common::error::SluiceResult;
use sluice_common::types::BindVars;

use crate::vcursor::VCursor;

/// Receives streamed row batches. Returning an error aborts the stream.
pub type StreamCallback<'a> = dyn FnMut(QueryResult) -> SluiceResult<()> + 'a;

/// Capability set every primitive provides.
pub trait PrimitiveOps {
    /// Run to completion and return the full result.
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult>;

    /// Deliver the result in batches. Defaults to one batch holding the
    /// executed result.
    fn stream_execute(
        &self,
        vc: &dyn VCursor,
        bind_vars: &BindVars,
        callback: &mut StreamCallback<'_>,
    ) -> SluiceResult<()> {
        let result = self.execute(vc, bind_vars)?;
        callback(result)
    }

    /// Output column metadata, without fetching rows where possible.
    fn get_fields(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<Vec<Field>>;

    /// Whether executing this subtree writes data.
    fn needs_transaction(&self) -> bool;

    /// One-line description of this node alone.
    fn description(&self) -> String;

    fn inputs(&self) -> Vec<&Primitive> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
pub enum Primitive {
    Route(Route),
    Passthrough(Passthrough),
    Join(Join),
    Filter(Filter),
    Limit(Limit),
    OrderedAggregate(OrderedAggregate),
    ScalarAggregate(ScalarAggregate),
    Distinct(Distinct),
    Concatenate(Concatenate),
    TableRoute(TableRoute),
    TableInsert(TableInsert),
    TableUpdate(TableUpdate),
    TableDelete(TableDelete),
    TableQueryMultiplexer(TableQueryMultiplexer),
}

macro_rules! dispatch {
    ($self:expr, $p:ident => $body:expr) => {
        match $self {
            Primitive::Route($p) => $body,
            Primitive::Passthrough($p) => $body,
            Primitive::Join($p) => $body,
            Primitive::Filter($p) => $body,
            Primitive::Limit($p) => $body,
            Primitive::OrderedAggregate($p) => $body,
            Primitive::ScalarAggregate($p) => $body,
            Primitive::Distinct($p) => $body,
            Primitive::Concatenate($p) => $body,
            Primitive::TableRoute($p) => $body,
            Primitive::TableInsert($p) => $body,
            Primitive::TableUpdate($p) => $body,
            Primitive::TableDelete($p) => $body,
            Primitive::TableQueryMultiplexer($p) => $body,
        }
    };
}

impl PrimitiveOps for Primitive {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        vc.check_cancelled()?;
        dispatch!(self, p => p.execute(vc, bind_vars))
    }

    fn stream_execute(
        &self,
        vc: &dyn VCursor,
        bind_vars: &BindVars,
        callback: &mut StreamCallback<'_>,
    ) -> SluiceResult<()> {
        vc.check_cancelled()?;
        dispatch!(self, p => p.stream_execute(vc, bind_vars, callback))
    }

    fn get_fields(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        dispatch!(self, p => p.get_fields(vc, bind_vars))
    }

    fn needs_transaction(&self) -> bool {
        dispatch!(self, p => p.needs_transaction())
    }

    fn description(&self) -> String {
        dispatch!(self, p => p.description())
    }

    fn inputs(&self) -> Vec<&Primitive> {
        dispatch!(self, p => p.inputs())
    }
}

impl Primitive {
    /// EXPLAIN-style rendering of the whole tree, children indented.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(&mut out, 0);
        out
    }

    fn describe_into(&self, out: &mut String, depth: usize) {
        let _ = writeln!(out, "{}{}", "  ".repeat(depth), self.description());
        for child in self.inputs() {
            child.describe_into(out, depth + 1);
        }
    }

    /// Kind name, for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Primitive::Route(_) => "Route",
            Primitive::Passthrough(_) => "Passthrough",
            Primitive::Join(_) => "Join",
            Primitive::Filter(_) => "Filter",
            Primitive::Limit(_) => "Limit",
            Primitive::OrderedAggregate(_) => "OrderedAggregate",
            Primitive::ScalarAggregate(_) => "ScalarAggregate",
            Primitive::Distinct(_) => "Distinct",
            Primitive::Concatenate(_) => "Concatenate",
            Primitive::TableRoute(_) => "TableRoute",
            Primitive::TableInsert(_) => "TableInsert",
            Primitive::TableUpdate(_) => "TableUpdate",
            Primitive::TableDelete(_) => "TableDelete",
            Primitive::TableQueryMultiplexer(_) => "TableQueryMultiplexer",
        }
    }
}

macro_rules! impl_from {
    ($($variant:ident),*) => {
        $(impl From<$variant> for Primitive {
            fn from(p: $variant) -> Self {
                Primitive::$variant(p)
            }
        })*
    };
}

impl_from!(
    Route,
    Passthrough,
    Join,
    Filter,
    Limit,
    OrderedAggregate,
    ScalarAggregate,
    Distinct,
    Concatenate,
    TableRoute,
    TableInsert,
    TableUpdate,
    TableDelete,
    TableQueryMultiplexer
);
