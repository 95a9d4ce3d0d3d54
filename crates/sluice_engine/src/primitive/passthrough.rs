use sluice_common::datum::{Field, QueryResult};
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::BindVars;
use sluice_sharding::Destination;

use super::{Primitive, PrimitiveOps};
use crate::bind::BoundQuery;
use crate::vcursor::{ResolvedShardQuery, VCursor};

/// Sends a statement verbatim to an explicit destination: SET, SHOW, DDL
/// and other statements the router does not decompose.
#[derive(Debug, Clone)]
pub struct Passthrough {
    pub keyspace: String,
    pub destination: Destination,
    pub query: String,
    /// The statement writes, so it must run inside a transaction bracket.
    pub is_dml: bool,
    /// Only one shard may be hit; more than one is an error.
    pub single_shard_only: bool,
}

impl Passthrough {
    pub fn new(keyspace: impl Into<String>, destination: Destination, query: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            destination,
            query: query.into(),
            is_dml: false,
            single_shard_only: false,
        }
    }

    pub fn dml(mut self) -> Self {
        self.is_dml = true;
        self
    }
}

impl PrimitiveOps for Passthrough {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        let targets = vc
            .resolve_destinations(&self.keyspace, std::slice::from_ref(&self.destination))?
            .pop()
            .unwrap_or_default();
        if targets.is_empty() {
            return Err(SluiceError::Routing(format!(
                "destination {} in keyspace {} resolved to no shards",
                self.destination, self.keyspace
            )));
        }
        if self.single_shard_only && targets.len() > 1 {
            return Err(SluiceError::Unsupported(format!(
                "statement must target a single shard, destination {} resolved to {}",
                self.destination,
                targets.len()
            )));
        }
        let can_autocommit = self.is_dml && targets.len() == 1;
        let queries = targets
            .into_iter()
            .map(|t| ResolvedShardQuery::single(t, BoundQuery::new(&self.query, bind_vars.clone())))
            .collect();
        vc.execute_multi_shard(queries, self.is_dml, can_autocommit)
    }

    fn get_fields(&self, _vc: &dyn VCursor, _bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        Err(SluiceError::Unsupported(
            "field metadata is not available for passthrough statements".into(),
        ))
    }

    fn needs_transaction(&self) -> bool {
        self.is_dml
    }

    fn description(&self) -> String {
        format!(
            "Passthrough ks={} destination={}{}",
            self.keyspace,
            self.destination,
            if self.is_dml { " dml" } else { "" }
        )
    }

    fn inputs(&self) -> Vec<&Primitive> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCursor;

    #[test]
    fn test_passthrough_all_shards() {
        let vc = FakeCursor::new(|_, _| Ok(QueryResult::affected(0, 0)));
        let p = Passthrough::new("user", Destination::AllShards, "alter table t add c int");
        p.execute(&vc, &BindVars::new()).unwrap();
        assert_eq!(vc.calls().len(), 2);
        assert!(!p.needs_transaction());
    }

    #[test]
    fn test_single_shard_only() {
        let vc = FakeCursor::new(|_, _| Ok(QueryResult::default()));
        let mut p = Passthrough::new("user", Destination::AllShards, "show tables");
        p.single_shard_only = true;
        assert!(matches!(
            p.execute(&vc, &BindVars::new()),
            Err(SluiceError::Unsupported(_))
        ));
    }

    #[test]
    fn test_dml_needs_transaction() {
        let p = Passthrough::new("main", Destination::AnyShard, "delete from t").dml();
        assert!(p.needs_transaction());
        let vc = FakeCursor::new(|_, _| Ok(QueryResult::affected(3, 0)));
        assert_eq!(p.execute(&vc, &BindVars::new()).unwrap().rows_affected, 3);
        assert_eq!(*vc.last_autocommit.lock(), Some(true));
    }
}
