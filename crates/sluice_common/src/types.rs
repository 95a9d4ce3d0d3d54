use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::datum::Datum;

/// Role of the replica a statement is allowed to hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabletType {
    /// Writable primary.
    #[default]
    Primary,
    /// Serving read replica.
    Replica,
    /// Read-only replica for batch/analytics traffic.
    Rdonly,
}

impl TabletType {
    pub fn is_primary(&self) -> bool {
        matches!(self, TabletType::Primary)
    }
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TabletType::Primary => write!(f, "primary"),
            TabletType::Replica => write!(f, "replica"),
            TabletType::Rdonly => write!(f, "rdonly"),
        }
    }
}

/// One physical destination: a shard of a keyspace served by a replica role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardTarget {
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
}

impl ShardTarget {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>, tablet_type: TabletType) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
            tablet_type,
        }
    }
}

impl fmt::Display for ShardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.keyspace, self.shard, self.tablet_type)
    }
}

/// Shard-local transaction handle returned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub i64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Kind of a top-level statement, derived from its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementKind {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Begin,
    Commit,
    Rollback,
    Set,
    Show,
    Ddl,
    Other,
}

impl StatementKind {
    /// Classify a statement by its first keyword, skipping leading comments.
    pub fn from_sql(sql: &str) -> Self {
        let keyword = first_keyword(sql).to_ascii_lowercase();
        match keyword.as_str() {
            "select" | "with" | "(" => StatementKind::Select,
            "insert" => StatementKind::Insert,
            "replace" => StatementKind::Replace,
            "update" => StatementKind::Update,
            "delete" => StatementKind::Delete,
            "begin" | "start" => StatementKind::Begin,
            "commit" => StatementKind::Commit,
            "rollback" => StatementKind::Rollback,
            "set" => StatementKind::Set,
            "show" | "describe" | "desc" | "explain" => StatementKind::Show,
            "create" | "alter" | "drop" | "rename" | "truncate" => StatementKind::Ddl,
            _ => StatementKind::Other,
        }
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            StatementKind::Insert | StatementKind::Replace | StatementKind::Update | StatementKind::Delete
        )
    }

    pub fn is_txn_control(&self) -> bool {
        matches!(
            self,
            StatementKind::Begin | StatementKind::Commit | StatementKind::Rollback
        )
    }

    /// Statements whose text can be parameterized and whose plans may be reused.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            StatementKind::Select | StatementKind::Insert | StatementKind::Replace
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Replace => "REPLACE",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Begin => "BEGIN",
            StatementKind::Commit => "COMMIT",
            StatementKind::Rollback => "ROLLBACK",
            StatementKind::Set => "SET",
            StatementKind::Show => "SHOW",
            StatementKind::Ddl => "DDL",
            StatementKind::Other => "OTHER",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn first_keyword(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("/*") {
            match after.find("*/") {
                Some(end) => rest = after[end + 2..].trim_start(),
                None => return "",
            }
        } else if rest.starts_with("--") || rest.starts_with('#') {
            match rest.find('\n') {
                Some(end) => rest = rest[end + 1..].trim_start(),
                None => return "",
            }
        } else {
            break;
        }
    }
    if rest.starts_with('(') {
        return "(";
    }
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    &rest[..end]
}

/// A bind variable value: a scalar, or a list for `IN ::name` expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BindValue {
    Scalar(Datum),
    List(Vec<Datum>),
}

impl BindValue {
    pub fn as_scalar(&self) -> Option<&Datum> {
        match self {
            BindValue::Scalar(d) => Some(d),
            BindValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Datum]> {
        match self {
            BindValue::List(v) => Some(v),
            BindValue::Scalar(_) => None,
        }
    }
}

impl From<Datum> for BindValue {
    fn from(d: Datum) -> Self {
        BindValue::Scalar(d)
    }
}

/// Named bind variables. Ordered so rendering and cache keys are deterministic.
pub type BindVars = BTreeMap<String, BindValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_kind_from_sql() {
        assert_eq!(StatementKind::from_sql("  SELECT 1"), StatementKind::Select);
        assert_eq!(
            StatementKind::from_sql("/* hint */ insert into t values (1)"),
            StatementKind::Insert
        );
        assert_eq!(StatementKind::from_sql("-- c\nUPDATE t SET a=1"), StatementKind::Update);
        assert_eq!(StatementKind::from_sql("start transaction"), StatementKind::Begin);
        assert_eq!(StatementKind::from_sql("COMMIT"), StatementKind::Commit);
        assert_eq!(StatementKind::from_sql("create table t (a int)"), StatementKind::Ddl);
        assert_eq!(StatementKind::from_sql("(select 1) union (select 2)"), StatementKind::Select);
        assert_eq!(StatementKind::from_sql(""), StatementKind::Other);
    }

    #[test]
    fn test_cacheable_kinds() {
        assert!(StatementKind::Select.is_cacheable());
        assert!(StatementKind::Replace.is_cacheable());
        assert!(!StatementKind::Update.is_cacheable());
        assert!(!StatementKind::Begin.is_cacheable());
        assert!(!StatementKind::Ddl.is_cacheable());
        assert!(!StatementKind::Set.is_cacheable());
    }

    #[test]
    fn test_targets_sort_by_keyspace_shard_then_role() {
        let mut targets = vec![
            ShardTarget::new("user", "80-", TabletType::Primary),
            ShardTarget::new("user", "-80", TabletType::Replica),
            ShardTarget::new("user", "-80", TabletType::Primary),
        ];
        targets.sort();
        assert_eq!(targets[0], ShardTarget::new("user", "-80", TabletType::Primary));
        assert_eq!(targets[1].tablet_type, TabletType::Replica);
        assert_eq!(targets[2].shard, "80-");
        assert!(TabletType::Primary < TabletType::Rdonly);
    }

    #[test]
    fn test_target_display() {
        let t = ShardTarget::new("user", "-80", TabletType::Replica);
        assert_eq!(t.to_string(), "user/-80@replica");
    }
}
