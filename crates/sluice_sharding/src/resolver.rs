//! Keyspace shard map: routing values are hashed with xxHash3 into a 64-bit
//! keyspace id, and each shard owns a contiguous `[start, end)` range of ids.
//! Shard names follow the hex range convention (`-80`, `80-`).

use std::collections::HashMap;

use sluice_common::datum::Datum;
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::{ShardTarget, TabletType};

use crate::destination::{Destination, DestinationResolver};
use crate::function::hash_datum;

/// One shard and the keyspace-id range it owns. Bounds are u128 so the last
/// shard's exclusive end (2^64) is representable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRange {
    pub name: String,
    pub start: u128,
    pub end: u128,
}

impl ShardRange {
    fn contains(&self, keyspace_id: u64) -> bool {
        let k = keyspace_id as u128;
        k >= self.start && k < self.end
    }
}

#[derive(Debug, Clone)]
pub struct KeyspaceLayout {
    pub name: String,
    pub sharded: bool,
    pub shards: Vec<ShardRange>,
}

const KEYSPACE_ID_SPACE: u128 = 1u128 << 64;

impl KeyspaceLayout {
    /// Single-shard keyspace named `0`.
    pub fn unsharded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sharded: false,
            shards: vec![ShardRange {
                name: "0".into(),
                start: 0,
                end: KEYSPACE_ID_SPACE,
            }],
        }
    }

    /// `num_shards` uniform hash ranges.
    pub fn uniform(name: impl Into<String>, num_shards: usize) -> Self {
        let n = num_shards.max(1) as u128;
        let shards = (0..n)
            .map(|i| {
                let start = i * KEYSPACE_ID_SPACE / n;
                let end = (i + 1) * KEYSPACE_ID_SPACE / n;
                ShardRange {
                    name: format!("{}-{}", range_bound_name(start), range_bound_name(end)),
                    start,
                    end,
                }
            })
            .collect();
        Self {
            name: name.into(),
            sharded: true,
            shards,
        }
    }

    pub fn shard_for_keyspace_id(&self, keyspace_id: u64) -> Option<&ShardRange> {
        self.shards.iter().find(|s| s.contains(keyspace_id))
    }

    fn shard_for_value(&self, value: &Datum) -> Option<&ShardRange> {
        if value.is_null() {
            return None;
        }
        if !self.sharded {
            return self.shards.first();
        }
        self.shard_for_keyspace_id(hash_datum(value))
    }
}

/// Hex name of a range bound: `0` and `2^64` are empty, otherwise the
/// big-endian hex with trailing zero bytes dropped (`0x80 << 56` → `80`).
fn range_bound_name(bound: u128) -> String {
    if bound == 0 || bound >= KEYSPACE_ID_SPACE {
        return String::new();
    }
    let hex = format!("{:016x}", bound as u64);
    let mut trimmed = hex.trim_end_matches('0').to_string();
    if trimmed.len() % 2 == 1 {
        trimmed.push('0');
    }
    trimmed
}

/// In-memory `DestinationResolver` over a fixed set of keyspaces.
#[derive(Debug, Clone, Default)]
pub struct HashShardResolver {
    keyspaces: HashMap<String, KeyspaceLayout>,
}

impl HashShardResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keyspace(mut self, layout: KeyspaceLayout) -> Self {
        self.add_keyspace(layout);
        self
    }

    pub fn add_keyspace(&mut self, layout: KeyspaceLayout) {
        tracing::debug!(
            keyspace = %layout.name,
            shards = layout.shards.len(),
            sharded = layout.sharded,
            "registered keyspace"
        );
        self.keyspaces.insert(layout.name.clone(), layout);
    }

    pub fn keyspace(&self, name: &str) -> Option<&KeyspaceLayout> {
        self.keyspaces.get(name)
    }

    fn layout(&self, keyspace: &str) -> SluiceResult<&KeyspaceLayout> {
        self.keyspaces
            .get(keyspace)
            .ok_or_else(|| SluiceError::Routing(format!("keyspace {keyspace} not found")))
    }
}

impl DestinationResolver for HashShardResolver {
    fn resolve(
        &self,
        keyspace: &str,
        tablet_type: TabletType,
        destinations: &[Destination],
    ) -> SluiceResult<Vec<Vec<ShardTarget>>> {
        let layout = self.layout(keyspace)?;
        let target = |s: &ShardRange| ShardTarget::new(keyspace, s.name.clone(), tablet_type);

        destinations
            .iter()
            .map(|dest| {
                let mut picked: Vec<&ShardRange> = Vec::new();
                match dest {
                    Destination::Value(v) => picked.extend(layout.shard_for_value(v)),
                    Destination::Values(vs) => {
                        for v in vs {
                            if let Some(s) = layout.shard_for_value(v) {
                                if !picked.iter().any(|p| p.name == s.name) {
                                    picked.push(s);
                                }
                            }
                        }
                        // keyspace order
                        picked.sort_by_key(|s| s.start);
                    }
                    Destination::Shard(name) => {
                        let s = layout.shards.iter().find(|s| &s.name == name).ok_or_else(|| {
                            SluiceError::Routing(format!(
                                "shard {name} not found in keyspace {keyspace}"
                            ))
                        })?;
                        picked.push(s);
                    }
                    Destination::AllShards => picked.extend(layout.shards.iter()),
                    Destination::AnyShard => picked.extend(layout.shards.first()),
                    Destination::None => {}
                }
                Ok(picked.into_iter().map(&target).collect())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> HashShardResolver {
        HashShardResolver::new()
            .with_keyspace(KeyspaceLayout::uniform("user", 4))
            .with_keyspace(KeyspaceLayout::unsharded("main"))
    }

    #[test]
    fn test_uniform_shard_names() {
        let ks = KeyspaceLayout::uniform("user", 2);
        let names: Vec<&str> = ks.shards.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["-80", "80-"]);
        let ks = KeyspaceLayout::uniform("user", 4);
        let names: Vec<&str> = ks.shards.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["-40", "40-80", "80-c0", "c0-"]);
    }

    #[test]
    fn test_every_keyspace_id_has_a_shard() {
        let ks = KeyspaceLayout::uniform("user", 3);
        for id in [0u64, 1, u64::MAX / 3, u64::MAX / 2, u64::MAX - 1, u64::MAX] {
            assert!(ks.shard_for_keyspace_id(id).is_some(), "id {id}");
        }
    }

    #[test]
    fn test_value_routes_to_one_shard() {
        let r = resolver();
        let out = r
            .resolve("user", TabletType::Primary, &[Destination::Value(Datum::Int64(42))])
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 1);
        // deterministic
        let again = r
            .resolve("user", TabletType::Primary, &[Destination::Value(Datum::UInt64(42))])
            .unwrap();
        assert_eq!(out, again);
    }

    #[test]
    fn test_values_dedup_and_keyspace_order() {
        let r = resolver();
        let vals: Vec<Datum> = (0..64).map(Datum::Int64).collect();
        let out = r
            .resolve("user", TabletType::Replica, &[Destination::Values(vals)])
            .unwrap();
        let shards: Vec<&str> = out[0].iter().map(|t| t.shard.as_str()).collect();
        assert_eq!(shards, vec!["-40", "40-80", "80-c0", "c0-"]);
        assert!(out[0].iter().all(|t| t.tablet_type == TabletType::Replica));
    }

    #[test]
    fn test_null_value_resolves_nowhere() {
        let r = resolver();
        let out = r
            .resolve("user", TabletType::Primary, &[Destination::Value(Datum::Null)])
            .unwrap();
        assert!(out[0].is_empty());
    }

    #[test]
    fn test_unknown_keyspace_and_shard() {
        let r = resolver();
        assert!(r
            .resolve("nope", TabletType::Primary, &[Destination::AllShards])
            .is_err());
        let err = r
            .resolve("user", TabletType::Primary, &[Destination::Shard("zz".into())])
            .unwrap_err();
        assert!(err.to_string().contains("shard zz not found"));
    }

    #[test]
    fn test_unsharded_keyspace() {
        let r = resolver();
        let all = r.all_shards("main", TabletType::Primary).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].shard, "0");
        let out = r
            .resolve("main", TabletType::Primary, &[Destination::Value(Datum::Int64(9))])
            .unwrap();
        assert_eq!(out[0][0].shard, "0");
    }
}
