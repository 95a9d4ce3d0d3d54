//! Sharding functions: value → partition index.
//!
//! Hash sharding encodes the value with the same deterministic key encoding
//! used for grouping and hashes it with xxHash3, so `Int64(7)` and
//! `UInt64(7)` always land on the same partition.

use serde::{Deserialize, Serialize};
use sluice_common::datum::{encode_datum_key, normalize_decimal, Datum};
use xxhash_rust::xxh3::xxh3_64;

/// 64-bit routing hash of a single value.
pub fn hash_datum(datum: &Datum) -> u64 {
    let mut buf = Vec::with_capacity(24);
    encode_datum_key(&mut buf, datum);
    xxh3_64(&buf)
}

/// Maps a column value to a partition index of a logic table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardingFunction {
    /// `xxh3(value) % partitions`.
    Hash,
    /// Integer value modulo the partition count (Euclidean, never negative).
    Modulo,
    /// Ascending exclusive upper bounds; partition `i` holds
    /// `bounds[i-1] <= v < bounds[i]`, the last partition everything above.
    Range { bounds: Vec<i64> },
}

impl ShardingFunction {
    /// Raw partition index for `value`. `None` when the value is outside the
    /// function's domain (NULL, or a non-integer for Modulo/Range). The index
    /// is not checked against `partitions`; callers treat an out-of-range
    /// index as a configuration bug.
    pub fn partition_index(&self, value: &Datum, partitions: usize) -> Option<usize> {
        if value.is_null() || partitions == 0 {
            return None;
        }
        match self {
            ShardingFunction::Hash => Some((hash_datum(value) % partitions as u64) as usize),
            ShardingFunction::Modulo => {
                let v = integral_value(value)?;
                Some(v.rem_euclid(partitions as i128) as usize)
            }
            ShardingFunction::Range { bounds } => {
                let v = integral_value(value)?;
                Some(bounds.iter().take_while(|b| (**b as i128) <= v).count())
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShardingFunction::Hash => "hash",
            ShardingFunction::Modulo => "modulo",
            ShardingFunction::Range { .. } => "range",
        }
    }
}

fn integral_value(value: &Datum) -> Option<i128> {
    match value {
        Datum::Int64(v) => Some(*v as i128),
        Datum::UInt64(v) => Some(*v as i128),
        Datum::Timestamp(v) => Some(*v as i128),
        Datum::Float64(f) if f.fract() == 0.0 => Some(*f as i128),
        Datum::Decimal(m, s) => {
            let (m, s) = normalize_decimal(*m, *s);
            (s == 0).then_some(m)
        }
        Datum::Text(s) => s.trim().parse::<i128>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_across_int_kinds() {
        assert_eq!(hash_datum(&Datum::Int64(7)), hash_datum(&Datum::UInt64(7)));
        let f = ShardingFunction::Hash;
        assert_eq!(
            f.partition_index(&Datum::Int64(7), 8),
            f.partition_index(&Datum::UInt64(7), 8)
        );
    }

    #[test]
    fn test_modulo_negative_values() {
        let f = ShardingFunction::Modulo;
        assert_eq!(f.partition_index(&Datum::Int64(5), 2), Some(1));
        assert_eq!(f.partition_index(&Datum::Int64(-1), 4), Some(3));
        assert_eq!(f.partition_index(&Datum::Text("12".into()), 5), Some(2));
        assert_eq!(f.partition_index(&Datum::Text("abc".into()), 5), None);
    }

    #[test]
    fn test_range_bounds() {
        let f = ShardingFunction::Range {
            bounds: vec![100, 200],
        };
        assert_eq!(f.partition_index(&Datum::Int64(5), 3), Some(0));
        assert_eq!(f.partition_index(&Datum::Int64(100), 3), Some(1));
        assert_eq!(f.partition_index(&Datum::Int64(250), 3), Some(2));
    }

    #[test]
    fn test_decimal_routing_is_scale_independent() {
        let f = ShardingFunction::Hash;
        assert_eq!(
            f.partition_index(&Datum::Decimal(5, 1), 8),
            f.partition_index(&Datum::Decimal(50, 2), 8)
        );
        assert_eq!(
            ShardingFunction::Modulo.partition_index(&Datum::Decimal(700, 2), 4),
            Some(3)
        );
        assert!(ShardingFunction::Hash
            .partition_index(&Datum::Decimal(1, 41), 4)
            .is_some());
        assert_eq!(ShardingFunction::Modulo.partition_index(&Datum::Decimal(1, 41), 4), None);
    }

    #[test]
    fn test_null_has_no_partition() {
        assert_eq!(ShardingFunction::Hash.partition_index(&Datum::Null, 4), None);
    }

    #[test]
    fn test_function_serde_tagged() {
        let f: ShardingFunction =
            serde_json::from_str(r#"{"kind":"range","bounds":[10,20]}"#).unwrap();
        assert_eq!(
            f,
            ShardingFunction::Range {
                bounds: vec![10, 20]
            }
        );
    }
}
