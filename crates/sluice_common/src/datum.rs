use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single scalar value as it travels between shards and the router.
/// Small enum, no heap allocation for fixed-size types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    /// Fixed-point decimal: mantissa × 10^(-scale).
    Decimal(i128, u8),
    Text(String),
    Bytea(Vec<u8>),
    /// Microseconds since Unix epoch.
    Timestamp(i64),
}

/// Column type as reported in result metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Null,
    Boolean,
    Int64,
    UInt64,
    Float64,
    Decimal,
    Text,
    Binary,
    Timestamp,
}

impl DataType {
    /// Text columns compare through a collation rather than by raw value;
    /// callers that need a total order use a weight-string column instead.
    pub fn is_text(&self) -> bool {
        matches!(self, DataType::Text)
    }
}

impl Datum {
    pub fn data_type(&self) -> DataType {
        match self {
            Datum::Null => DataType::Null,
            Datum::Boolean(_) => DataType::Boolean,
            Datum::Int64(_) => DataType::Int64,
            Datum::UInt64(_) => DataType::UInt64,
            Datum::Float64(_) => DataType::Float64,
            Datum::Decimal(_, _) => DataType::Decimal,
            Datum::Text(_) => DataType::Text,
            Datum::Bytea(_) => DataType::Binary,
            Datum::Timestamp(_) => DataType::Timestamp,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Boolean(b) => Some(*b),
            Datum::Int64(v) => Some(*v != 0),
            Datum::UInt64(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int64(v) => Some(*v),
            Datum::UInt64(v) => i64::try_from(*v).ok(),
            Datum::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int64(v) => Some(*v as f64),
            Datum::UInt64(v) => Some(*v as f64),
            Datum::Float64(v) => Some(*v),
            Datum::Decimal(m, s) => Some(*m as f64 / 10f64.powi(*s as i32)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Render as a SQL literal, quoting and escaping text.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Datum::Null => "null".to_string(),
            Datum::Boolean(b) => if *b { "1".into() } else { "0".into() },
            Datum::Text(s) => {
                let mut out = String::with_capacity(s.len() + 2);
                out.push('\'');
                for ch in s.chars() {
                    match ch {
                        '\'' => out.push_str("\\'"),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\0' => out.push_str("\\0"),
                        c => out.push(c),
                    }
                }
                out.push('\'');
                out
            }
            Datum::Bytea(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                format!("X'{}'", hex)
            }
            other => other.to_string(),
        }
    }

    /// Sum two numeric datums. NULL is the identity; mixed integer/float
    /// promotes to float.
    pub fn add(&self, other: &Datum) -> Option<Datum> {
        match (self, other) {
            (Datum::Null, d) | (d, Datum::Null) => Some(d.clone()),
            (Datum::Int64(a), Datum::Int64(b)) => Some(Datum::Int64(a.wrapping_add(*b))),
            (Datum::UInt64(a), Datum::UInt64(b)) => Some(Datum::UInt64(a.wrapping_add(*b))),
            (Datum::Int64(a), Datum::UInt64(b)) | (Datum::UInt64(b), Datum::Int64(a)) => {
                Some(Datum::Int64(a.wrapping_add(*b as i64)))
            }
            (Datum::Decimal(a, sa), Datum::Decimal(b, sb)) => decimal_align(*a, *sa, *b, *sb)
                .and_then(|(na, nb, s)| Some(Datum::Decimal(na.checked_add(nb)?, s)))
                .or_else(|| float_add(self, other)),
            (Datum::Decimal(a, sa), Datum::Int64(b)) | (Datum::Int64(b), Datum::Decimal(a, sa)) => {
                decimal_align(*a, *sa, *b as i128, 0)
                    .and_then(|(na, nb, s)| Some(Datum::Decimal(na.checked_add(nb)?, s)))
                    .or_else(|| float_add(self, other))
            }
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => Some(Datum::Float64(x + y)),
                _ => None,
            },
        }
    }
}

fn float_add(a: &Datum, b: &Datum) -> Option<Datum> {
    Some(Datum::Float64(a.as_f64()? + b.as_f64()?))
}

/// Largest scale whose power of ten fits an `i128` mantissa.
pub const MAX_DECIMAL_SCALE: u8 = 38;

/// Drop trailing fractional zeros: (1500, 3) → (15, 1). Every decimal value
/// has exactly one normalized form.
pub fn normalize_decimal(mut mantissa: i128, mut scale: u8) -> (i128, u8) {
    while scale > 0 && mantissa % 10 == 0 {
        mantissa /= 10;
        scale -= 1;
    }
    (mantissa, scale)
}

/// Bring two decimals to a common scale, or `None` if that overflows.
fn decimal_align(a: i128, sa: u8, b: i128, sb: u8) -> Option<(i128, i128, u8)> {
    let (a, sa) = normalize_decimal(a, sa);
    let (b, sb) = normalize_decimal(b, sb);
    match sa.cmp(&sb) {
        Ordering::Equal => Some((a, b, sa)),
        Ordering::Greater => Some((a, b.checked_mul(10i128.checked_pow((sa - sb) as u32)?)?, sa)),
        Ordering::Less => Some((a.checked_mul(10i128.checked_pow((sb - sa) as u32)?)?, b, sb)),
    }
}

/// (12345, 2) → "123.45", (-1, 3) → "-0.001"
pub fn decimal_to_string(mantissa: i128, scale: u8) -> String {
    if scale == 0 {
        return mantissa.to_string();
    }
    let negative = mantissa < 0;
    let s = mantissa.unsigned_abs().to_string();
    let scale = scale as usize;
    let body = if s.len() <= scale {
        format!("0.{}{}", "0".repeat(scale - s.len()), s)
    } else {
        let (int_part, frac_part) = s.split_at(s.len() - scale);
        format!("{}.{}", int_part, frac_part)
    };
    if negative {
        format!("-{}", body)
    } else {
        body
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::UInt64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Decimal(m, s) => write!(f, "{}", decimal_to_string(*m, *s)),
            Datum::Text(s) => write!(f, "{}", s),
            Datum::Bytea(bytes) => {
                write!(f, "\\x")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Datum::Timestamp(us) => write!(f, "{}", us),
        }
    }
}

/// Structural equality. Unlike SQL comparison, NULL equals NULL here so that
/// rows and results can be compared and deduplicated; three-valued logic
/// lives in the expression evaluator.
impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Null, Datum::Null) => true,
            (Datum::Null, _) | (_, Datum::Null) => false,
            (Datum::Text(a), Datum::Text(b)) => a == b,
            (Datum::Bytea(a), Datum::Bytea(b)) => a == b,
            (Datum::Boolean(a), Datum::Boolean(b)) => a == b,
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a == b,
            _ => cmp_datum(self, other) == Ordering::Equal && self.is_numeric() && other.is_numeric(),
        }
    }
}

impl Eq for Datum {}

impl Datum {
    fn is_numeric(&self) -> bool {
        matches!(
            self,
            Datum::Int64(_) | Datum::UInt64(_) | Datum::Float64(_) | Datum::Decimal(_, _)
        )
    }
}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut buf = Vec::with_capacity(16);
        encode_datum_key(&mut buf, self);
        buf.hash(state);
    }
}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(cmp_datum(self, other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_datum(self, other)
    }
}

/// Total order used for sorting and merging: NULL sorts first, numerics
/// compare across representations, mismatched types compare equal.
pub fn cmp_datum(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Null, Datum::Null) => Ordering::Equal,
        (Datum::Null, _) => Ordering::Less,
        (_, Datum::Null) => Ordering::Greater,
        (Datum::Int64(x), Datum::Int64(y)) => x.cmp(y),
        (Datum::UInt64(x), Datum::UInt64(y)) => x.cmp(y),
        (Datum::Int64(x), Datum::UInt64(y)) => (*x as i128).cmp(&(*y as i128)),
        (Datum::UInt64(x), Datum::Int64(y)) => (*x as i128).cmp(&(*y as i128)),
        (Datum::Decimal(x, sx), Datum::Decimal(y, sy)) => match decimal_align(*x, *sx, *y, *sy) {
            Some((nx, ny, _)) => nx.cmp(&ny),
            None => a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal),
        },
        (Datum::Text(x), Datum::Text(y)) => x.cmp(y),
        (Datum::Bytea(x), Datum::Bytea(y)) => x.cmp(y),
        (Datum::Boolean(x), Datum::Boolean(y)) => x.cmp(y),
        (Datum::Timestamp(x), Datum::Timestamp(y)) => x.cmp(y),
        (x, y) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => fx.partial_cmp(&fy).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

/// Deterministic binary encoding of a datum, used for grouping, dedup and
/// hashing. Integral numerics encode identically across representations,
/// and decimals are encoded in normalized form so `0.5` and `0.50` agree.
pub fn encode_datum_key(buf: &mut Vec<u8>, datum: &Datum) {
    match datum {
        Datum::Null => buf.push(0x00),
        Datum::Boolean(b) => {
            buf.push(0x01);
            buf.push(u8::from(*b));
        }
        Datum::Int64(v) => {
            buf.push(0x02);
            buf.extend_from_slice(&(*v as i128).to_be_bytes());
        }
        Datum::UInt64(v) => {
            buf.push(0x02);
            buf.extend_from_slice(&(*v as i128).to_be_bytes());
        }
        Datum::Float64(v) => {
            if v.fract() == 0.0 && v.abs() < 9.0e18 {
                buf.push(0x02);
                buf.extend_from_slice(&(*v as i128).to_be_bytes());
            } else {
                buf.push(0x03);
                buf.extend_from_slice(&v.to_bits().to_be_bytes());
            }
        }
        Datum::Decimal(m, s) => {
            let (m, s) = normalize_decimal(*m, *s);
            if s == 0 {
                buf.push(0x02);
            } else {
                buf.push(0x04);
                buf.push(s);
            }
            buf.extend_from_slice(&m.to_be_bytes());
        }
        Datum::Text(s) => {
            buf.push(0x05);
            buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        Datum::Bytea(bytes) => {
            buf.push(0x06);
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(bytes);
        }
        Datum::Timestamp(v) => {
            buf.push(0x07);
            buf.extend_from_slice(&v.to_be_bytes());
        }
    }
}

/// A row is an ordered list of datums.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnedRow {
    pub values: Vec<Datum>,
}

impl OwnedRow {
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drop helper columns beyond `width`.
    pub fn truncate(&mut self, width: usize) {
        self.values.truncate(width);
    }
}

impl fmt::Display for OwnedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

impl From<Vec<Datum>> for OwnedRow {
    fn from(values: Vec<Datum>) -> Self {
        Self::new(values)
    }
}

/// Result column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Rows plus metadata returned by a shard, a primitive, or a statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<OwnedRow>,
    pub rows_affected: u64,
    pub insert_id: u64,
}

impl QueryResult {
    pub fn new(fields: Vec<Field>, rows: Vec<OwnedRow>) -> Self {
        Self {
            fields,
            rows,
            rows_affected: 0,
            insert_id: 0,
        }
    }

    /// Schema-only result.
    pub fn with_fields(fields: Vec<Field>) -> Self {
        Self::new(fields, Vec::new())
    }

    /// Result of a write.
    pub fn affected(rows_affected: u64, insert_id: u64) -> Self {
        Self {
            rows_affected,
            insert_id,
            ..Default::default()
        }
    }

    /// Merge another shard's partial result into this one: rows are
    /// appended, affected counts summed, the first non-zero insert id kept,
    /// and fields adopted if this result has none yet.
    pub fn append(&mut self, other: QueryResult) {
        if self.fields.is_empty() {
            self.fields = other.fields;
        }
        self.rows.extend(other.rows);
        self.rows_affected += other.rows_affected;
        if self.insert_id == 0 {
            self.insert_id = other.insert_id;
        }
    }

    /// Drop helper columns so every row and the field list are `width` wide.
    pub fn truncate_columns(&mut self, width: usize) {
        if width == 0 {
            return;
        }
        self.fields.truncate(width);
        for row in &mut self.rows {
            row.truncate(width);
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
