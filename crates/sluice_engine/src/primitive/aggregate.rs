use std::collections::HashSet;

use sluice_common::datum::{cmp_datum, encode_datum_key, DataType, Datum, Field, OwnedRow, QueryResult};
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::BindVars;

use super::{Primitive, PrimitiveOps, StreamCallback};
use crate::vcursor::VCursor;

/// How partial per-shard values of one column combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOpcode {
    /// Shards return partial counts; they are summed.
    Count,
    Sum,
    Min,
    Max,
    /// Input carries raw values; distinct non-NULL values are counted.
    CountDistinct,
    SumDistinct,
    /// Keep the first value seen in the group.
    AnyValue,
}

impl AggregateOpcode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateOpcode::Count => "count",
            AggregateOpcode::Sum => "sum",
            AggregateOpcode::Min => "min",
            AggregateOpcode::Max => "max",
            AggregateOpcode::CountDistinct => "count_distinct",
            AggregateOpcode::SumDistinct => "sum_distinct",
            AggregateOpcode::AnyValue => "any_value",
        }
    }

    fn is_count(&self) -> bool {
        matches!(self, AggregateOpcode::Count | AggregateOpcode::CountDistinct)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateParams {
    pub opcode: AggregateOpcode,
    /// Column aggregated in place: read from the input and written to the
    /// same position of the output row.
    pub col: usize,
    /// Output column name override.
    pub alias: Option<String>,
}

impl AggregateParams {
    pub fn new(opcode: AggregateOpcode, col: usize) -> Self {
        Self {
            opcode,
            col,
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupByParam {
    pub key_col: usize,
    /// Binary-comparable stand-in for `key_col`, preferred when non-NULL.
    pub weight_string_col: Option<usize>,
}

impl GroupByParam {
    pub fn new(key_col: usize) -> Self {
        Self {
            key_col,
            weight_string_col: None,
        }
    }
}

fn column<'a>(row: &'a OwnedRow, col: usize, what: &str) -> SluiceResult<&'a Datum> {
    row.get(col).ok_or_else(|| {
        SluiceError::Execution(format!(
            "{what} column {col} out of bounds for row of width {}",
            row.len()
        ))
    })
}

fn datum_key(d: &Datum) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_datum_key(&mut buf, d);
    buf
}

fn add_datums(a: &Datum, b: &Datum, opcode: AggregateOpcode) -> SluiceResult<Datum> {
    a.add(b).ok_or_else(|| {
        SluiceError::Execution(format!(
            "cannot {} values {} and {}",
            opcode.as_str(),
            a.to_sql_literal(),
            b.to_sql_literal()
        ))
    })
}

/// Running aggregate state of one group: the group's first row with the
/// aggregate columns folded in place.
struct GroupState {
    row: OwnedRow,
    seen: Vec<HashSet<Vec<u8>>>,
}

impl GroupState {
    fn start(mut row: OwnedRow, aggregates: &[AggregateParams]) -> SluiceResult<Self> {
        let mut seen = vec![HashSet::new(); aggregates.len()];
        for (agg, set) in aggregates.iter().zip(seen.iter_mut()) {
            let value = column(&row, agg.col, "aggregate")?.clone();
            let init = match agg.opcode {
                AggregateOpcode::CountDistinct => {
                    if value.is_null() {
                        Datum::Int64(0)
                    } else {
                        set.insert(datum_key(&value));
                        Datum::Int64(1)
                    }
                }
                AggregateOpcode::SumDistinct => {
                    if !value.is_null() {
                        set.insert(datum_key(&value));
                    }
                    value
                }
                _ => value,
            };
            row.values[agg.col] = init;
        }
        Ok(Self { row, seen })
    }

    fn fold(&mut self, row: &OwnedRow, aggregates: &[AggregateParams]) -> SluiceResult<()> {
        for (agg, set) in aggregates.iter().zip(self.seen.iter_mut()) {
            let value = column(row, agg.col, "aggregate")?;
            let current = &mut self.row.values[agg.col];
            match agg.opcode {
                AggregateOpcode::Count | AggregateOpcode::Sum => {
                    *current = add_datums(current, value, agg.opcode)?;
                }
                AggregateOpcode::Min => {
                    if !value.is_null()
                        && (current.is_null() || cmp_datum(value, current).is_lt())
                    {
                        *current = value.clone();
                    }
                }
                AggregateOpcode::Max => {
                    if !value.is_null()
                        && (current.is_null() || cmp_datum(value, current).is_gt())
                    {
                        *current = value.clone();
                    }
                }
                AggregateOpcode::CountDistinct => {
                    if !value.is_null() && set.insert(datum_key(value)) {
                        *current = add_datums(current, &Datum::Int64(1), agg.opcode)?;
                    }
                }
                AggregateOpcode::SumDistinct => {
                    if !value.is_null() && set.insert(datum_key(value)) {
                        *current = add_datums(current, value, agg.opcode)?;
                    }
                }
                AggregateOpcode::AnyValue => {}
            }
        }
        Ok(())
    }

    fn finish(mut self, truncate: usize) -> OwnedRow {
        if truncate > 0 {
            self.row.truncate(truncate);
        }
        self.row
    }
}

/// Output fields: count columns become integers, aliases rename.
fn aggregate_fields(mut fields: Vec<Field>, aggregates: &[AggregateParams], truncate: usize) -> Vec<Field> {
    for agg in aggregates {
        if let Some(field) = fields.get_mut(agg.col) {
            if agg.opcode.is_count() {
                field.data_type = DataType::Int64;
            }
            if let Some(alias) = &agg.alias {
                field.name = alias.clone();
            }
        }
    }
    if truncate > 0 {
        fields.truncate(truncate);
    }
    fields
}

fn describe_aggregates(aggregates: &[AggregateParams]) -> String {
    aggregates
        .iter()
        .map(|a| format!("{}({})", a.opcode.as_str(), a.col))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Group-break aggregation over input already ordered by the group keys.
#[derive(Debug, Clone)]
pub struct OrderedAggregate {
    pub aggregates: Vec<AggregateParams>,
    pub group_by_keys: Vec<GroupByParam>,
    pub truncate_column_count: usize,
    pub input: Box<Primitive>,
}

impl OrderedAggregate {
    pub fn new(aggregates: Vec<AggregateParams>, group_by_keys: Vec<GroupByParam>, input: Primitive) -> Self {
        Self {
            aggregates,
            group_by_keys,
            truncate_column_count: 0,
            input: Box::new(input),
        }
    }

    pub fn with_truncate_column_count(mut self, width: usize) -> Self {
        self.truncate_column_count = width;
        self
    }

    fn group_key(&self, row: &OwnedRow) -> SluiceResult<Vec<u8>> {
        let mut buf = Vec::new();
        for key in &self.group_by_keys {
            let col = match key.weight_string_col {
                Some(ws) if row.get(ws).is_some_and(|d| !d.is_null()) => ws,
                _ => key.key_col,
            };
            encode_datum_key(&mut buf, column(row, col, "group by")?);
        }
        Ok(buf)
    }

    /// Fold `rows` into the running group, returning every group closed
    /// by a key change.
    fn consume(
        &self,
        current: &mut Option<(Vec<u8>, GroupState)>,
        rows: Vec<OwnedRow>,
    ) -> SluiceResult<Vec<OwnedRow>> {
        let mut out = Vec::new();
        for row in rows {
            let key = self.group_key(&row)?;
            match current {
                Some((k, state)) if *k == key => state.fold(&row, &self.aggregates)?,
                _ => {
                    let next = (key, GroupState::start(row, &self.aggregates)?);
                    if let Some((_, done)) = current.replace(next) {
                        out.push(done.finish(self.truncate_column_count));
                    }
                }
            }
        }
        Ok(out)
    }
}

impl PrimitiveOps for OrderedAggregate {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        let input = self.input.execute(vc, bind_vars)?;
        let mut current = None;
        let mut rows = self.consume(&mut current, input.rows)?;
        if let Some((_, state)) = current {
            rows.push(state.finish(self.truncate_column_count));
        }
        let fields = aggregate_fields(input.fields, &self.aggregates, self.truncate_column_count);
        Ok(QueryResult::new(fields, rows))
    }

    fn stream_execute(
        &self,
        vc: &dyn VCursor,
        bind_vars: &BindVars,
        callback: &mut StreamCallback<'_>,
    ) -> SluiceResult<()> {
        let mut current = None;
        let mut fields_pending: Option<Vec<Field>> = None;
        let mut sent_fields = false;
        self.input.stream_execute(vc, bind_vars, &mut |batch| {
            if !sent_fields && !batch.fields.is_empty() {
                fields_pending = Some(aggregate_fields(
                    batch.fields,
                    &self.aggregates,
                    self.truncate_column_count,
                ));
            }
            let rows = self.consume(&mut current, batch.rows)?;
            if rows.is_empty() && fields_pending.is_none() {
                return Ok(());
            }
            sent_fields = true;
            callback(QueryResult::new(fields_pending.take().unwrap_or_default(), rows))
        })?;
        let mut tail = QueryResult::with_fields(fields_pending.take().unwrap_or_default());
        if let Some((_, state)) = current {
            tail.rows.push(state.finish(self.truncate_column_count));
        }
        if tail.rows.is_empty() && tail.fields.is_empty() && sent_fields {
            return Ok(());
        }
        callback(tail)
    }

    fn get_fields(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        let fields = self.input.get_fields(vc, bind_vars)?;
        Ok(aggregate_fields(fields, &self.aggregates, self.truncate_column_count))
    }

    fn needs_transaction(&self) -> bool {
        self.input.needs_transaction()
    }

    fn description(&self) -> String {
        let keys: Vec<String> = self.group_by_keys.iter().map(|k| k.key_col.to_string()).collect();
        format!(
            "OrderedAggregate aggregates=[{}] group_by=[{}]",
            describe_aggregates(&self.aggregates),
            keys.join(", ")
        )
    }

    fn inputs(&self) -> Vec<&Primitive> {
        vec![self.input.as_ref()]
    }
}

/// Aggregation without grouping: always exactly one output row.
#[derive(Debug, Clone)]
pub struct ScalarAggregate {
    pub aggregates: Vec<AggregateParams>,
    pub truncate_column_count: usize,
    pub input: Box<Primitive>,
}

impl ScalarAggregate {
    pub fn new(aggregates: Vec<AggregateParams>, input: Primitive) -> Self {
        Self {
            aggregates,
            truncate_column_count: 0,
            input: Box::new(input),
        }
    }

    pub fn with_truncate_column_count(mut self, width: usize) -> Self {
        self.truncate_column_count = width;
        self
    }

    /// Row produced over empty input: counts are zero, everything else NULL.
    fn empty_row(&self, width: usize) -> OwnedRow {
        let width = self
            .aggregates
            .iter()
            .map(|a| a.col + 1)
            .fold(width, usize::max);
        let mut values = vec![Datum::Null; width];
        for agg in &self.aggregates {
            if agg.opcode.is_count() {
                values[agg.col] = Datum::Int64(0);
            }
        }
        let mut row = OwnedRow::new(values);
        if self.truncate_column_count > 0 {
            row.truncate(self.truncate_column_count);
        }
        row
    }
}

impl PrimitiveOps for ScalarAggregate {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        let input = self.input.execute(vc, bind_vars)?;
        let mut fields = input.fields;
        let mut rows = input.rows.into_iter();
        let row = match rows.next() {
            Some(first) => {
                let mut state = GroupState::start(first, &self.aggregates)?;
                for row in rows {
                    state.fold(&row, &self.aggregates)?;
                }
                state.finish(self.truncate_column_count)
            }
            None => {
                if fields.is_empty() {
                    fields = self.input.get_fields(vc, bind_vars)?;
                }
                self.empty_row(fields.len())
            }
        };
        let fields = aggregate_fields(fields, &self.aggregates, self.truncate_column_count);
        Ok(QueryResult::new(fields, vec![row]))
    }

    fn get_fields(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        let fields = self.input.get_fields(vc, bind_vars)?;
        Ok(aggregate_fields(fields, &self.aggregates, self.truncate_column_count))
    }

    fn needs_transaction(&self) -> bool {
        self.input.needs_transaction()
    }

    fn description(&self) -> String {
        format!(
            "ScalarAggregate aggregates=[{}]",
            describe_aggregates(&self.aggregates)
        )
    }

    fn inputs(&self) -> Vec<&Primitive> {
        vec![self.input.as_ref()]
    }
}
