use std::collections::HashSet;

use sluice_common::datum::{encode_datum_key, Datum, Field, OwnedRow, QueryResult};
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::BindVars;

use super::{Primitive, PrimitiveOps, StreamCallback};
use crate::vcursor::VCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Collation {
    #[default]
    Binary,
    CaseInsensitive,
}

/// One column of the distinctness key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckCol {
    pub col: usize,
    /// Comparable stand-in used when `col` holds a value the router cannot
    /// compare directly.
    pub weight_string_col: Option<usize>,
    pub collation: Collation,
}

impl CheckCol {
    pub fn new(col: usize) -> Self {
        Self {
            col,
            weight_string_col: None,
            collation: Collation::Binary,
        }
    }

    pub fn with_weight_string(mut self, col: usize) -> Self {
        self.weight_string_col = Some(col);
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.collation = Collation::CaseInsensitive;
        self
    }

    fn encode(&self, row: &OwnedRow, buf: &mut Vec<u8>) -> SluiceResult<()> {
        if let Some(ws) = self.weight_string_col {
            if let Some(d) = row.get(ws).filter(|d| !d.is_null()) {
                encode_datum_key(buf, d);
                return Ok(());
            }
        }
        let value = row.get(self.col).ok_or_else(|| {
            SluiceError::Execution(format!(
                "distinct column {} out of bounds for row of width {}",
                self.col,
                row.len()
            ))
        })?;
        match (self.collation, value) {
            (Collation::CaseInsensitive, Datum::Text(s)) => {
                encode_datum_key(buf, &Datum::Text(s.to_lowercase()))
            }
            _ => encode_datum_key(buf, value),
        }
        Ok(())
    }
}

/// Drops rows whose check-column key was already seen. First occurrence
/// wins, order is preserved.
#[derive(Debug, Clone)]
pub struct Distinct {
    pub check_cols: Vec<CheckCol>,
    /// Width to truncate to, 0 when no helper columns trail the output.
    pub truncate_column_count: usize,
    pub input: Box<Primitive>,
}

impl Distinct {
    /// `output_width` is the number of user-visible columns. Truncation is
    /// only kept when a weight-string column lies beyond it.
    pub fn new(check_cols: Vec<CheckCol>, output_width: usize, input: Primitive) -> Self {
        let has_helpers = check_cols
            .iter()
            .filter_map(|c| c.weight_string_col)
            .any(|ws| ws >= output_width);
        Self {
            check_cols,
            truncate_column_count: if has_helpers { output_width } else { 0 },
            input: Box::new(input),
        }
    }

    fn row_key(&self, row: &OwnedRow) -> SluiceResult<Vec<u8>> {
        let mut buf = Vec::new();
        for c in &self.check_cols {
            c.encode(row, &mut buf)?;
        }
        Ok(buf)
    }

    fn dedup(&self, seen: &mut HashSet<Vec<u8>>, rows: Vec<OwnedRow>) -> SluiceResult<Vec<OwnedRow>> {
        let mut out = Vec::with_capacity(rows.len());
        for mut row in rows {
            if seen.insert(self.row_key(&row)?) {
                if self.truncate_column_count > 0 {
                    row.truncate(self.truncate_column_count);
                }
                out.push(row);
            }
        }
        Ok(out)
    }
}

impl PrimitiveOps for Distinct {
    fn execute(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<QueryResult> {
        let mut input = self.input.execute(vc, bind_vars)?;
        let mut seen = HashSet::new();
        let rows = self.dedup(&mut seen, std::mem::take(&mut input.rows))?;
        let mut result = QueryResult::new(input.fields, rows);
        result.truncate_columns(self.truncate_column_count);
        Ok(result)
    }

    fn stream_execute(
        &self,
        vc: &dyn VCursor,
        bind_vars: &BindVars,
        callback: &mut StreamCallback<'_>,
    ) -> SluiceResult<()> {
        let mut seen = HashSet::new();
        self.input.stream_execute(vc, bind_vars, &mut |mut batch| {
            let rows = self.dedup(&mut seen, std::mem::take(&mut batch.rows))?;
            if rows.is_empty() && batch.fields.is_empty() {
                return Ok(());
            }
            let mut out = QueryResult::new(batch.fields, rows);
            out.truncate_columns(self.truncate_column_count);
            callback(out)
        })
    }

    fn get_fields(&self, vc: &dyn VCursor, bind_vars: &BindVars) -> SluiceResult<Vec<Field>> {
        let mut fields = self.input.get_fields(vc, bind_vars)?;
        if self.truncate_column_count > 0 {
            fields.truncate(self.truncate_column_count);
        }
        Ok(fields)
    }

    fn needs_transaction(&self) -> bool {
        self.input.needs_transaction()
    }

    fn description(&self) -> String {
        let cols: Vec<String> = self
            .check_cols
            .iter()
            .map(|c| match c.weight_string_col {
                Some(ws) => format!("{}/{}", c.col, ws),
                None => c.col.to_string(),
            })
            .collect();
        format!("Distinct check_cols=[{}]", cols.join(", "))
    }

    fn inputs(&self) -> Vec<&Primitive> {
        vec![self.input.as_ref()]
    }
}
