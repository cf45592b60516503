use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chemfill_core::{InputRow, RowRejection};
use tracing::warn;

use crate::config::InputColumns;
use crate::error::PipelineError;

/// Rows accepted for dispatch plus the ones rejected up front. Rejected rows
/// keep their index so accepted indices match the input file.
#[derive(Debug, Default)]
pub struct InputTable {
    pub rows: Vec<InputRow>,
    pub rejected: Vec<RowRejection>,
    pub total_rows: usize,
}

pub fn read_input_csv(path: impl AsRef<Path>, columns: &InputColumns) -> Result<InputTable> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    read_input(file, columns).with_context(|| format!("reading {}", path.display()))
}

fn find_column(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim().trim_start_matches('\u{feff}').eq_ignore_ascii_case(name.trim()))
}

pub fn read_input<R: Read>(reader: R, columns: &InputColumns) -> Result<InputTable> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = csv.headers().context("reading header row")?.clone();
    let key_col = find_column(&headers, &columns.key_column).ok_or_else(|| {
        PipelineError::Input(format!("no {:?} column in header row", columns.key_column))
    })?;
    let name_col = find_column(&headers, &columns.name_column);
    if name_col.is_none() {
        warn!(column = %columns.name_column, "name column missing; rows will have no hint name");
    }

    let mut table = InputTable::default();
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    for (index, record) in csv.records().enumerate() {
        let record = record.with_context(|| format!("CSV parse error at data row {}", index + 1))?;
        table.total_rows += 1;

        let key = record.get(key_col).unwrap_or_default();
        let hint = name_col.and_then(|col| record.get(col));
        let outcome = InputRow::new(index, key, hint).and_then(|row| {
            match first_seen.get(&row.key) {
                Some(&first_index) => Err(RowRejection::DuplicateKey {
                    index,
                    key: row.key,
                    first_index,
                }),
                None => {
                    first_seen.insert(row.key.clone(), index);
                    Ok(row)
                }
            }
        });
        match outcome {
            Ok(row) => table.rows.push(row),
            Err(rejection) => {
                warn!(row_index = rejection.index(), reason = %rejection, "rejected input row");
                table.rejected.push(rejection);
            }
        }
    }
    Ok(table)
}
