//! Core data model for chemfill: input rows, per-source results, canonical
//! records and checkpoint state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "chemfill-core";

/// Current on-disk checkpoint schema version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Enrichable attributes of a catalogue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    ChemicalName,
    CasNo,
    Synonyms,
    MolecularFormula,
    MolecularWeight,
    Appearance,
    Storage,
    ShippingConditions,
    Applications,
}

impl FieldName {
    pub const ALL: [FieldName; 9] = [
        FieldName::ChemicalName,
        FieldName::CasNo,
        FieldName::Synonyms,
        FieldName::MolecularFormula,
        FieldName::MolecularWeight,
        FieldName::Appearance,
        FieldName::Storage,
        FieldName::ShippingConditions,
        FieldName::Applications,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::ChemicalName => "chemical_name",
            FieldName::CasNo => "cas_no",
            FieldName::Synonyms => "synonyms",
            FieldName::MolecularFormula => "molecular_formula",
            FieldName::MolecularWeight => "molecular_weight",
            FieldName::Appearance => "appearance",
            FieldName::Storage => "storage",
            FieldName::ShippingConditions => "shipping_conditions",
            FieldName::Applications => "applications",
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowRejection {
    #[error("row {index}: key is empty")]
    EmptyKey { index: usize },
    #[error("row {index}: duplicate key {key} (first seen at row {first_index})")]
    DuplicateKey {
        index: usize,
        key: String,
        first_index: usize,
    },
}

impl RowRejection {
    pub fn index(&self) -> usize {
        match self {
            RowRejection::EmptyKey { index } => *index,
            RowRejection::DuplicateKey { index, .. } => *index,
        }
    }
}

/// One unit of work read from the input table. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRow {
    pub index: usize,
    pub key: String,
    pub hint_name: Option<String>,
}

impl InputRow {
    pub fn new(
        index: usize,
        key: impl AsRef<str>,
        hint_name: Option<&str>,
    ) -> Result<Self, RowRejection> {
        let key = key.as_ref().trim();
        if key.is_empty() {
            return Err(RowRejection::EmptyKey { index });
        }
        Ok(Self {
            index,
            key: key.to_string(),
            hint_name: hint_name.and_then(non_empty),
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Permanent or exhausted outcome of querying one source for one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceFailure {
    NotFound,
    Malformed { message: String },
    Exhausted { attempts: u32, last_error: String },
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFailure::NotFound => f.write_str("not found"),
            SourceFailure::Malformed { message } => write!(f, "malformed response: {message}"),
            SourceFailure::Exhausted {
                attempts,
                last_error,
            } => write!(f, "retries exhausted after {attempts} attempts: {last_error}"),
        }
    }
}

/// Partial answer from a single source for a single row.
///
/// `found == false` with no `failure` means the source answered and had no data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceResult {
    pub source_id: String,
    pub fields: BTreeMap<FieldName, Option<String>>,
    pub found: bool,
    pub failure: Option<SourceFailure>,
    pub attempts: u32,
}

impl SourceResult {
    pub fn found(source_id: impl Into<String>, fields: BTreeMap<FieldName, Option<String>>) -> Self {
        Self {
            source_id: source_id.into(),
            fields,
            found: true,
            failure: None,
            attempts: 1,
        }
    }

    pub fn empty(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            fields: BTreeMap::new(),
            found: false,
            failure: None,
            attempts: 1,
        }
    }

    pub fn failed(source_id: impl Into<String>, failure: SourceFailure, attempts: u32) -> Self {
        Self {
            source_id: source_id.into(),
            fields: BTreeMap::new(),
            found: false,
            failure: Some(failure),
            attempts,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Non-empty, trimmed value for `field`, if this source supplied one.
    pub fn value(&self, field: FieldName) -> Option<&str> {
        self.fields
            .get(&field)
            .and_then(|v| v.as_deref())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// A merged value together with the source that supplied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcedValue {
    pub value: String,
    pub source_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TraceOutcome {
    Found,
    Empty,
    Failed { failure: SourceFailure },
}

/// Diagnostic record of one source attempt, kept on the canonical record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTrace {
    pub source_id: String,
    pub attempts: u32,
    #[serde(flatten)]
    pub outcome: TraceOutcome,
}

impl From<&SourceResult> for SourceTrace {
    fn from(result: &SourceResult) -> Self {
        let outcome = match (&result.failure, result.found) {
            (Some(failure), _) => TraceOutcome::Failed {
                failure: failure.clone(),
            },
            (None, true) => TraceOutcome::Found,
            (None, false) => TraceOutcome::Empty,
        };
        Self {
            source_id: result.source_id.clone(),
            attempts: result.attempts,
            outcome,
        }
    }
}

/// The single merged result for a row. Owned by exactly one worker until it
/// is handed to the result writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub index: usize,
    pub key: String,
    pub hint_name: Option<String>,
    pub fields: BTreeMap<FieldName, SourcedValue>,
    pub category: Option<String>,
    pub status: RecordStatus,
    #[serde(default)]
    pub trace: Vec<SourceTrace>,
}

impl CanonicalRecord {
    pub fn pending(row: &InputRow) -> Self {
        Self {
            index: row.index,
            key: row.key.clone(),
            hint_name: row.hint_name.clone(),
            fields: BTreeMap::new(),
            category: None,
            status: RecordStatus::Pending,
            trace: Vec::new(),
        }
    }

    pub fn value(&self, field: FieldName) -> Option<&str> {
        self.fields.get(&field).map(|v| v.value.as_str())
    }

    /// SHA-256 over the canonical JSON encoding; equal records hash equal.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

/// Durable record of finished rows. `completed` is the source of truth;
/// `last_contiguous` is a derived cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(default = "default_checkpoint_version")]
    pub version: u32,
    pub completed: BTreeSet<usize>,
    #[serde(default)]
    pub last_contiguous: Option<usize>,
    pub updated_at: DateTime<Utc>,
}

fn default_checkpoint_version() -> u32 {
    CHECKPOINT_VERSION
}

impl CheckpointState {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            completed: BTreeSet::new(),
            last_contiguous: None,
            updated_at: now,
        }
    }

    pub fn from_completed(completed: BTreeSet<usize>, now: DateTime<Utc>) -> Self {
        let last_contiguous = contiguous_prefix_end(&completed);
        Self {
            version: CHECKPOINT_VERSION,
            completed,
            last_contiguous,
            updated_at: now,
        }
    }

    pub fn is_complete(&self, index: usize) -> bool {
        self.completed.contains(&index)
    }

    /// Records `index` as complete. Returns `false` if it already was.
    pub fn insert(&mut self, index: usize, now: DateTime<Utc>) -> bool {
        if !self.completed.insert(index) {
            return false;
        }
        let next = self.last_contiguous.map_or(0, |n| n + 1);
        if index == next {
            let mut cursor = index;
            while self.completed.contains(&(cursor + 1)) {
                cursor += 1;
            }
            self.last_contiguous = Some(cursor);
        }
        self.updated_at = now;
        true
    }

    /// Rebuilds the derived `last_contiguous` cache from `completed`.
    pub fn recompute(&mut self) {
        self.last_contiguous = contiguous_prefix_end(&self.completed);
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// Rows whose index has not been recorded complete, in input order.
    pub fn pending<'a>(&'a self, rows: &'a [InputRow]) -> impl Iterator<Item = &'a InputRow> + 'a {
        rows.iter().filter(move |row| !self.is_complete(row.index))
    }
}

fn contiguous_prefix_end(completed: &BTreeSet<usize>) -> Option<usize> {
    let mut last = None;
    for (expected, index) in completed.iter().enumerate() {
        if *index != expected {
            break;
        }
        last = Some(expected);
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn input_row_rejects_blank_key_and_trims() {
        assert_eq!(
            InputRow::new(3, "   ", Some("x")),
            Err(RowRejection::EmptyKey { index: 3 })
        );
        let row = InputRow::new(0, " 50-00-0 ", Some("  ")).unwrap();
        assert_eq!(row.key, "50-00-0");
        assert_eq!(row.hint_name, None);
    }

    #[test]
    fn last_contiguous_stops_at_first_gap() {
        let mut state = CheckpointState::empty(ts());
        assert!(state.insert(1, ts()));
        assert_eq!(state.last_contiguous, None);
        assert!(state.insert(0, ts()));
        assert_eq!(state.last_contiguous, Some(1));
        assert!(state.insert(3, ts()));
        assert_eq!(state.last_contiguous, Some(1));
        assert!(!state.insert(3, ts()));
        assert!(state.insert(2, ts()));
        assert_eq!(state.last_contiguous, Some(3));
    }

    #[test]
    fn recompute_matches_incremental_cache() {
        let completed: BTreeSet<usize> = [0, 1, 2, 5, 6].into_iter().collect();
        let mut state = CheckpointState::from_completed(completed, ts());
        assert_eq!(state.last_contiguous, Some(2));
        state.last_contiguous = Some(99);
        state.recompute();
        assert_eq!(state.last_contiguous, Some(2));
    }

    #[test]
    fn pending_excludes_completed_rows_beyond_a_gap() {
        let rows: Vec<InputRow> = (0..5)
            .map(|i| InputRow::new(i, format!("key-{i}"), None).unwrap())
            .collect();
        let state = CheckpointState::from_completed([0, 2, 4].into_iter().collect(), ts());
        let pending: Vec<usize> = state.pending(&rows).map(|r| r.index).collect();
        assert_eq!(pending, vec![1, 3]);
    }

    #[test]
    fn digest_is_stable_for_equal_records() {
        let row = InputRow::new(0, "50-00-0", Some("Formaldehyde")).unwrap();
        let mut a = CanonicalRecord::pending(&row);
        a.fields.insert(
            FieldName::MolecularFormula,
            SourcedValue {
                value: "CH2O".into(),
                source_id: "pubchem".into(),
            },
        );
        let b = a.clone();
        assert_eq!(a.digest(), b.digest());
        a.category = Some("Aliphatic".into());
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn source_result_value_ignores_blank_strings() {
        let mut fields = BTreeMap::new();
        fields.insert(FieldName::Appearance, Some("  ".to_string()));
        fields.insert(FieldName::MolecularFormula, Some(" CH2O ".to_string()));
        let result = SourceResult::found("a", fields);
        assert_eq!(result.value(FieldName::Appearance), None);
        assert_eq!(result.value(FieldName::MolecularFormula), Some("CH2O"));
        assert_eq!(result.value(FieldName::Synonyms), None);
    }

    #[test]
    fn trace_outcome_serializes_with_tag() {
        let result = SourceResult::failed("b", SourceFailure::NotFound, 1);
        let trace = SourceTrace::from(&result);
        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["failure"]["kind"], "not_found");
    }
}
