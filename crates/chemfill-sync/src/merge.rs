//! Field-level merge of per-source results into one canonical record.

use std::collections::BTreeMap;

use chemfill_core::{
    CanonicalRecord, FieldName, InputRow, RecordStatus, SourceResult, SourceTrace, SourcedValue,
};
use serde::{Deserialize, Serialize};

/// Which source wins each field. `fields` overrides `default` per field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecedenceTable {
    pub default: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<FieldName, Vec<String>>,
}

impl PrecedenceTable {
    pub fn new<I, S>(default: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            default: default.into_iter().map(Into::into).collect(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field<I, S>(mut self, field: FieldName, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields
            .insert(field, order.into_iter().map(Into::into).collect());
        self
    }

    pub fn order_for(&self, field: FieldName) -> &[String] {
        self.fields
            .get(&field)
            .map(Vec::as_slice)
            .unwrap_or(self.default.as_slice())
    }

    /// Every source id mentioned anywhere in the table.
    pub fn referenced_sources(&self) -> impl Iterator<Item = &str> {
        self.default
            .iter()
            .chain(self.fields.values().flatten())
            .map(String::as_str)
    }

    fn rank(&self, source_id: &str) -> usize {
        self.default
            .iter()
            .position(|id| id == source_id)
            .unwrap_or(usize::MAX)
    }
}

/// Combine `results` for `row`. For each field the first source in
/// precedence order with a non-empty value wins; fields nobody supplies stay
/// unset. The outcome does not depend on the order of `results`.
pub fn merge(row: &InputRow, results: &[SourceResult], precedence: &PrecedenceTable) -> CanonicalRecord {
    let mut record = CanonicalRecord::pending(row);

    for field in FieldName::ALL {
        let winner = precedence.order_for(field).iter().find_map(|source_id| {
            results
                .iter()
                .filter(|r| r.found && r.source_id == *source_id)
                .find_map(|r| r.value(field))
                .map(|value| SourcedValue {
                    value: value.to_string(),
                    source_id: source_id.clone(),
                })
        });
        if let Some(value) = winner {
            record.fields.insert(field, value);
        }
    }

    let mut trace: Vec<SourceTrace> = results.iter().map(SourceTrace::from).collect();
    trace.sort_by(|a, b| {
        precedence
            .rank(&a.source_id)
            .cmp(&precedence.rank(&b.source_id))
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    record.trace = trace;

    let any_found = results
        .iter()
        .any(|r| r.found && precedence.rank(&r.source_id) != usize::MAX);
    record.status = if any_found {
        RecordStatus::Done
    } else {
        RecordStatus::Failed
    };
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use chemfill_core::SourceFailure;

    fn found(source: &str, pairs: &[(FieldName, &str)]) -> SourceResult {
        SourceResult::found(
            source,
            pairs
                .iter()
                .map(|(f, v)| (*f, Some(v.to_string())))
                .collect(),
        )
    }

    fn row() -> InputRow {
        InputRow::new(3, "64-17-5", Some("Ethanol")).unwrap()
    }

    #[test]
    fn per_field_precedence_overrides_default() {
        let precedence = PrecedenceTable::new(["primary", "secondary"])
            .with_field(FieldName::Appearance, ["secondary", "primary"]);
        let results = vec![
            found(
                "primary",
                &[
                    (FieldName::ChemicalName, "Ethanol"),
                    (FieldName::Appearance, "liquid"),
                ],
            ),
            found(
                "secondary",
                &[
                    (FieldName::ChemicalName, "Ethyl alcohol"),
                    (FieldName::Appearance, "Clear colourless liquid"),
                    (FieldName::Storage, "Flammables cabinet"),
                ],
            ),
        ];
        let record = merge(&row(), &results, &precedence);
        assert_eq!(record.status, RecordStatus::Done);
        assert_eq!(record.value(FieldName::ChemicalName), Some("Ethanol"));
        assert_eq!(record.fields[&FieldName::ChemicalName].source_id, "primary");
        assert_eq!(record.value(FieldName::Appearance), Some("Clear colourless liquid"));
        assert_eq!(record.value(FieldName::Storage), Some("Flammables cabinet"));
        assert_eq!(record.value(FieldName::MolecularWeight), None);
    }

    #[test]
    fn blank_values_do_not_win() {
        let precedence = PrecedenceTable::new(["primary", "secondary"]);
        let results = vec![
            found("primary", &[(FieldName::MolecularFormula, "  ")]),
            found("secondary", &[(FieldName::MolecularFormula, "C2H6O")]),
        ];
        let record = merge(&row(), &results, &precedence);
        assert_eq!(record.fields[&FieldName::MolecularFormula].source_id, "secondary");
    }

    #[test]
    fn merge_ignores_result_order() {
        let precedence = PrecedenceTable::new(["primary", "secondary"]);
        let a = found("primary", &[(FieldName::MolecularFormula, "C2H6O")]);
        let b = found("secondary", &[(FieldName::MolecularFormula, "CH3CH2OH")]);
        let forward = merge(&row(), &[a.clone(), b.clone()], &precedence);
        let reverse = merge(&row(), &[b, a], &precedence);
        assert_eq!(
            serde_json::to_vec(&forward).unwrap(),
            serde_json::to_vec(&reverse).unwrap()
        );
        assert_eq!(forward.digest(), reverse.digest());
    }

    #[test]
    fn nothing_found_fails_the_row() {
        let precedence = PrecedenceTable::new(["primary", "secondary"]);
        let results = vec![
            SourceResult::failed("primary", SourceFailure::NotFound, 1),
            SourceResult::empty("secondary"),
        ];
        let record = merge(&row(), &results, &precedence);
        assert_eq!(record.status, RecordStatus::Failed);
        assert!(record.fields.is_empty());
        assert_eq!(record.category, None);
        assert_eq!(record.trace.len(), 2);
    }

    #[test]
    fn unlisted_sources_never_contribute() {
        let precedence = PrecedenceTable::new(["primary"]);
        let results = vec![found("rogue", &[(FieldName::ChemicalName, "Wrong")])];
        let record = merge(&row(), &results, &precedence);
        assert!(record.fields.is_empty());
        assert_eq!(record.status, RecordStatus::Failed);
    }
}
