use std::collections::BTreeMap;
use std::path::PathBuf;

use chemfill_core::{FieldName, RecordStatus};
use chemfill_storage::read_record_log;
use chemfill_sync::{run_from_config, ClassifierInput, PipelineConfig, RuleSet};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[test]
fn bundled_rule_file_agrees_with_builtin_rules() {
    let from_file = RuleSet::from_path(repo_root().join("rules/categories.yaml")).unwrap();
    let builtin = RuleSet::builtin();
    let cases = [
        ("Chlorobenzene", "C6H5Cl", "Halogenated"),
        ("Hexane", "C6H14", "Aliphatic"),
        ("Formaldehyde", "CH2O", "Aliphatic"),
        ("Pyridine", "C5H5N", "Heterocyclic"),
        ("Benzene", "C6H6", "Aromatic"),
        ("Sodium sulfate", "Na2SO4", "Sulfur-Containing"),
    ];
    for (name, formula, expected) in cases {
        let input = ClassifierInput {
            name: Some(name),
            formula: Some(formula),
            synonyms: None,
        };
        assert_eq!(from_file.classify(&input), expected, "{name}");
        assert_eq!(builtin.classify(&input), expected, "{name}");
    }
    assert_eq!(from_file, builtin);
}

#[test]
fn bundled_rule_file_classifies_name_only_rows_like_builtin() {
    let from_file = RuleSet::from_path(repo_root().join("rules/categories.yaml")).unwrap();
    let builtin = RuleSet::builtin();
    let cases = [
        ("Acetic acid", "Oxygen-Containing"),
        ("Methylamine", "Nitrogen-Containing"),
        ("Triphenylphosphine", "Phosphorus-Containing"),
        ("Dimethyl sulfide", "Sulfur-Containing"),
        ("Diethyl ether", "Aliphatic"),
        ("Butyl acetate", "Aliphatic"),
    ];
    for (name, expected) in cases {
        let input = ClassifierInput {
            name: Some(name),
            formula: None,
            synonyms: None,
        };
        assert_eq!(builtin.classify(&input), expected, "{name}");
        assert_eq!(from_file.classify(&input), expected, "{name}");
    }
}

#[tokio::test]
async fn bundled_configuration_runs_offline() {
    let root = repo_root();
    let out = tempdir().unwrap();

    let mut config = PipelineConfig::from_path(root.join("chemfill.yaml")).unwrap();
    config.validate().unwrap();
    config.input_path = root.join(&config.input_path);
    config.rules_path = config.rules_path.take().map(|p| root.join(p));
    for source in &mut config.sources {
        source.fixture_path = source.fixture_path.take().map(|p| root.join(p));
    }
    config.output_path = out.path().join("records.jsonl");
    config.checkpoint_path = out.path().join("checkpoint.json");
    config.export_path = Some(out.path().join("catalogue.csv"));
    config.retry.base_delay_ms = 0;
    config.retry.jitter = false;

    let summary = run_from_config(&config, CancellationToken::new()).await.unwrap();
    assert_eq!(summary.total_rows, 6);
    assert_eq!(summary.completed, 5);
    assert_eq!(summary.failed, 1);

    let records: BTreeMap<String, _> = read_record_log(&config.output_path)
        .await
        .unwrap()
        .records
        .into_iter()
        .map(|r| (r.key.clone(), r))
        .collect();

    let formaldehyde = &records["50-00-0"];
    assert_eq!(formaldehyde.value(FieldName::ChemicalName), Some("Formaldehyde"));
    assert_eq!(formaldehyde.value(FieldName::Appearance), Some("Colourless liquid"));
    assert_eq!(formaldehyde.value(FieldName::Storage), Some("Room temperature"));
    assert_eq!(formaldehyde.fields[&FieldName::Storage].source_id, "secondary");

    let categories: BTreeMap<&str, Option<&str>> = records
        .iter()
        .map(|(key, r)| (key.as_str(), r.category.as_deref()))
        .collect();
    assert_eq!(categories["108-90-7"], Some("Halogenated"));
    assert_eq!(categories["110-54-3"], Some("Aliphatic"));
    assert_eq!(categories["110-86-1"], Some("Heterocyclic"));
    assert_eq!(categories["BAD-KEY"], None);

    let ethanol = &records["64-17-5"];
    assert_eq!(ethanol.status, RecordStatus::Done);
    assert_eq!(ethanol.fields[&FieldName::ChemicalName].source_id, "secondary");
    assert_eq!(records["BAD-KEY"].status, RecordStatus::Failed);
}
