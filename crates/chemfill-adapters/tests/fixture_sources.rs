use std::path::PathBuf;

use chemfill_adapters::{FetchFailure, FixtureClient, SourceClient};
use chemfill_core::FieldName;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[tokio::test]
async fn bundled_primary_fixtures_resolve_by_key_and_name() {
    let client = FixtureClient::from_path("primary", fixtures_dir().join("primary.yaml"), true).unwrap();

    let found = client.fetch("108-90-7", None).await.unwrap();
    assert!(found.found);
    assert_eq!(found.value(FieldName::MolecularFormula), Some("C6H5Cl"));

    let missing = client.fetch("BAD-KEY", Some("Unknown compound")).await.unwrap_err();
    assert!(matches!(missing, FetchFailure::NotFound));

    let flaky = client.fetch("64-17-5", Some("Ethanol")).await.unwrap_err();
    assert!(flaky.is_transient());
}

#[tokio::test]
async fn bundled_secondary_fixtures_report_malformed_pages() {
    let client = FixtureClient::from_path("secondary", fixtures_dir().join("secondary.yaml"), false).unwrap();
    let err = client.fetch("110-86-1", Some("Pyridine")).await.unwrap_err();
    assert!(matches!(err, FetchFailure::Malformed(_)));
}
