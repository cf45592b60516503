//! Renders the record log into the fixed catalogue table (CSV) and an
//! optional Parquet snapshot with a digest manifest.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chemfill_core::{CanonicalRecord, FieldName, RecordStatus};
use chemfill_storage::{read_record_log, write_atomically};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::OutputDefaults;

pub const EXPORT_COLUMNS: [&str; 11] = [
    "Product Code",
    "Chemical Name",
    "CAS No",
    "Synonyms",
    "Molecular Formula",
    "Molecular Weight",
    "Appearance",
    "Storage",
    "Shipping Conditions",
    "Applications",
    "Category",
];

/// One rendered output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRow {
    pub index: usize,
    pub status: RecordStatus,
    pub product_code: String,
    pub chemical_name: String,
    pub cas_no: String,
    pub synonyms: String,
    pub molecular_formula: String,
    pub molecular_weight: String,
    pub appearance: String,
    pub storage: String,
    pub shipping_conditions: String,
    pub applications: String,
    pub category: String,
}

impl ExportRow {
    pub fn render(record: &CanonicalRecord, defaults: &OutputDefaults) -> Self {
        let product_code = format!("{}-{:04}", defaults.product_code_prefix, record.index + 1);
        let cas_no = record.value(FieldName::CasNo).unwrap_or(record.key.as_str()).to_string();

        if record.status != RecordStatus::Done {
            return Self {
                index: record.index,
                status: record.status,
                product_code,
                chemical_name: String::new(),
                cas_no,
                synonyms: String::new(),
                molecular_formula: String::new(),
                molecular_weight: String::new(),
                appearance: String::new(),
                storage: String::new(),
                shipping_conditions: String::new(),
                applications: String::new(),
                category: String::new(),
            };
        }

        let field = |name: FieldName| record.value(name).unwrap_or_default().to_string();
        let or_default = |name: FieldName, fallback: &str| {
            record.value(name).unwrap_or(fallback).to_string()
        };
        Self {
            index: record.index,
            status: record.status,
            product_code,
            chemical_name: record
                .value(FieldName::ChemicalName)
                .or(record.hint_name.as_deref())
                .unwrap_or_default()
                .to_string(),
            cas_no,
            synonyms: field(FieldName::Synonyms),
            molecular_formula: field(FieldName::MolecularFormula),
            molecular_weight: field(FieldName::MolecularWeight),
            appearance: field(FieldName::Appearance),
            storage: or_default(FieldName::Storage, defaults.storage.as_str()),
            shipping_conditions: or_default(
                FieldName::ShippingConditions,
                defaults.shipping_conditions.as_str(),
            ),
            applications: or_default(FieldName::Applications, defaults.applications.as_str()),
            category: record.category.clone().unwrap_or_default(),
        }
    }

    pub fn cells(&self) -> [&str; 11] {
        [
            &self.product_code,
            &self.chemical_name,
            &self.cas_no,
            &self.synonyms,
            &self.molecular_formula,
            &self.molecular_weight,
            &self.appearance,
            &self.storage,
            &self.shipping_conditions,
            &self.applications,
            &self.category,
        ]
    }
}

fn status_label(status: RecordStatus) -> &'static str {
    match status {
        RecordStatus::Pending => "pending",
        RecordStatus::InProgress => "in_progress",
        RecordStatus::Done => "done",
        RecordStatus::Failed => "failed",
    }
}

/// First record per index, ordered by index.
pub fn render_rows(records: &[CanonicalRecord], defaults: &OutputDefaults) -> Vec<ExportRow> {
    let mut by_index: BTreeMap<usize, &CanonicalRecord> = BTreeMap::new();
    for record in records {
        by_index.entry(record.index).or_insert(record);
    }
    by_index
        .values()
        .map(|record| ExportRow::render(record, defaults))
        .collect()
}

pub fn csv_bytes(rows: &[ExportRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(EXPORT_COLUMNS).context("writing CSV header")?;
    for row in rows {
        writer
            .write_record(row.cells())
            .with_context(|| format!("writing CSV row {}", row.product_code))?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow!("finishing CSV buffer: {}", e.error()))
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub rows: usize,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    pub rows: usize,
    pub done: usize,
    pub failed: usize,
    pub csv_path: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn records_batch(rows: &[ExportRow]) -> Result<RecordBatch> {
    let mut fields = vec![
        ArrowField::new("row_index", DataType::UInt64, false),
        ArrowField::new("status", DataType::Utf8, false),
    ];
    fields.extend(
        EXPORT_COLUMNS
            .iter()
            .map(|name| ArrowField::new(column_name(name), DataType::Utf8, true)),
    );
    let schema = Arc::new(Schema::new(fields));

    let indices = UInt64Array::from(rows.iter().map(|r| r.index as u64).collect::<Vec<_>>());
    let statuses = StringArray::from(
        rows.iter()
            .map(|r| Some(status_label(r.status)))
            .collect::<Vec<_>>(),
    );
    let mut columns: Vec<Arc<dyn arrow_array::Array>> = vec![Arc::new(indices), Arc::new(statuses)];
    for position in 0..EXPORT_COLUMNS.len() {
        let values = StringArray::from(
            rows.iter()
                .map(|r| Some(r.cells()[position]).filter(|v| !v.is_empty()))
                .collect::<Vec<_>>(),
        );
        columns.push(Arc::new(values));
    }
    RecordBatch::try_new(schema, columns).context("building catalogue record batch")
}

/// `Product Code` -> `product_code`.
fn column_name(header: &str) -> String {
    header.to_ascii_lowercase().replace(' ', "_")
}

fn manifest_entry(name: &str, root: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(root).unwrap_or(path).display().to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

pub fn write_parquet_snapshot(dir: &Path, rows: &[ExportRow]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let catalogue_path = dir.join("catalogue.parquet");
    write_parquet(&catalogue_path, records_batch(rows)?)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        rows: rows.len(),
        files: vec![manifest_entry("catalogue", dir, &catalogue_path)?],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest_path, bytes).with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Read the record log and render it to CSV and, if `parquet_dir` is set,
/// a Parquet snapshot.
pub async fn export_record_log(
    log_path: &Path,
    csv_path: Option<&Path>,
    parquet_dir: Option<&Path>,
    defaults: &OutputDefaults,
) -> Result<ExportSummary> {
    let contents = read_record_log(log_path)
        .await
        .with_context(|| format!("reading record log {}", log_path.display()))?;
    let rows = render_rows(&contents.records, defaults);

    let mut summary = ExportSummary {
        rows: rows.len(),
        done: rows.iter().filter(|r| r.status == RecordStatus::Done).count(),
        failed: rows.iter().filter(|r| r.status == RecordStatus::Failed).count(),
        ..Default::default()
    };

    if let Some(csv_path) = csv_path {
        let bytes = csv_bytes(&rows)?;
        write_atomically(csv_path, &bytes)
            .await
            .with_context(|| format!("writing {}", csv_path.display()))?;
        summary.csv_path = Some(csv_path.to_path_buf());
    }
    if let Some(dir) = parquet_dir {
        summary.manifest_path = Some(write_parquet_snapshot(dir, &rows)?);
    }

    info!(
        rows = summary.rows,
        done = summary.done,
        failed = summary.failed,
        csv = ?summary.csv_path,
        manifest = ?summary.manifest_path,
        "export written"
    );
    Ok(summary)
}
