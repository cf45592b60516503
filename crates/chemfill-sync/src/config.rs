//! Pipeline configuration: YAML file, then `CHEMFILL_*` environment
//! variables, then command-line overrides.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chemfill_adapters::{ClientSpec, SourceKind};
use chemfill_storage::{HttpClientConfig, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PipelineError;
use crate::merge::PrecedenceTable;
use crate::resolver::ResolveMode;
use crate::retry::RetryConfig;
use crate::writer::FlushPolicy;

pub const MAX_CONCURRENCY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    /// Defaults to on for PubChem, off otherwise.
    #[serde(default)]
    pub name_fallback: Option<bool>,
}

impl SourceConfig {
    pub fn client_spec(&self) -> ClientSpec {
        ClientSpec {
            source_id: self.source_id.clone(),
            kind: self.kind,
            base_url: self.base_url.clone(),
            fixture_path: self.fixture_path.clone(),
            name_fallback: self
                .name_fallback
                .unwrap_or(self.kind == SourceKind::Pubchem),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputColumns {
    pub key_column: String,
    pub name_column: String,
}

impl Default for InputColumns {
    fn default() -> Self {
        Self {
            key_column: "CAS No".into(),
            name_column: "Chemical Name".into(),
        }
    }
}

/// Static text rendered for completed rows that no source enriched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputDefaults {
    pub product_code_prefix: String,
    pub storage: String,
    pub shipping_conditions: String,
    pub applications: String,
}

impl Default for OutputDefaults {
    fn default() -> Self {
        Self {
            product_code_prefix: "S1".into(),
            storage: "2-8°C Refrigerator".into(),
            shipping_conditions: "Ambient".into(),
            applications: "Used in chemical synthesis, pharmaceutical or industrial research.".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: concat!("chemfill/", env!("CARGO_PKG_VERSION")).into(),
            global_concurrency: 16,
            per_source_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub export_path: Option<PathBuf>,
    pub parquet_dir: Option<PathBuf>,
    pub start_index: Option<usize>,
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub flush_every_rows: usize,
    pub flush_interval_secs: u64,
    pub resolve_mode: ResolveMode,
    pub sources: Vec<SourceConfig>,
    pub precedence: PrecedenceTable,
    pub rules_path: Option<PathBuf>,
    pub input_columns: InputColumns,
    pub output_defaults: OutputDefaults,
    pub http: HttpSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("input.csv"),
            output_path: PathBuf::from("output/records.jsonl"),
            checkpoint_path: PathBuf::from("output/checkpoint.json"),
            export_path: None,
            parquet_dir: None,
            start_index: None,
            concurrency: 5,
            retry: RetryConfig::default(),
            flush_every_rows: 5,
            flush_interval_secs: 10,
            resolve_mode: ResolveMode::default(),
            sources: Vec::new(),
            precedence: PrecedenceTable::default(),
            rules_path: None,
            input_columns: InputColumns::default(),
            output_defaults: OutputDefaults::default(),
            http: HttpSettings::default(),
        }
    }
}

/// Values supplied on the command line; `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub checkpoint_path: Option<PathBuf>,
    pub export_path: Option<PathBuf>,
    pub parquet_dir: Option<PathBuf>,
    pub start_index: Option<usize>,
    pub concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing pipeline configuration")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// File (if any) + process environment + `overrides`. Validation is left
    /// to the caller since `export` and `status` need no sources.
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.apply_overrides(overrides);
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CHEMFILL_INPUT") {
            self.input_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CHEMFILL_OUTPUT") {
            self.output_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CHEMFILL_CHECKPOINT") {
            self.checkpoint_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CHEMFILL_EXPORT") {
            self.export_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CHEMFILL_USER_AGENT") {
            self.http.user_agent = v;
        }
        if let Some(v) = parse_var(&lookup, "CHEMFILL_START_INDEX") {
            self.start_index = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "CHEMFILL_CONCURRENCY") {
            self.concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "CHEMFILL_MAX_ATTEMPTS") {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "CHEMFILL_HTTP_TIMEOUT_SECS") {
            self.http.timeout_secs = v;
        }
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(v) = &overrides.input_path {
            self.input_path = v.clone();
        }
        if let Some(v) = &overrides.output_path {
            self.output_path = v.clone();
        }
        if let Some(v) = &overrides.checkpoint_path {
            self.checkpoint_path = v.clone();
        }
        if let Some(v) = &overrides.export_path {
            self.export_path = Some(v.clone());
        }
        if let Some(v) = &overrides.parquet_dir {
            self.parquet_dir = Some(v.clone());
        }
        if let Some(v) = overrides.start_index {
            self.start_index = Some(v);
        }
        if let Some(v) = overrides.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = overrides.max_attempts {
            self.retry.max_attempts = v;
        }
        if let Some(v) = overrides.base_delay_ms {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = overrides.max_delay_ms {
            self.retry.max_delay_ms = v;
        }
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::Config(msg));

        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }

        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if source.source_id.trim().is_empty() {
                return invalid("every source needs a source_id".into());
            }
            if !seen.insert(source.source_id.as_str()) {
                return invalid(format!("source {} is configured twice", source.source_id));
            }
        }

        let enabled: Vec<&str> = self.enabled_sources().map(|s| s.source_id.as_str()).collect();
        if enabled.is_empty() {
            return invalid("at least one source must be enabled".into());
        }
        if let Some(missing) = enabled
            .iter()
            .find(|id| !self.precedence.default.iter().any(|p| p == *id))
        {
            return invalid(format!(
                "precedence.default must list every enabled source; {missing} is missing"
            ));
        }
        if let Some(unknown) = self
            .precedence
            .referenced_sources()
            .find(|id| !seen.contains(id))
        {
            return invalid(format!("precedence references unknown source {unknown}"));
        }
        Ok(())
    }

    /// Concurrency clamped to `1..=MAX_CONCURRENCY`.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            every_rows: self.flush_every_rows.max(1),
            interval: Duration::from_secs(self.flush_interval_secs.max(1)),
        }
    }

    /// Precedence restricted to enabled sources, so disabled ones never win.
    pub fn active_precedence(&self) -> PrecedenceTable {
        let enabled: BTreeSet<&str> = self.enabled_sources().map(|s| s.source_id.as_str()).collect();
        let keep = |order: &Vec<String>| -> Vec<String> {
            order
                .iter()
                .filter(|id| enabled.contains(id.as_str()))
                .cloned()
                .collect()
        };
        PrecedenceTable {
            default: keep(&self.precedence.default),
            fields: self
                .precedence
                .fields
                .iter()
                .map(|(field, order)| (*field, keep(order)))
                .collect(),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let source_buckets: HashMap<String, TokenBucketConfig> = self
            .enabled_sources()
            .filter_map(|s| {
                let bucket = TokenBucketConfig::per_second(s.requests_per_second?)?;
                Some((s.source_id.clone(), bucket))
            })
            .collect();
        HttpClientConfig {
            timeout: Duration::from_secs(self.http.timeout_secs.max(1)),
            user_agent: Some(self.http.user_agent.clone()),
            global_concurrency: self.http.global_concurrency.max(1),
            per_source_concurrency: self.http.per_source_concurrency.max(1),
            token_bucket: None,
            source_buckets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chemfill_core::FieldName;

    const SAMPLE: &str = r#"
input_path: data/catalogue.csv
concurrency: 8
retry:
  max_attempts: 4
sources:
  - source_id: pubchem
    kind: pubchem
    requests_per_second: 4
  - source_id: vendor
    kind: catalog_page
    base_url: https://vendor.example
  - source_id: offline
    kind: fixture
    fixture_path: fixtures/offline.yaml
    enabled: false
precedence:
  default: [pubchem, vendor]
  fields:
    appearance: [vendor, offline, pubchem]
"#;

    #[test]
    fn yaml_fills_unspecified_settings_with_defaults() {
        let config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.input_path, PathBuf::from("data/catalogue.csv"));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.base_delay_ms, 2_000);
        assert_eq!(config.flush_every_rows, 5);
        assert_eq!(config.input_columns.key_column, "CAS No");
        assert_eq!(config.resolve_mode, ResolveMode::AllSources);
        assert!(config.sources[0].client_spec().name_fallback);
        assert!(!config.sources[1].client_spec().name_fallback);
        assert!(config.http_client_config().source_buckets.contains_key("pubchem"));
    }

    #[test]
    fn active_precedence_drops_disabled_sources() {
        let config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        let table = config.active_precedence();
        assert_eq!(table.order_for(FieldName::Appearance), ["vendor", "pubchem"]);
        assert_eq!(table.order_for(FieldName::ChemicalName), ["pubchem", "vendor"]);
    }

    #[test]
    fn env_then_overrides_win() {
        let mut config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("CHEMFILL_CONCURRENCY", "12"),
            ("CHEMFILL_START_INDEX", "not-a-number"),
            ("CHEMFILL_OUTPUT", "env/records.jsonl"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.concurrency, 12);
        assert_eq!(config.start_index, None);
        assert_eq!(config.output_path, PathBuf::from("env/records.jsonl"));

        config.apply_overrides(&ConfigOverrides {
            concurrency: Some(200),
            start_index: Some(10),
            ..Default::default()
        });
        assert_eq!(config.start_index, Some(10));
        assert_eq!(config.effective_concurrency(), MAX_CONCURRENCY);
    }

    #[test]
    fn precedence_must_cover_enabled_sources() {
        let mut config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        config.precedence.default = vec!["pubchem".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("vendor"), "{err}");

        let mut config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        config
            .precedence
            .fields
            .insert(FieldName::Storage, vec!["nobody".into()]);
        assert!(config.validate().unwrap_err().to_string().contains("nobody"));
    }

    #[test]
    fn rejects_zero_limits_and_empty_source_lists() {
        let mut config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        config.concurrency = 0;
        assert!(config.validate().is_err());

        assert!(PipelineConfig::default().validate().is_err());
    }
}
