//! Offline source backed by a YAML or JSON file of canned answers.
//!
//! ```yaml
//! entries:
//!   "50-00-0":
//!     outcome: found
//!     fields: { chemical_name: Formaldehyde, molecular_formula: CH2O }
//!   "BAD-KEY":
//!     outcome: not_found
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chemfill_core::{FieldName, SourceResult};
use serde::Deserialize;

use crate::{FetchFailure, LookupMode, SourceClient, TransientKind};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FixtureEntry {
    Found { fields: BTreeMap<FieldName, String> },
    Empty,
    NotFound,
    Malformed { message: String },
    Transient { message: String },
}

#[derive(Debug, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    entries: HashMap<String, FixtureEntry>,
}

pub struct FixtureClient {
    source_id: String,
    entries: HashMap<String, FixtureEntry>,
    name_fallback: bool,
}

impl FixtureClient {
    pub fn new(
        source_id: impl Into<String>,
        entries: HashMap<String, FixtureEntry>,
        name_fallback: bool,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            entries,
            name_fallback,
        }
    }

    pub fn from_path(source_id: &str, path: impl AsRef<Path>, name_fallback: bool) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: FixtureFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(source_id, file.entries, name_fallback))
    }

    fn entry_for(&self, key: &str, hint_name: Option<&str>) -> Option<&FixtureEntry> {
        self.entries.get(key).or_else(|| {
            hint_name
                .filter(|_| self.name_fallback)
                .and_then(|name| self.entries.get(name))
        })
    }
}

#[async_trait]
impl SourceClient for FixtureClient {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn lookup_mode(&self) -> LookupMode {
        if self.name_fallback {
            LookupMode::IdentifierWithNameFallback
        } else {
            LookupMode::IdentifierOnly
        }
    }

    async fn fetch(&self, key: &str, hint_name: Option<&str>) -> Result<SourceResult, FetchFailure> {
        match self.entry_for(key, hint_name) {
            None | Some(FixtureEntry::NotFound) => Err(FetchFailure::NotFound),
            Some(FixtureEntry::Empty) => Ok(SourceResult::empty(&self.source_id)),
            Some(FixtureEntry::Malformed { message }) => Err(FetchFailure::Malformed(message.clone())),
            Some(FixtureEntry::Transient { message }) => Err(FetchFailure::transient(
                TransientKind::Network,
                message.clone(),
            )),
            Some(FixtureEntry::Found { fields }) => Ok(SourceResult::found(
                &self.source_id,
                fields
                    .iter()
                    .map(|(name, value)| (*name, Some(value.clone())))
                    .collect(),
            )),
        }
    }
}
