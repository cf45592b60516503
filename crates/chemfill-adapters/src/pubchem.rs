//! PubChem PUG REST client. Looks compounds up by registry number and,
//! optionally, by the row's display name when the number is unknown.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chemfill_core::{FieldName, SourceResult};
use chemfill_storage::HttpFetcher;
use reqwest::Url;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{text_or_none, FetchFailure, LookupMode, SourceClient};

pub const DEFAULT_BASE_URL: &str = "https://pubchem.ncbi.nlm.nih.gov";
const PROPERTY_LIST: &str = "Title,IUPACName,MolecularFormula,MolecularWeight";
const MAX_SYNONYMS: usize = 5;

pub struct PubChemClient {
    source_id: String,
    base_url: String,
    http: Arc<HttpFetcher>,
    name_fallback: bool,
}

impl PubChemClient {
    pub fn new(
        source_id: impl Into<String>,
        base_url: impl Into<String>,
        http: Arc<HttpFetcher>,
        name_fallback: bool,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: base_url.into(),
            http,
            name_fallback,
        }
    }

    async fn lookup(&self, identifier: &str) -> Result<Option<BTreeMap<FieldName, Option<String>>>, FetchFailure> {
        let url = compound_url(&self.base_url, identifier, &["property", PROPERTY_LIST, "JSON"])?;
        let response = self.http.fetch_bytes(&self.source_id, &url).await?;
        let Some(mut fields) = parse_property_table(&response.body)? else {
            return Ok(None);
        };

        let url = compound_url(&self.base_url, identifier, &["synonyms", "JSON"])?;
        let synonyms = match self.http.fetch_bytes(&self.source_id, &url).await {
            Ok(response) => parse_synonyms(&response.body)?,
            Err(err) => match FetchFailure::from(err) {
                FetchFailure::NotFound => Vec::new(),
                other => return Err(other),
            },
        };
        if !synonyms.is_empty() {
            fields.insert(
                FieldName::Synonyms,
                Some(synonyms.into_iter().take(MAX_SYNONYMS).collect::<Vec<_>>().join("; ")),
            );
        }
        Ok(Some(fields))
    }
}

#[async_trait]
impl SourceClient for PubChemClient {
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
        let by_key = match self.lookup(key).await {
            Ok(found) => found,
            Err(FetchFailure::NotFound) => None,
            Err(other) => return Err(other),
        };

        let fields = match (by_key, hint_name) {
            (Some(fields), _) => Some(fields),
            (None, Some(name)) if self.name_fallback => {
                debug!(source_id = %self.source_id, key, name, "identifier unknown, retrying lookup by name");
                self.lookup(name).await?
            }
            (None, _) => None,
        };

        match fields {
            Some(mut fields) => {
                fields.insert(FieldName::CasNo, Some(key.to_string()));
                Ok(SourceResult::found(&self.source_id, fields))
            }
            None => Err(FetchFailure::NotFound),
        }
    }
}

pub(crate) fn compound_url(base_url: &str, identifier: &str, tail: &[&str]) -> Result<String, FetchFailure> {
    let mut url = Url::parse(base_url)
        .map_err(|e| FetchFailure::Malformed(format!("invalid base url {base_url}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| FetchFailure::Malformed(format!("base url {base_url} cannot carry a path")))?
        .pop_if_empty()
        .extend(["rest", "pug", "compound", "name", identifier])
        .extend(tail);
    Ok(url.into())
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_scalar_text(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Fields from a `PropertyTable` response; `None` when it lists no compound.
pub(crate) fn parse_property_table(
    body: &[u8],
) -> Result<Option<BTreeMap<FieldName, Option<String>>>, FetchFailure> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| FetchFailure::Malformed(format!("invalid PubChem JSON: {e}")))?;
    let properties = value
        .get("PropertyTable")
        .and_then(|t| t.get("Properties"))
        .and_then(|p| p.as_array())
        .ok_or_else(|| FetchFailure::Malformed("PubChem response has no PropertyTable".into()))?;
    let Some(first) = properties.first() else {
        return Ok(None);
    };

    let mut fields = BTreeMap::new();
    let name = json_str(first, &["Title"])
        .or_else(|| json_str(first, &["IUPACName"]))
        .and_then(text_or_none);
    fields.insert(FieldName::ChemicalName, name);
    fields.insert(
        FieldName::MolecularFormula,
        json_str(first, &["MolecularFormula"]).and_then(text_or_none),
    );
    fields.insert(FieldName::MolecularWeight, json_scalar_text(first, "MolecularWeight"));
    Ok(Some(fields))
}

pub(crate) fn parse_synonyms(body: &[u8]) -> Result<Vec<String>, FetchFailure> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| FetchFailure::Malformed(format!("invalid PubChem synonyms JSON: {e}")))?;
    Ok(value
        .get("InformationList")
        .and_then(|l| l.get("Information"))
        .and_then(|i| i.as_array())
        .and_then(|entries| entries.first())
        .and_then(|entry| entry.get("Synonym"))
        .and_then(|s| s.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|s| s.as_str().and_then(text_or_none))
                .collect()
        })
        .unwrap_or_default())
}
