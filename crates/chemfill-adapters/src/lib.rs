//! Source client contract and the chemical data sources behind it.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chemfill_core::SourceResult;
use chemfill_storage::{FetchError, HttpFetcher, RetryDisposition};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod catalog;
pub mod fixture;
pub mod pubchem;

pub use catalog::CatalogPageClient;
pub use fixture::{FixtureClient, FixtureEntry};
pub use pubchem::PubChemClient;

pub const CRATE_NAME: &str = "chemfill-adapters";

/// How a source can locate a compound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupMode {
    IdentifierOnly,
    IdentifierWithNameFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Network,
    Server(u16),
    RateLimited { retry_after: Option<Duration> },
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientKind::Network => f.write_str("network"),
            TransientKind::Server(status) => write!(f, "server status {status}"),
            TransientKind::RateLimited { retry_after: Some(d) } => {
                write!(f, "rate limited, retry after {}s", d.as_secs())
            }
            TransientKind::RateLimited { retry_after: None } => f.write_str("rate limited"),
        }
    }
}

/// Typed failure of a single fetch attempt. Only `Transient` is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    #[error("not found")]
    NotFound,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("transient failure ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },
}

impl FetchFailure {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        FetchFailure::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchFailure::Transient { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            FetchFailure::Transient {
                kind: TransientKind::RateLimited { .. },
                ..
            }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchFailure::Transient {
                kind: TransientKind::RateLimited { retry_after },
                ..
            } => *retry_after,
            _ => None,
        }
    }
}

impl From<FetchError> for FetchFailure {
    fn from(err: FetchError) -> Self {
        let message = err.to_string();
        match &err {
            FetchError::HttpStatus {
                status: 400 | 404 | 410,
                ..
            } => FetchFailure::NotFound,
            FetchError::HttpStatus { .. } if err.is_rate_limited() => FetchFailure::transient(
                TransientKind::RateLimited {
                    retry_after: err.retry_after(),
                },
                message,
            ),
            FetchError::HttpStatus { status, .. } if *status >= 500 => {
                FetchFailure::transient(TransientKind::Server(*status), message)
            }
            FetchError::HttpStatus { .. } => FetchFailure::Malformed(message),
            FetchError::Request(_) if err.disposition() == RetryDisposition::Retryable => {
                FetchFailure::transient(TransientKind::Network, message)
            }
            FetchError::Request(_) | FetchError::Closed => FetchFailure::Malformed(message),
        }
    }
}

/// One external data source. Implementations make a single attempt per call
/// and never retry internally.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source_id(&self) -> &str;
    fn lookup_mode(&self) -> LookupMode;

    async fn fetch(&self, key: &str, hint_name: Option<&str>) -> Result<SourceResult, FetchFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Pubchem,
    CatalogPage,
    Fixture,
}

/// Everything needed to build one client.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub source_id: String,
    pub kind: SourceKind,
    pub base_url: Option<String>,
    pub fixture_path: Option<PathBuf>,
    pub name_fallback: bool,
}

pub fn client_for_source(spec: &ClientSpec, http: Arc<HttpFetcher>) -> Result<Arc<dyn SourceClient>> {
    let client: Arc<dyn SourceClient> = match spec.kind {
        SourceKind::Pubchem => {
            let base = spec
                .base_url
                .clone()
                .unwrap_or_else(|| pubchem::DEFAULT_BASE_URL.to_string());
            Arc::new(PubChemClient::new(&spec.source_id, base, http, spec.name_fallback))
        }
        SourceKind::CatalogPage => {
            let base = spec
                .base_url
                .clone()
                .with_context(|| format!("source {} needs a base_url", spec.source_id))?;
            Arc::new(CatalogPageClient::new(&spec.source_id, base, http))
        }
        SourceKind::Fixture => {
            let path = spec
                .fixture_path
                .as_ref()
                .with_context(|| format!("source {} needs a fixture_path", spec.source_id))?;
            Arc::new(
                FixtureClient::from_path(&spec.source_id, path, spec.name_fallback)
                    .with_context(|| format!("loading fixtures for source {}", spec.source_id))?,
            )
        }
    };
    Ok(client)
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16, retry_after: Option<Duration>) -> FetchError {
        FetchError::HttpStatus {
            status,
            url: "https://example.test/".into(),
            retry_after,
        }
    }

    #[test]
    fn http_statuses_map_onto_failure_taxonomy() {
        assert_eq!(FetchFailure::from(status(404, None)), FetchFailure::NotFound);
        assert_eq!(FetchFailure::from(status(400, None)), FetchFailure::NotFound);
        assert!(matches!(
            FetchFailure::from(status(403, None)),
            FetchFailure::Malformed(_)
        ));
        let server = FetchFailure::from(status(503, None));
        assert!(server.is_transient());
        assert!(!server.is_rate_limited());

        let limited = FetchFailure::from(status(429, Some(Duration::from_secs(3))));
        assert!(limited.is_rate_limited());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn fixture_kind_requires_a_path() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let spec = ClientSpec {
            source_id: "offline".into(),
            kind: SourceKind::Fixture,
            base_url: None,
            fixture_path: None,
            name_fallback: false,
        };
        let err = client_for_source(&spec, http).err().expect("missing path");
        assert!(err.to_string().contains("fixture_path"));
    }

    #[test]
    fn text_or_none_collapses_whitespace() {
        assert_eq!(text_or_none("  White \n crystalline  solid "), Some("White crystalline solid".into()));
        assert_eq!(text_or_none(" \t"), None);
    }
}
