use std::sync::Arc;

use chemfill_adapters::SourceClient;
use chemfill_core::{InputRow, SourceFailure, SourceResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::retry::RetryController;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    /// Query every source so later ones can fill fields earlier ones lack.
    #[default]
    AllSources,
    /// Stop at the first source that reports `found`.
    FirstAuthoritativeHit,
}

/// Tries the configured sources for a row in priority order.
pub struct FallbackResolver {
    clients: Vec<Arc<dyn SourceClient>>,
    retry: RetryController,
    mode: ResolveMode,
}

impl FallbackResolver {
    pub fn new(clients: Vec<Arc<dyn SourceClient>>, retry: RetryController, mode: ResolveMode) -> Self {
        Self {
            clients,
            retry,
            mode,
        }
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.clients.iter().map(|c| c.source_id())
    }

    /// Every attempted source's result, in priority order. Failures are
    /// folded into the results and never escape.
    pub async fn resolve(&self, row: &InputRow) -> Vec<SourceResult> {
        let mut results = Vec::with_capacity(self.clients.len());
        let key = row.key.as_str();
        let hint_name = row.hint_name.as_deref();

        for client in &self.clients {
            let client: &dyn SourceClient = client.as_ref();
            let source_id = client.source_id();
            let lookup = client.lookup_mode();
            let result = self
                .retry
                .execute(source_id, move || client.fetch(key, hint_name))
                .await;

            match &result.failure {
                None if result.found => {
                    debug!(row_index = row.index, key, source_id, ?lookup, "source found row")
                }
                None => debug!(row_index = row.index, key, source_id, ?lookup, "source has no data for row"),
                Some(SourceFailure::NotFound) => {
                    debug!(row_index = row.index, key, source_id, ?lookup, "source does not know key")
                }
                Some(SourceFailure::Malformed { message }) => warn!(
                    row_index = row.index,
                    key,
                    source_id,
                    ?lookup,
                    error = %message,
                    "source returned a malformed response"
                ),
                Some(SourceFailure::Exhausted { attempts, .. }) => warn!(
                    row_index = row.index,
                    key,
                    source_id,
                    ?lookup,
                    attempts,
                    "source gave up after transient failures"
                ),
            }

            let stop = result.found && self.mode == ResolveMode::FirstAuthoritativeHit;
            results.push(result);
            if stop {
                break;
            }
        }
        results
    }
}
