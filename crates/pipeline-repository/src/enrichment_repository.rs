// SPDX-License-Identifier: MIT OR Apache-2.0
//! Document-store enrichment rule repository, backed by MongoDB.

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::Collection;
use pipeline_envelope::EnrichmentRule;
use pipeline_error::{ErrorCode, PipelineError};

/// Loads the active enrichment rule set in the stage's canonical order.
#[async_trait]
pub trait EnrichmentRuleRepository: Send + Sync {
    /// Return only `enabled = true` rules, ordered by ascending `priority`.
    async fn load_active_rules(&self) -> Result<Vec<EnrichmentRule>, PipelineError>;
}

/// `enrichment_rules` collection backed implementation.
pub struct MongoEnrichmentRuleRepository {
    collection: Collection<EnrichmentRule>,
}

impl MongoEnrichmentRuleRepository {
    pub fn new(collection: Collection<EnrichmentRule>) -> Self {
        Self { collection }
    }
}

#[async_trait]
impl EnrichmentRuleRepository for MongoEnrichmentRuleRepository {
    async fn load_active_rules(&self) -> Result<Vec<EnrichmentRule>, PipelineError> {
        use futures::TryStreamExt;

        let filter = doc! { "enabled": true };
        let sort = doc! { "priority": 1 };
        let find_options = mongodb::options::FindOptions::builder().sort(sort).build();

        let mut cursor = self
            .collection
            .find(filter)
            .with_options(find_options)
            .await
            .map_err(|e| repository_error(&e))?;

        let mut rules = Vec::new();
        while let Some(rule) = cursor.try_next().await.map_err(|e| repository_error(&e))? {
            rules.push(rule);
        }
        Ok(rules)
    }
}

/// Classify a `mongodb::error::Error` per the pipeline's error taxonomy.
/// Connection, I/O, and server-selection timeouts are transient; decode
/// failures and anything else are treated as fatal.
fn repository_error(e: &mongodb::error::Error) -> PipelineError {
    use mongodb::error::ErrorKind;

    let code = match e.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => ErrorCode::StoreTimeout,
        _ => ErrorCode::RepositoryFatal,
    };
    PipelineError::new(code, format!("enrichment rule repository error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::error::{Error as MongoError, ErrorKind};
    use std::sync::Arc;

    #[test]
    fn io_error_is_transient() {
        let kind = ErrorKind::Io(Arc::new(std::io::Error::other("connection reset")));
        let err = repository_error(&MongoError::from(kind));
        assert_eq!(err.code, ErrorCode::StoreTimeout);
    }

    #[test]
    fn other_errors_are_fatal() {
        let kind = ErrorKind::InvalidArgument {
            message: "bad filter".to_string(),
        };
        let err = repository_error(&MongoError::from(kind));
        assert_eq!(err.code, ErrorCode::RepositoryFatal);
    }
}
