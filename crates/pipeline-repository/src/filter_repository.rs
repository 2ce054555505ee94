// SPDX-License-Identifier: MIT OR Apache-2.0
//! Relational filter rule repository, backed by PostgreSQL via `sqlx`.

use async_trait::async_trait;
use pipeline_envelope::FilterRule;
use pipeline_error::{ErrorCode, PipelineError};
use sqlx::PgPool;
use sqlx::Row;

/// Loads the active filter rule set in the stage's canonical order.
#[async_trait]
pub trait FilterRuleRepository: Send + Sync {
    /// Return only `enabled = true` rules, ordered by descending `priority`
    /// and ascending `created_at` as a tie-break.
    async fn load_active_rules(&self) -> Result<Vec<FilterRule>, PipelineError>;
}

/// `filtering_rules(id, name, expression, priority, enabled, created_at,
/// updated_at)` backed implementation. `rule_versions` and
/// `rule_audit_logs` are written by the control plane, not read here.
pub struct PostgresFilterRuleRepository {
    pool: PgPool,
}

impl PostgresFilterRuleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FilterRuleRepository for PostgresFilterRuleRepository {
    async fn load_active_rules(&self) -> Result<Vec<FilterRule>, PipelineError> {
        let rows = sqlx::query(
            "SELECT id, name, expression, priority, enabled, created_at, updated_at \
             FROM filtering_rules \
             WHERE enabled = true \
             ORDER BY priority DESC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| repository_error(&e))?;

        rows.into_iter()
            .map(|row| {
                Ok(FilterRule {
                    id: row.try_get("id").map_err(|e| repository_error(&e))?,
                    name: row.try_get("name").map_err(|e| repository_error(&e))?,
                    expression: row
                        .try_get("expression")
                        .map_err(|e| repository_error(&e))?,
                    priority: row.try_get("priority").map_err(|e| repository_error(&e))?,
                    enabled: row.try_get("enabled").map_err(|e| repository_error(&e))?,
                    created_at: row
                        .try_get("created_at")
                        .map_err(|e| repository_error(&e))?,
                    updated_at: row
                        .try_get("updated_at")
                        .map_err(|e| repository_error(&e))?,
                })
            })
            .collect()
    }
}

/// Classify a `sqlx::Error` per the pipeline's error taxonomy: connection
/// and pool exhaustion failures are transient (retry at the caller's
/// reload cadence); everything else — decode errors, constraint
/// violations, a missing table — is fatal and surfaces to the supervisor.
fn repository_error(e: &sqlx::Error) -> PipelineError {
    let code = match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
            ErrorCode::StoreTimeout
        }
        _ => ErrorCode::RepositoryFatal,
    };
    PipelineError::new(code, format!("filter rule repository error: {e}"))
}
