// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-dependency liveness checks, exposed on `GET /health`.

use async_trait::async_trait;

/// A single external dependency's liveness check (a broker connection, a
/// rule store, the dedup/enrichment cache).
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Name reported in the health response, e.g. `"postgres-filter-rules"`.
    fn name(&self) -> &str;

    /// Probe the dependency. `Ok(())` means healthy; `Err` carries a
    /// human-readable reason surfaced in the response body.
    async fn check(&self) -> Result<(), String>;
}

#[cfg(test)]
pub(crate) struct StaticChecker {
    pub name: String,
    pub healthy: bool,
}

#[cfg(test)]
#[async_trait]
impl HealthChecker for StaticChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<(), String> {
        if self.healthy {
            Ok(())
        } else {
            Err("dependency unreachable".to_string())
        }
    }
}
