// SPDX-License-Identifier: MIT OR Apache-2.0
//! The four enrichment source kinds, behind one [`EnrichmentProvider`]
//! trait dispatched by `source_type`, the way a concrete backend is
//! selected by name behind a capability trait.

use async_trait::async_trait;
use pipeline_envelope::{EnrichmentRule, SourceConfig};
use pipeline_error::{ErrorCode, PipelineError};
use serde_json::{Map, Value};

use crate::template::{substitute, substitute_json};

/// Fetches the record an enrichment rule's transformations read from.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Resolve `rule`'s source for `field_value`, returning the fetched
    /// record as a JSON mapping.
    async fn fetch(&self, rule: &EnrichmentRule, field_value: &str) -> Result<Value, PipelineError>;
}

/// HTTP API lookups, templating `field_value`/`value` into the
/// configured URL.
pub struct ApiProvider {
    client: reqwest::Client,
}

impl ApiProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EnrichmentProvider for ApiProvider {
    async fn fetch(&self, rule: &EnrichmentRule, field_value: &str) -> Result<Value, PipelineError> {
        let SourceConfig::Api {
            url,
            method,
            headers,
            timeout_ms,
        } = &rule.source_config
        else {
            return Err(config_mismatch(rule, "api"));
        };

        let resolved_url = substitute(url, field_value);
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| fetch_error(rule, format!("invalid HTTP method {method}: {e}")))?;

        let mut request = self.client.request(method, resolved_url);
        for (key, value) in headers {
            if let Some(value_str) = value.as_str() {
                request = request.header(key, value_str);
            }
        }
        if let Some(timeout_ms) = timeout_ms {
            request = request.timeout(std::time::Duration::from_millis(*timeout_ms));
        }

        let response = request
            .send()
            .await
            .map_err(|e| transient_fetch_error(rule, format!("api request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(fetch_error(
                rule,
                format!("api request returned status {}", response.status()),
            ));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| fetch_error(rule, format!("api response body was not valid JSON: {e}")))
    }
}

/// MongoDB document lookups.
pub struct MongoProvider {
    database: mongodb::Database,
}

impl MongoProvider {
    pub fn new(database: mongodb::Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl EnrichmentProvider for MongoProvider {
    async fn fetch(&self, rule: &EnrichmentRule, field_value: &str) -> Result<Value, PipelineError> {
        let SourceConfig::Query {
            collection, query, field, ..
        } = &rule.source_config
        else {
            return Err(config_mismatch(rule, "mongodb"));
        };

        let filter_json = match query {
            Some(template) => substitute_json(template, field_value),
            None => {
                let field = field
                    .as_ref()
                    .ok_or_else(|| config_mismatch(rule, "mongodb (no query or field configured)"))?;
                Value::Object(Map::from_iter([(field.clone(), Value::String(field_value.to_string()))]))
            }
        };

        let filter = bson::to_document(&filter_json)
            .map_err(|e| fetch_error(rule, format!("mongodb filter was not a valid document: {e}")))?;

        let coll = self.database.collection::<bson::Document>(collection);
        let document = coll
            .find_one(filter)
            .await
            .map_err(|e| transient_fetch_error(rule, format!("mongodb query failed: {e}")))?;

        match document {
            Some(doc) => bson::from_document(doc)
                .map_err(|e| fetch_error(rule, format!("mongodb document was not valid JSON: {e}"))),
            None => Err(PipelineError::new(
                ErrorCode::CacheMiss,
                format!("mongodb query for rule {} returned no document", rule.id),
            )),
        }
    }
}

/// PostgreSQL relational lookups. Only the `{field}={field_value}` filter
/// form is supported (the rule configuration always names a `field`); an
/// arbitrary query template, unlike mongodb's document filter, has no
/// safe parameterised representation here.
pub struct PostgresProvider {
    pool: sqlx::PgPool,
}

impl PostgresProvider {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnrichmentProvider for PostgresProvider {
    async fn fetch(&self, rule: &EnrichmentRule, field_value: &str) -> Result<Value, PipelineError> {
        let SourceConfig::Query { collection, field, .. } = &rule.source_config else {
            return Err(config_mismatch(rule, "postgresql"));
        };
        let field = field
            .as_ref()
            .ok_or_else(|| config_mismatch(rule, "postgresql (no field configured)"))?;

        let sql = format!("SELECT * FROM {collection} WHERE {field} = $1");
        let row = sqlx::query(&sql)
            .bind(field_value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| transient_fetch_error(rule, format!("postgresql query failed: {e}")))?;

        match row {
            Some(row) => Ok(pg_row_to_json(&row)),
            None => Err(PipelineError::new(
                ErrorCode::CacheMiss,
                format!("postgresql query for rule {} returned no row", rule.id),
            )),
        }
    }
}

/// Decode a Postgres row's common scalar column types into a JSON
/// mapping. Columns whose type doesn't match any attempted decode are
/// written as `null` rather than failing the whole row.
fn pg_row_to_json(row: &sqlx::postgres::PgRow) -> Value {
    use sqlx::{Column, Row};

    let mut map = Map::new();
    for column in row.columns() {
        let name = column.name();
        let value = decode_pg_column(row, name);
        map.insert(name.to_string(), value);
    }
    Value::Object(map)
}

fn decode_pg_column(row: &sqlx::postgres::PgRow, name: &str) -> Value {
    use sqlx::Row;

    if let Ok(v) = row.try_get::<i64, _>(name) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(name) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<bool, _>(name) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<String, _>(name) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<chrono::DateTime<chrono::Utc>, _>(name) {
        return Value::from(v.to_rfc3339());
    }
    Value::Null
}

/// Redis cache lookups with a `key_pattern` template.
pub struct CacheSourceProvider {
    conn: redis::aio::ConnectionManager,
}

impl CacheSourceProvider {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl EnrichmentProvider for CacheSourceProvider {
    async fn fetch(&self, rule: &EnrichmentRule, field_value: &str) -> Result<Value, PipelineError> {
        let SourceConfig::KeyPattern { key_pattern } = &rule.source_config else {
            return Err(config_mismatch(rule, "cache"));
        };

        let key = substitute(key_pattern, field_value);
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::AsyncCommands::get(&mut conn, &key)
            .await
            .map_err(|e| transient_fetch_error(rule, format!("cache source GET failed: {e}")))?;

        match raw {
            Some(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => Ok(value),
                Err(_) => Ok(Value::Object(Map::from_iter([(
                    "value".to_string(),
                    Value::String(text),
                )]))),
            },
            None => Err(PipelineError::new(
                ErrorCode::CacheMiss,
                format!("cache source lookup for rule {} missed", rule.id),
            )),
        }
    }
}

fn config_mismatch(rule: &EnrichmentRule, expected: &str) -> PipelineError {
    PipelineError::new(
        ErrorCode::ConfigInvalid,
        format!(
            "rule {} is source_type {expected:?} but source_config doesn't match",
            rule.id
        ),
    )
}

fn fetch_error(rule: &EnrichmentRule, message: impl Into<String>) -> PipelineError {
    PipelineError::new(ErrorCode::EnrichmentFetchFailed, message.into())
        .with_context("rule_id", rule.id.clone())
}

fn transient_fetch_error(rule: &EnrichmentRule, message: impl Into<String>) -> PipelineError {
    PipelineError::new(ErrorCode::NetworkRefused, message.into()).with_context("rule_id", rule.id.clone())
}
