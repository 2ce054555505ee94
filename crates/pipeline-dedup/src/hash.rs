// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content hash computation over an envelope's hashable field mapping.

use md5::{Digest, Md5};
use pipeline_envelope::{HashAlgorithm, MessageEnvelope};
use serde_json::{Map, Value};
use sha2::Sha256;

/// Build the `{id, source} ∪ payload` mapping a dedup hash is computed
/// over. `id` and `source` take precedence over same-named payload
/// fields, matching the envelope's own identity.
pub fn hashable_fields(envelope: &MessageEnvelope) -> Map<String, Value> {
    let mut fields = envelope.payload.clone();
    fields.insert("id".to_string(), Value::String(envelope.id.clone()));
    fields.insert("source".to_string(), Value::String(envelope.source.clone()));
    fields
}

/// Concatenate `"<value>|"` for each field in `fields_to_hash`, in order,
/// substituting an empty string for an absent field, then hash the
/// buffer with `algorithm` and hex-encode the digest.
pub fn content_hash(
    fields: &Map<String, Value>,
    fields_to_hash: &[String],
    algorithm: HashAlgorithm,
) -> String {
    let mut buffer = String::new();
    for field in fields_to_hash {
        let value = fields.get(field).map(value_as_hash_text).unwrap_or_default();
        buffer.push_str(&value);
        buffer.push('|');
    }

    match algorithm {
        HashAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            hasher.update(buffer.as_bytes());
            format!("{:x}", hasher.finalize())
        }
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(buffer.as_bytes());
            format!("{:x}", hasher.finalize())
        }
    }
}

/// Render a field value as the text appended to the hash buffer. Strings
/// are taken verbatim (unquoted); everything else uses its JSON form.
fn value_as_hash_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The dedup key a content hash resolves to.
pub fn dedup_key(hash: &str) -> String {
    format!("dedup:{hash}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn envelope() -> MessageEnvelope {
        let mut payload = Map::new();
        payload.insert("order_id".to_string(), json!("o-1"));
        MessageEnvelope::new("m1", "orders", Utc::now(), payload)
    }

    #[test]
    fn hashable_fields_includes_id_and_source() {
        let env = envelope();
        let fields = hashable_fields(&env);
        assert_eq!(fields.get("id").unwrap(), "m1");
        assert_eq!(fields.get("source").unwrap(), "orders");
        assert_eq!(fields.get("order_id").unwrap(), "o-1");
    }

    #[test]
    fn content_hash_is_deterministic() {
        let env = envelope();
        let fields = hashable_fields(&env);
        let fields_to_hash = vec!["id".to_string(), "source".to_string()];
        let a = content_hash(&fields, &fields_to_hash, HashAlgorithm::Md5);
        let b = content_hash(&fields, &fields_to_hash, HashAlgorithm::Md5);
        assert_eq!(a, b);
    }

    #[test]
    fn different_algorithms_produce_different_hashes() {
        let env = envelope();
        let fields = hashable_fields(&env);
        let fields_to_hash = vec!["id".to_string()];
        let md5 = content_hash(&fields, &fields_to_hash, HashAlgorithm::Md5);
        let sha256 = content_hash(&fields, &fields_to_hash, HashAlgorithm::Sha256);
        assert_ne!(md5, sha256);
        assert_eq!(md5.len(), 32);
        assert_eq!(sha256.len(), 64);
    }

    #[test]
    fn missing_field_hashes_as_empty_string() {
        let env = envelope();
        let fields = hashable_fields(&env);
        let with_missing = vec!["id".to_string(), "absent_field".to_string()];
        let without = vec!["id".to_string()];
        let h1 = content_hash(&fields, &with_missing, HashAlgorithm::Md5);
        let h2 = content_hash(&fields, &without, HashAlgorithm::Md5);
        assert_ne!(h1, h2, "empty-string field still changes the buffer via the trailing separator");
    }

    #[test]
    fn field_order_changes_the_hash() {
        let env = envelope();
        let fields = hashable_fields(&env);
        let forward = vec!["id".to_string(), "source".to_string()];
        let reverse = vec!["source".to_string(), "id".to_string()];
        assert_ne!(
            content_hash(&fields, &forward, HashAlgorithm::Md5),
            content_hash(&fields, &reverse, HashAlgorithm::Md5)
        );
    }

    #[test]
    fn dedup_key_has_expected_prefix() {
        assert_eq!(dedup_key("abc123"), "dedup:abc123");
    }
}
