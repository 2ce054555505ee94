// SPDX-License-Identifier: MIT OR Apache-2.0
//! `{field_value}`/`{value}` template substitution in source configs.

use serde_json::Value;

/// Replace every `{field_value}` and `{value}` occurrence in `template`
/// with `value`'s string form (strings are substituted bare; everything
/// else uses its JSON form).
pub fn substitute(template: &str, value: &str) -> String {
    template.replace("{field_value}", value).replace("{value}", value)
}

/// Recursively substitute string leaves of a JSON value, used for
/// mongodb/postgresql query templates whose leaves may be nested.
pub fn substitute_json(template: &Value, value: &str) -> Value {
    match template {
        Value::String(s) => Value::String(substitute(s, value)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_json(v, value)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_json(v, value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_field_value_placeholder() {
        assert_eq!(
            substitute("https://api.example.com/users/{field_value}", "u-1"),
            "https://api.example.com/users/u-1"
        );
    }

    #[test]
    fn substitutes_value_placeholder() {
        assert_eq!(substitute("key:{value}", "abc"), "key:abc");
    }

    #[test]
    fn substitute_json_recurses_into_object_leaves() {
        let template = json!({"user_id": "{field_value}", "active": true});
        let result = substitute_json(&template, "u-1");
        assert_eq!(result["user_id"], json!("u-1"));
        assert_eq!(result["active"], json!(true));
    }
}
