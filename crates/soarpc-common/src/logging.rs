//! Redaction of sensitive fields from logged request and response payloads.

use crate::types::Value;
use std::collections::BTreeSet;

/// Field names whose values are never allowed into the logs.
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "passphrase",
    "passwd",
    "secret",
    "security_code",
    "token",
    "auth_token",
    "api_key",
    "private_key",
];

const REDACTED: &str = "**REDACTED**";

/// Recursively replaces the values of sensitive fields before a payload is
/// handed to the logger. Matching is by exact field name, case-insensitive.
#[derive(Debug, Clone)]
pub struct Redactor {
    fields: BTreeSet<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl Redactor {
    /// Builds a redactor over the default field set plus `extra_fields`.
    pub fn new(extra_fields: &[String]) -> Self {
        let mut fields: BTreeSet<String> =
            DEFAULT_SENSITIVE_FIELDS.iter().map(|f| f.to_string()).collect();
        fields.extend(extra_fields.iter().map(|f| f.to_lowercase()));
        Self { fields }
    }

    /// Returns a copy of `value` with every sensitive field replaced.
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(key, entry)| {
                        if self.fields.contains(&key.to_lowercase()) {
                            (key.clone(), Value::Str(REDACTED.to_owned()))
                        } else {
                            (key.clone(), self.redact(entry))
                        }
                    })
                    .collect(),
            ),
            Value::List(list) => Value::List(list.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }

    /// Redacts and renders a payload for a log line.
    pub fn describe(&self, value: &Value) -> String {
        format!("{:?}", self.redact(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{vlist, vmap};

    #[test]
    fn test_redacts_nested_sensitive_fields() {
        let redactor = Redactor::default();
        let payload = vmap! {
            "username" => "sam",
            "password" => "hunter2",
            "nested" => vmap! { "Token" => "abc", "count" => 3 },
            "entries" => vlist![vmap! { "secret" => "x" }],
        };
        let redacted = redactor.redact(&payload);
        assert_eq!(redacted.get("password").and_then(Value::as_str), Some(REDACTED));
        assert_eq!(
            redacted.get("nested").and_then(|n| n.get("Token")).and_then(Value::as_str),
            Some(REDACTED)
        );
        assert_eq!(redacted.get("username").and_then(Value::as_str), Some("sam"));
        assert_eq!(
            redacted.get("nested").and_then(|n| n.get("count")).and_then(Value::as_i64),
            Some(3)
        );
    }

    #[test]
    fn test_extra_fields_extend_the_default_set() {
        let redactor = Redactor::new(&["ssn".to_owned()]);
        let redacted = redactor.redact(&vmap! { "ssn" => "123-45-6789" });
        assert_eq!(redacted.get("ssn").and_then(Value::as_str), Some(REDACTED));
    }
}
