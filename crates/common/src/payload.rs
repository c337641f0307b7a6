//! Schemaless request/response payloads exchanged with downstream services.

use serde_json::{Map, Value};

/// A schemaless key → value mapping carried by service calls.
pub type Payload = Map<String, Value>;

/// Key fragments that mark a payload value as secret.
const SECRET_KEY_MARKERS: &[&str] = &["password", "secret", "token", "api_key", "authorization"];

/// Placeholder written in place of redacted values.
pub const REDACTED: &str = "***";

/// Convenience accessors over [`Payload`].
pub trait PayloadExt {
    /// Returns true if `key` exists and is not `null`.
    fn is_present(&self, key: &str) -> bool;

    /// Returns the value at `key` as a string slice, if it is a string.
    fn str_field(&self, key: &str) -> Option<&str>;

    /// Returns a deep copy with every secret-looking value replaced by [`REDACTED`].
    fn redacted(&self) -> Payload;

    /// Returns a deterministic textual form of the payload.
    ///
    /// Keys are emitted in sorted order, so equal payloads always
    /// produce equal strings.
    fn canonical(&self) -> String;
}

impl PayloadExt for Payload {
    fn is_present(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !v.is_null())
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn redacted(&self) -> Payload {
        self.iter()
            .map(|(key, value)| {
                if is_secret_key(key) {
                    (key.clone(), Value::String(REDACTED.to_string()))
                } else {
                    (key.clone(), redact_value(value))
                }
            })
            .collect()
    }

    fn canonical(&self) -> String {
        let mut out = String::new();
        write_canonical(&Value::Object(self.clone()), &mut out);
        out
    }
}

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_KEY_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(map.redacted()),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
