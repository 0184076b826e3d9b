use serde_json::Value;
use std::collections::HashMap;

/// Headers whose values must never reach the recording log.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-github-token",
    "x-hub-signature",
    "x-hub-signature-256",
];

/// JSON keys redacted wherever they appear in a recorded body.
const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "github_token",
    "webhook_secret",
    "secret",
    "private_key",
    "password",
];

const REDACTED: &str = "[REDACTED]";

pub struct Sanitizer;

impl Sanitizer {
    pub fn is_sensitive_header(header_name: &str) -> bool {
        let lower = header_name.to_lowercase();
        SENSITIVE_HEADERS.contains(&lower.as_str())
    }

    /// Copy of `headers` with sensitive values replaced.
    pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(key, value)| {
                let value = if Self::is_sensitive_header(key) {
                    REDACTED.to_string()
                } else {
                    value.clone()
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// Recursively redact sensitive keys in a JSON payload.
    pub fn sanitize_json(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, val)| {
                        let val = if SENSITIVE_KEYS.contains(&key.to_lowercase().as_str()) {
                            Value::String(REDACTED.to_string())
                        } else {
                            Self::sanitize_json(val)
                        };
                        (key.clone(), val)
                    })
                    .collect(),
            ),
            Value::Array(arr) => Value::Array(arr.iter().map(Self::sanitize_json).collect()),
            _ => value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_headers_are_redacted() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer ghp_abc".to_string());
        headers.insert("X-Hub-Signature-256".to_string(), "sha256=00".to_string());
        headers.insert("Accept".to_string(), "application/json".to_string());

        let sanitized = Sanitizer::sanitize_headers(&headers);

        assert_eq!(sanitized["Authorization"], REDACTED);
        assert_eq!(sanitized["X-Hub-Signature-256"], REDACTED);
        assert_eq!(sanitized["Accept"], "application/json");
    }

    #[test]
    fn test_nested_secrets_are_redacted() {
        let value = json!({
            "repository": { "name": "widgets" },
            "credentials": [{ "github_token": "ghp_abc", "Secret": "s3cr3t" }],
        });

        let sanitized = Sanitizer::sanitize_json(&value);

        assert_eq!(sanitized["repository"]["name"], "widgets");
        assert_eq!(sanitized["credentials"][0]["github_token"], REDACTED);
        assert_eq!(sanitized["credentials"][0]["Secret"], REDACTED);
    }
}
