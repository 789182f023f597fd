//! Response validation against the template's declarative predicates.
//!
//! Predicates are evaluated in a fixed order: status code, exact body,
//! body substring, body regex, JSON field match. The first failure wins and
//! later predicates are not evaluated. Validation only ever applies to
//! responses that completed the transport exchange; an invalid regex or a
//! non-JSON body is a validation failure, never a network error.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::request::RequestSpec;

/// A failed predicate, with a human-readable message stored on the metric.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("Status code mismatch: expected {expected}, got {actual}")]
    StatusCodeMismatch { expected: String, actual: u16 },

    #[error("Invalid expected status token '{0}': use a code like 201 or a class like 2xx")]
    InvalidStatusToken(String),

    #[error("Body mismatch: expected exactly {expected:?}, got {actual:?}")]
    BodyMismatch { expected: String, actual: String },

    #[error("Body does not contain expected substring: {0:?}")]
    BodyNotContains(String),

    #[error("Body does not match pattern: {0}")]
    BodyNotMatches(String),

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Body is not a JSON object: {0}")]
    NotJsonObject(String),

    #[error("JSON field '{0}' not found in response body")]
    FieldMissing(String),

    #[error("JSON field '{field}' mismatch: expected {expected:?}, got {actual:?}")]
    FieldMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("JSON field '{field}' does not match pattern {pattern}: got {actual:?}")]
    FieldPatternMismatch {
        field: String,
        pattern: String,
        actual: String,
    },
}

/// Checks one response against every predicate on the template.
///
/// # Errors
/// Returns the first failed predicate; subsequent predicates are skipped.
pub fn validate_response(
    spec: &RequestSpec,
    status_code: u16,
    body: &str,
) -> Result<(), ValidationFailure> {
    validate_status(&spec.expected_status, status_code)?;

    if let Some(expected) = &spec.expected_body_exact {
        if body != expected {
            return Err(ValidationFailure::BodyMismatch {
                expected: truncate(expected),
                actual: truncate(body),
            });
        }
    }

    if let Some(substring) = &spec.expected_body_contains {
        if !body.contains(substring.as_str()) {
            return Err(ValidationFailure::BodyNotContains(substring.clone()));
        }
    }

    if let Some(pattern) = &spec.expected_body_pattern {
        let re = compile(pattern)?;
        if !re.is_match(body) {
            return Err(ValidationFailure::BodyNotMatches(pattern.clone()));
        }
    }

    if !spec.expected_body_fields.is_empty() {
        validate_fields(&spec.expected_body_fields, body)?;
    }

    Ok(())
}

/// Status predicate: pass iff the code matches any expected token.
/// An empty token list means 200-299.
fn validate_status(expected: &[String], status_code: u16) -> Result<(), ValidationFailure> {
    if expected.is_empty() {
        return if (200..=299).contains(&status_code) {
            Ok(())
        } else {
            Err(ValidationFailure::StatusCodeMismatch {
                expected: "2xx".to_string(),
                actual: status_code,
            })
        };
    }

    for token in expected {
        if status_matches(token, status_code)? {
            return Ok(());
        }
    }

    Err(ValidationFailure::StatusCodeMismatch {
        expected: expected.join(","),
        actual: status_code,
    })
}

/// Matches one token: a specific code ("201") or a class range ("2xx").
fn status_matches(token: &str, status_code: u16) -> Result<bool, ValidationFailure> {
    let token = token.trim();

    if let Ok(code) = token.parse::<u16>() {
        return Ok(code == status_code);
    }

    let lower = token.to_ascii_lowercase();
    if lower.len() == 3 && lower.ends_with("xx") {
        if let Some(class) = lower.chars().next().and_then(|c| c.to_digit(10)) {
            let base = class as u16 * 100;
            return Ok((base..base + 100).contains(&status_code));
        }
    }

    Err(ValidationFailure::InvalidStatusToken(token.to_string()))
}

/// Partial JSON object match: every predicate key must exist; values compare
/// as literal strings, or as regexes when wrapped in `/.../`.
fn validate_fields(
    fields: &HashMap<String, String>,
    body: &str,
) -> Result<(), ValidationFailure> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| ValidationFailure::NotJsonObject(e.to_string()))?;

    let object = parsed
        .as_object()
        .ok_or_else(|| ValidationFailure::NotJsonObject("top-level value is not an object".to_string()))?;

    for (field, expected) in fields {
        let value = object
            .get(field)
            .ok_or_else(|| ValidationFailure::FieldMissing(field.clone()))?;
        let actual = render_json_value(value);

        if let Some(pattern) = regex_literal(expected) {
            let re = compile(pattern)?;
            if !re.is_match(&actual) {
                return Err(ValidationFailure::FieldPatternMismatch {
                    field: field.clone(),
                    pattern: expected.clone(),
                    actual,
                });
            }
        } else if actual != *expected {
            return Err(ValidationFailure::FieldMismatch {
                field: field.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    Ok(())
}

/// Inner pattern of a `/.../` literal, or None for plain strings.
fn regex_literal(s: &str) -> Option<&str> {
    if s.len() >= 2 && s.starts_with('/') && s.ends_with('/') {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

/// Renders a JSON value in its default string form, matching how a user
/// would read the field: strings unquoted, scalars via Display, containers
/// as compact JSON.
fn render_json_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn compile(pattern: &str) -> Result<Regex, ValidationFailure> {
    Regex::new(pattern).map_err(|e| ValidationFailure::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Bounds error-message payloads so metric rows stay readable.
fn truncate(s: &str) -> String {
    const LIMIT: usize = 100;
    if s.len() > LIMIT {
        let mut end = LIMIT;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RequestSpec {
        RequestSpec::new("GET", "http://localhost/")
    }

    #[test]
    fn test_default_status_range() {
        assert!(validate_response(&spec(), 200, "").is_ok());
        assert!(validate_response(&spec(), 299, "").is_ok());
        assert!(validate_response(&spec(), 301, "").is_err());
        assert!(validate_response(&spec(), 404, "").is_err());
    }

    #[test]
    fn test_explicit_status_codes() {
        let mut s = spec();
        s.expected_status = vec!["200".to_string(), "201".to_string()];
        assert!(validate_response(&s, 201, "").is_ok());
        assert!(validate_response(&s, 204, "").is_err());
    }

    #[test]
    fn test_status_class_token() {
        let mut s = spec();
        s.expected_status = vec!["4xx".to_string()];
        assert!(validate_response(&s, 404, "").is_ok());
        assert!(validate_response(&s, 499, "").is_ok());
        assert!(validate_response(&s, 400, "").is_ok());
        assert!(validate_response(&s, 500, "").is_err());
        assert!(validate_response(&s, 200, "").is_err());
    }

    #[test]
    fn test_invalid_status_token_is_validation_error() {
        let mut s = spec();
        s.expected_status = vec!["2x".to_string()];
        let err = validate_response(&s, 200, "").unwrap_err();
        assert!(matches!(err, ValidationFailure::InvalidStatusToken(_)));
    }

    #[test]
    fn test_body_exact() {
        let mut s = spec();
        s.expected_body_exact = Some("expected body".to_string());
        assert!(validate_response(&s, 200, "expected body").is_ok());

        let err = validate_response(&s, 200, "different body").unwrap_err();
        assert!(err.to_string().contains("Body mismatch"));
    }

    #[test]
    fn test_body_contains() {
        let mut s = spec();
        s.expected_body_contains = Some("world".to_string());
        assert!(validate_response(&s, 200, "hello world").is_ok());
        assert!(validate_response(&s, 200, "hello").is_err());
    }

    #[test]
    fn test_body_pattern() {
        let mut s = spec();
        s.expected_body_pattern = Some(r"^id=\d+$".to_string());
        assert!(validate_response(&s, 200, "id=42").is_ok());
        assert!(validate_response(&s, 200, "id=abc").is_err());
    }

    #[test]
    fn test_invalid_pattern_is_validation_error() {
        let mut s = spec();
        s.expected_body_pattern = Some("(unclosed".to_string());
        let err = validate_response(&s, 200, "anything").unwrap_err();
        assert!(matches!(err, ValidationFailure::InvalidPattern { .. }));
    }

    #[test]
    fn test_status_checked_before_body() {
        let mut s = spec();
        s.expected_body_exact = Some("x".to_string());
        let err = validate_response(&s, 500, "y").unwrap_err();
        assert!(matches!(err, ValidationFailure::StatusCodeMismatch { .. }));
    }

    #[test]
    fn test_json_fields_literal_and_regex() {
        let mut s = spec();
        s.expected_body_fields
            .insert("id".to_string(), r"/^user-\d+$/".to_string());
        s.expected_body_fields
            .insert("email".to_string(), r"/.*@example\.com$/".to_string());
        s.expected_body_fields
            .insert("count".to_string(), "42".to_string());

        let body = r#"{"id":"user-12345","email":"a@example.com","count":42}"#;
        assert!(validate_response(&s, 200, body).is_ok());

        let wrong_count = r#"{"id":"user-12345","email":"a@example.com","count":43}"#;
        let err = validate_response(&s, 200, wrong_count).unwrap_err();
        assert!(matches!(err, ValidationFailure::FieldMismatch { .. }));
    }

    #[test]
    fn test_json_field_missing() {
        let mut s = spec();
        s.expected_body_fields
            .insert("token".to_string(), "abc".to_string());
        let err = validate_response(&s, 200, r#"{"id":1}"#).unwrap_err();
        assert_eq!(err, ValidationFailure::FieldMissing("token".to_string()));
    }

    #[test]
    fn test_non_json_body_with_fields_is_validation_error() {
        let mut s = spec();
        s.expected_body_fields
            .insert("id".to_string(), "1".to_string());
        let err = validate_response(&s, 200, "plain text").unwrap_err();
        assert!(matches!(err, ValidationFailure::NotJsonObject(_)));

        let err = validate_response(&s, 200, "[1,2,3]").unwrap_err();
        assert!(matches!(err, ValidationFailure::NotJsonObject(_)));
    }

    #[test]
    fn test_json_scalar_rendering() {
        let mut s = spec();
        s.expected_body_fields
            .insert("flag".to_string(), "true".to_string());
        s.expected_body_fields
            .insert("note".to_string(), "null".to_string());
        let body = r#"{"flag":true,"note":null}"#;
        assert!(validate_response(&s, 200, body).is_ok());
    }
}
