//! Resolved request template and TLS material paths.
//!
//! The engine receives a [`RequestSpec`] that is already fully resolved by
//! the file-format front end: exact method, URL, header strings and body
//! bytes. No variable expansion or header rewriting happens here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A fully resolved HTTP request plus the declarative validation predicates
/// to apply to each response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestSpec {
    /// HTTP verb, upper-case ("GET", "POST", ...).
    pub method: String,

    /// Absolute target URL.
    pub url: String,

    /// Header name/value pairs, sent exactly as given.
    #[serde(default)]
    pub headers: Vec<(String, String)>,

    /// Optional request body bytes.
    #[serde(default)]
    pub body: Option<Vec<u8>>,

    /// Expected status codes: specific codes ("201") or class tokens ("2xx").
    /// Empty means 200-299.
    #[serde(default)]
    pub expected_status: Vec<String>,

    /// Full-equality body predicate.
    #[serde(default)]
    pub expected_body_exact: Option<String>,

    /// Substring body predicate.
    #[serde(default)]
    pub expected_body_contains: Option<String>,

    /// Regex body predicate.
    #[serde(default)]
    pub expected_body_pattern: Option<String>,

    /// Top-level JSON field predicates: literal value or `/regex/`.
    #[serde(default)]
    pub expected_body_fields: HashMap<String, String>,
}

impl RequestSpec {
    /// Minimal spec for the given method and URL, no predicates.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    /// True when any response predicate beyond the status default is set.
    pub fn has_body_predicates(&self) -> bool {
        self.expected_body_exact.is_some()
            || self.expected_body_contains.is_some()
            || self.expected_body_pattern.is_some()
            || !self.expected_body_fields.is_empty()
    }

    /// Request payload size in bytes, as recorded on each metric row.
    pub fn body_size(&self) -> u64 {
        self.body.as_ref().map_or(0, |b| b.len() as u64)
    }
}

/// Paths to PEM materials for the run's HTTP client.
///
/// All fields are optional; cert and key must be supplied together for
/// mutual TLS. Materials are read once at client construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub ca_cert_path: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl TlsConfig {
    /// True when no field requires touching the TLS stack.
    pub fn is_empty(&self) -> bool {
        self.client_cert_path.is_none()
            && self.client_key_path.is_none()
            && self.ca_cert_path.is_none()
            && !self.insecure_skip_verify
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_spec_has_no_predicates() {
        let spec = RequestSpec::new("GET", "http://localhost/ping");
        assert!(!spec.has_body_predicates());
        assert!(spec.expected_status.is_empty());
        assert_eq!(spec.body_size(), 0);
    }

    #[test]
    fn test_body_size_counts_bytes() {
        let mut spec = RequestSpec::new("POST", "http://localhost/items");
        spec.body = Some(b"{\"a\":1}".to_vec());
        assert_eq!(spec.body_size(), 7);
    }

    #[test]
    fn test_field_predicate_marks_spec() {
        let mut spec = RequestSpec::new("GET", "http://localhost/u");
        spec.expected_body_fields
            .insert("id".to_string(), "/^user-\\d+$/".to_string());
        assert!(spec.has_body_predicates());
    }

    #[test]
    fn test_tls_config_empty() {
        assert!(TlsConfig::default().is_empty());

        let tls = TlsConfig {
            insecure_skip_verify: true,
            ..TlsConfig::default()
        };
        assert!(!tls.is_empty());
    }
}
