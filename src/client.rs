//! HTTP client construction for one stress-test run.
//!
//! All workers of a run share a single connection-pooled client. The pool is
//! sized to the configured concurrency; TLS material, when supplied, is read
//! and validated once here, and any failure to load it aborts executor
//! construction.

use std::fs;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::StressConfig;
use crate::request::TlsConfig;

/// Idle connections are dropped after this long in the pool.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// TCP dial timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP keep-alive probe interval.
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Errors raised while assembling the shared client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to read {kind} file '{path}': {source}")]
    ReadPem {
        kind: &'static str,
        path: String,
        source: std::io::Error,
    },

    #[error("No PEM certificates found in '{0}'")]
    EmptyCertFile(String),

    #[error("Failed to parse PEM material in '{path}': {message}")]
    ParsePem { path: String, message: String },

    #[error("No PKCS#8 private keys found in '{0}'; the key must be PEM-encoded PKCS#8")]
    EmptyKeyFile(String),

    #[error("Failed to build client identity from cert+key PEM: {0}")]
    Identity(reqwest::Error),

    #[error("mTLS configuration incomplete: client cert and key must be set together")]
    IncompleteMtls,

    #[error("Failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Builds the shared client for one run.
///
/// Pool sizing follows the worker count; the overall request deadline equals
/// the config's request timeout (10s default). HTTP/2 is negotiated via ALPN
/// where the server supports it.
///
/// # Errors
/// Fails when TLS material cannot be read or parsed, or when reqwest rejects
/// the builder; either way the executor must not start.
pub fn build_client(
    config: &StressConfig,
    tls: Option<&TlsConfig>,
) -> Result<reqwest::Client, ClientError> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.concurrent_conns as usize)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        .timeout(config.request_timeout());

    if let Some(tls) = tls {
        builder = apply_tls(builder, tls)?;
    }

    debug!(
        pool_size = config.concurrent_conns,
        timeout_secs = config.request_timeout().as_secs(),
        "HTTP client configured"
    );

    Ok(builder.build()?)
}

fn apply_tls(
    mut builder: reqwest::ClientBuilder,
    tls: &TlsConfig,
) -> Result<reqwest::ClientBuilder, ClientError> {
    match (&tls.client_cert_path, &tls.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            builder = builder.identity(load_identity(cert_path, key_path)?);
            debug!(cert = %cert_path, "Configured mTLS client identity");
        }
        (None, None) => {}
        _ => return Err(ClientError::IncompleteMtls),
    }

    if let Some(ca_path) = &tls.ca_cert_path {
        for cert in load_ca_bundle(ca_path)? {
            builder = builder.add_root_certificate(cert);
        }
        debug!(ca = %ca_path, "Added CA bundle to server trust roots");
    }

    if tls.insecure_skip_verify {
        warn!("Skipping TLS certificate verification");
        builder = builder.danger_accept_invalid_certs(true);
    }

    Ok(builder)
}

/// Reads and validates the cert/key pair, then combines both PEM buffers
/// into one identity. Validation runs first so parse errors name the file
/// instead of surfacing as an opaque builder failure.
fn load_identity(cert_path: &str, key_path: &str) -> Result<reqwest::Identity, ClientError> {
    let cert_pem = fs::read(cert_path).map_err(|e| ClientError::ReadPem {
        kind: "client certificate",
        path: cert_path.to_string(),
        source: e,
    })?;
    let key_pem = fs::read(key_path).map_err(|e| ClientError::ReadPem {
        kind: "client key",
        path: key_path.to_string(),
        source: e,
    })?;

    let mut cursor = std::io::Cursor::new(cert_pem.as_slice());
    let certs: Vec<_> = rustls_pemfile::certs(&mut cursor).collect();
    if certs.is_empty() {
        return Err(ClientError::EmptyCertFile(cert_path.to_string()));
    }
    for cert in certs {
        cert.map_err(|e| ClientError::ParsePem {
            path: cert_path.to_string(),
            message: e.to_string(),
        })?;
    }

    let mut cursor = std::io::Cursor::new(key_pem.as_slice());
    let keys: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut cursor).collect();
    if keys.is_empty() {
        return Err(ClientError::EmptyKeyFile(key_path.to_string()));
    }
    for key in keys {
        key.map_err(|e| ClientError::ParsePem {
            path: key_path.to_string(),
            message: e.to_string(),
        })?;
    }

    let mut combined = Vec::with_capacity(cert_pem.len() + key_pem.len() + 1);
    combined.extend_from_slice(&cert_pem);
    if !cert_pem.ends_with(b"\n") && !key_pem.starts_with(b"\n") {
        combined.push(b'\n');
    }
    combined.extend_from_slice(&key_pem);

    reqwest::Identity::from_pem(&combined).map_err(ClientError::Identity)
}

/// Parses every certificate in a PEM bundle into trust roots.
fn load_ca_bundle(ca_path: &str) -> Result<Vec<reqwest::Certificate>, ClientError> {
    let ca_pem = fs::read(ca_path).map_err(|e| ClientError::ReadPem {
        kind: "CA bundle",
        path: ca_path.to_string(),
        source: e,
    })?;

    let mut cursor = std::io::Cursor::new(ca_pem.as_slice());
    let mut roots = Vec::new();
    for cert in rustls_pemfile::certs(&mut cursor) {
        let der = cert.map_err(|e| ClientError::ParsePem {
            path: ca_path.to_string(),
            message: e.to_string(),
        })?;
        let cert = reqwest::Certificate::from_der(der.as_ref()).map_err(|e| {
            ClientError::ParsePem {
                path: ca_path.to_string(),
                message: e.to_string(),
            }
        })?;
        roots.push(cert);
    }

    if roots.is_empty() {
        return Err(ClientError::EmptyCertFile(ca_path.to_string()));
    }

    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StressConfig {
        StressConfig {
            id: 0,
            name: "client-test".to_string(),
            request_file: "r.http".to_string(),
            profile_name: String::new(),
            concurrent_conns: 8,
            total_requests: 10,
            ramp_up_secs: 0,
            duration_secs: 0,
            timeout_secs: 2,
        }
    }

    #[test]
    fn test_build_without_tls() {
        assert!(build_client(&config(), None).is_ok());
    }

    #[test]
    fn test_build_with_empty_tls_config() {
        let tls = TlsConfig::default();
        assert!(build_client(&config(), Some(&tls)).is_ok());
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let tls = TlsConfig {
            client_cert_path: Some("client.crt".to_string()),
            ..TlsConfig::default()
        };
        let err = build_client(&config(), Some(&tls)).unwrap_err();
        assert!(matches!(err, ClientError::IncompleteMtls));
    }

    #[test]
    fn test_missing_cert_file_is_fatal() {
        let tls = TlsConfig {
            client_cert_path: Some("/nonexistent/client.crt".to_string()),
            client_key_path: Some("/nonexistent/client.key".to_string()),
            ..TlsConfig::default()
        };
        let err = build_client(&config(), Some(&tls)).unwrap_err();
        assert!(err.to_string().contains("client certificate"));
    }

    #[test]
    fn test_missing_ca_file_is_fatal() {
        let tls = TlsConfig {
            ca_cert_path: Some("/nonexistent/ca.pem".to_string()),
            ..TlsConfig::default()
        };
        assert!(build_client(&config(), Some(&tls)).is_err());
    }

    #[test]
    fn test_garbage_ca_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        fs::write(&path, "not a pem at all").unwrap();

        let tls = TlsConfig {
            ca_cert_path: Some(path.to_string_lossy().into_owned()),
            ..TlsConfig::default()
        };
        let err = build_client(&config(), Some(&tls)).unwrap_err();
        assert!(matches!(err, ClientError::EmptyCertFile(_)));
    }
}
