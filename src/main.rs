//! Non-interactive stress-test runner.
//!
//! Configuration comes from environment variables; Ctrl-C stops the run and
//! finalizes it as cancelled. The interactive front end lives elsewhere and
//! drives the same [`restress::StressExecutor`] API.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use restress::{ExecutionConfig, RequestSpec, StressConfig, StressExecutor, StoreManager, TlsConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Stress test failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = StressConfig::from_env()?;
    let request = request_from_env()?;
    let tls = tls_from_env();
    let db_path = env::var("DB_PATH").unwrap_or_else(|_| "restress.db".to_string());

    let manager = Arc::new(StoreManager::open(&db_path)?);
    let executor = Arc::new(StressExecutor::new(
        ExecutionConfig {
            config,
            request,
            tls: if tls.is_empty() { None } else { Some(tls) },
        },
        manager,
    )?);

    executor.start()?;

    // Ctrl-C cancels the scope; wait() below observes the cancellation and
    // finalizes the run.
    let stopper = executor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping run");
            let _ = stopper.stop().await;
        }
    });

    let run = executor.wait().await?;

    info!(
        run_id = run.id,
        status = run.status.as_str(),
        sent = run.total_sent,
        completed = run.total_completed,
        errors = run.total_errors,
        validation_errors = run.total_validation_errors,
        avg_ms = run.avg_duration_ms,
        p50_ms = run.p50_duration_ms,
        p95_ms = run.p95_duration_ms,
        p99_ms = run.p99_duration_ms,
        "Stress test finished"
    );

    Ok(())
}

/// Builds the request template from environment variables.
///
/// `HEADERS` uses `Name:Value` pairs separated by commas; `EXPECTED_STATUS`
/// takes comma-separated codes or class tokens (`200,201` or `2xx`);
/// `EXPECTED_BODY_FIELDS` takes `field=value` pairs where a value wrapped in
/// slashes is treated as a regex.
fn request_from_env() -> Result<RequestSpec, Box<dyn std::error::Error + Send + Sync>> {
    let url = env::var("TARGET_URL").map_err(|_| "TARGET_URL must be set")?;
    let method = env::var("METHOD").unwrap_or_else(|_| "GET".to_string());

    let mut spec = RequestSpec::new(method, url);

    if let Ok(headers) = env::var("HEADERS") {
        for pair in headers.split(',').filter(|p| !p.trim().is_empty()) {
            let (name, value) = pair
                .split_once(':')
                .ok_or_else(|| format!("Invalid header '{pair}', expected 'Name:Value'"))?;
            spec.headers
                .push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    if let Ok(body) = env::var("BODY") {
        spec.body = Some(body.into_bytes());
    }

    if let Ok(expected) = env::var("EXPECTED_STATUS") {
        spec.expected_status = expected
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    spec.expected_body_exact = env::var("EXPECTED_BODY_EXACT").ok();
    spec.expected_body_contains = env::var("EXPECTED_BODY_CONTAINS").ok();
    spec.expected_body_pattern = env::var("EXPECTED_BODY_PATTERN").ok();

    if let Ok(fields) = env::var("EXPECTED_BODY_FIELDS") {
        let mut parsed = HashMap::new();
        for pair in fields.split(',').filter(|p| !p.trim().is_empty()) {
            let (field, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("Invalid field predicate '{pair}', expected 'field=value'"))?;
            parsed.insert(field.trim().to_string(), value.trim().to_string());
        }
        spec.expected_body_fields = parsed;
    }

    Ok(spec)
}

fn tls_from_env() -> TlsConfig {
    TlsConfig {
        client_cert_path: env::var("CLIENT_CERT_PATH").ok(),
        client_key_path: env::var("CLIENT_KEY_PATH").ok(),
        ca_cert_path: env::var("CA_CERT_PATH").ok(),
        insecure_skip_verify: env::var("SKIP_TLS_VERIFY")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false),
    }
}
