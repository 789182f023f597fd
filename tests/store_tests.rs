//! Store behavior: CRUD, uniqueness scoping, cascades, batches, ordering.

use chrono::{Duration as ChronoDuration, Utc};

use restress::{Metric, Run, RunStatus, StoreError, StoreManager, StressConfig};

fn sample_config(name: &str, profile: &str) -> StressConfig {
    StressConfig {
        id: 0,
        name: name.to_string(),
        request_file: "requests/login.http".to_string(),
        profile_name: profile.to_string(),
        concurrent_conns: 10,
        total_requests: 500,
        ramp_up_secs: 5,
        duration_secs: 60,
        timeout_secs: 15,
    }
}

fn sample_metric(run_id: i64, elapsed_ms: u64) -> Metric {
    Metric {
        id: 0,
        run_id,
        timestamp: Utc::now(),
        elapsed_ms,
        status_code: 200,
        duration_ms: 12,
        request_size: 0,
        response_size: 2,
        error_message: None,
        validation_error: None,
    }
}

#[test]
fn config_insert_assigns_id_and_round_trips() {
    let store = StoreManager::open_in_memory().unwrap();

    let mut config = sample_config("smoke", "");
    store.save_config(&mut config).unwrap();
    assert!(config.id > 0);

    let loaded = store.get_config(config.id).unwrap();
    assert_eq!(loaded.name, "smoke");
    assert_eq!(loaded.total_requests, 500);
    assert_eq!(loaded.timeout_secs, 15);
}

#[test]
fn config_save_with_id_updates_in_place() {
    let store = StoreManager::open_in_memory().unwrap();

    let mut config = sample_config("original", "");
    store.save_config(&mut config).unwrap();
    let id = config.id;

    config.name = "renamed".to_string();
    config.concurrent_conns = 25;
    store.save_config(&mut config).unwrap();
    assert_eq!(config.id, id);

    let loaded = store.get_config(id).unwrap();
    assert_eq!(loaded.name, "renamed");
    assert_eq!(loaded.concurrent_conns, 25);
}

#[test]
fn config_names_are_unique_per_profile() {
    let store = StoreManager::open_in_memory().unwrap();

    let mut first = sample_config("login-surge", "staging");
    store.save_config(&mut first).unwrap();

    let mut duplicate = sample_config("login-surge", "staging");
    let err = store.save_config(&mut duplicate).unwrap_err();
    assert!(matches!(err, StoreError::DuplicateName { .. }));

    // Same name under another profile is a different config.
    let mut other_profile = sample_config("login-surge", "production");
    store.save_config(&mut other_profile).unwrap();
    assert!(other_profile.id > first.id);
}

#[test]
fn config_lookup_by_name_is_profile_scoped() {
    let store = StoreManager::open_in_memory().unwrap();

    let mut config = sample_config("by-name", "staging");
    store.save_config(&mut config).unwrap();

    assert!(store
        .get_config_by_name("by-name", "staging")
        .unwrap()
        .is_some());
    assert!(store
        .get_config_by_name("by-name", "production")
        .unwrap()
        .is_none());
}

#[test]
fn list_configs_filters_by_profile() {
    let store = StoreManager::open_in_memory().unwrap();

    for name in ["a", "b"] {
        store.save_config(&mut sample_config(name, "staging")).unwrap();
    }
    store.save_config(&mut sample_config("c", "")).unwrap();

    assert_eq!(store.list_configs("staging").unwrap().len(), 2);
    assert_eq!(store.list_configs("").unwrap().len(), 1);
    assert!(store.list_configs("unknown").unwrap().is_empty());
}

#[test]
fn delete_config_nulls_run_reference() {
    let store = StoreManager::open_in_memory().unwrap();

    let mut config = sample_config("short-lived", "");
    store.save_config(&mut config).unwrap();

    let mut run = Run::for_config(&config);
    store.create_run(&mut run).unwrap();
    assert_eq!(run.config_id, Some(config.id));

    store.delete_config(config.id).unwrap();
    assert!(matches!(
        store.get_config(config.id),
        Err(StoreError::NotFound { .. })
    ));

    // The run survives with its provenance fields, minus the foreign key.
    let orphaned = store.get_run(run.id).unwrap();
    assert_eq!(orphaned.config_id, None);
    assert_eq!(orphaned.config_name, "short-lived");
}

#[test]
fn create_run_forces_running_status() {
    let store = StoreManager::open_in_memory().unwrap();

    let config = sample_config("force-running", "");
    let mut run = Run::for_config(&config);
    run.status = RunStatus::Completed;
    store.create_run(&mut run).unwrap();

    assert!(run.id > 0);
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(store.get_run(run.id).unwrap().status, RunStatus::Running);
}

#[test]
fn update_run_overwrites_summary() {
    let store = StoreManager::open_in_memory().unwrap();

    let config = sample_config("summary", "");
    let mut run = Run::for_config(&config);
    store.create_run(&mut run).unwrap();

    run.status = RunStatus::Completed;
    run.completed_at = Some(Utc::now());
    run.total_sent = 500;
    run.total_completed = 498;
    run.total_errors = 1;
    run.total_validation_errors = 1;
    run.avg_duration_ms = 12.5;
    run.min_duration_ms = 2;
    run.max_duration_ms = 220;
    run.p50_duration_ms = 10;
    run.p95_duration_ms = 90;
    run.p99_duration_ms = 180;
    store.update_run(&run).unwrap();

    let loaded = store.get_run(run.id).unwrap();
    assert_eq!(loaded.status, RunStatus::Completed);
    assert_eq!(loaded.total_completed, 498);
    assert_eq!(loaded.p95_duration_ms, 90);
    assert!(loaded.completed_at.is_some());
    assert!((loaded.avg_duration_ms - 12.5).abs() < f64::EPSILON);
}

#[test]
fn list_runs_orders_newest_first_and_honors_limit() {
    let store = StoreManager::open_in_memory().unwrap();
    let config = sample_config("history", "staging");

    let mut ids = Vec::new();
    for age_minutes in [30, 20, 10] {
        let mut run = Run::for_config(&config);
        run.started_at = Utc::now() - ChronoDuration::minutes(age_minutes);
        store.create_run(&mut run).unwrap();
        ids.push(run.id);
    }

    let listed = store.list_runs("staging", 0).unwrap();
    assert_eq!(listed.len(), 3);
    // Newest (smallest age) first.
    assert_eq!(listed[0].id, ids[2]);
    assert_eq!(listed[2].id, ids[0]);

    let limited = store.list_runs("staging", 2).unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].id, ids[2]);

    assert!(store.list_runs("production", 10).unwrap().is_empty());
}

#[test]
fn metrics_batch_is_atomic_and_ordered() {
    let store = StoreManager::open_in_memory().unwrap();

    let config = sample_config("metrics", "");
    let mut run = Run::for_config(&config);
    store.create_run(&mut run).unwrap();

    // Insert out of elapsed order; reads must come back sorted.
    let batch: Vec<Metric> = [40u64, 10, 30, 20]
        .iter()
        .map(|&elapsed| sample_metric(run.id, elapsed))
        .collect();
    store.save_metrics_batch(&batch).unwrap();
    store.save_metrics_batch(&[]).unwrap();

    let metrics = store.get_metrics(run.id).unwrap();
    assert_eq!(metrics.len(), 4);
    let elapsed: Vec<u64> = metrics.iter().map(|m| m.elapsed_ms).collect();
    assert_eq!(elapsed, vec![10, 20, 30, 40]);
}

#[test]
fn batch_with_bad_row_commits_nothing() {
    let store = StoreManager::open_in_memory().unwrap();

    let config = sample_config("atomic", "");
    let mut run = Run::for_config(&config);
    store.create_run(&mut run).unwrap();

    let mut batch = vec![sample_metric(run.id, 1), sample_metric(run.id, 2)];
    // Violates the metrics->runs foreign key.
    batch.push(sample_metric(run.id + 999, 3));

    assert!(store.save_metrics_batch(&batch).is_err());
    assert!(store.get_metrics(run.id).unwrap().is_empty());
}

#[test]
fn delete_run_cascades_to_metrics() {
    let store = StoreManager::open_in_memory().unwrap();

    let config = sample_config("cascade", "");
    let mut run = Run::for_config(&config);
    store.create_run(&mut run).unwrap();

    store.save_metric(&sample_metric(run.id, 5)).unwrap();
    store.save_metric(&sample_metric(run.id, 6)).unwrap();
    assert_eq!(store.get_metrics(run.id).unwrap().len(), 2);

    store.delete_run(run.id).unwrap();
    assert!(matches!(
        store.get_run(run.id),
        Err(StoreError::NotFound { .. })
    ));
    assert!(store.get_metrics(run.id).unwrap().is_empty());

    assert!(store.delete_run(run.id).is_err());
}

#[test]
fn reopening_file_store_preserves_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db");

    let run_id = {
        let store = StoreManager::open(&path).unwrap();
        let mut config = sample_config("persisted", "");
        store.save_config(&mut config).unwrap();

        let mut run = Run::for_config(&config);
        store.create_run(&mut run).unwrap();
        store.save_metric(&sample_metric(run.id, 7)).unwrap();
        store.close().unwrap();
        run.id
    };

    // Second open re-runs migrations idempotently and sees the old rows.
    let store = StoreManager::open(&path).unwrap();
    assert_eq!(store.list_configs("").unwrap().len(), 1);
    assert_eq!(store.get_run(run_id).unwrap().status, RunStatus::Running);
    assert_eq!(store.get_metrics(run_id).unwrap().len(), 1);
}
