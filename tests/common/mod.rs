//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Once;

use chrono::{DateTime, TimeZone, Utc};
use ledgerfold::LedgerStore;
use ledgerfold::trajectory::TrajectoryStep;
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Route crate logs to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Open a store without fsync in a fresh temp dir.
pub async fn open_store() -> (TempDir, LedgerStore) {
    init_tracing();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let store = LedgerStore::builder(tmp.path())
        .fsync(false)
        .open()
        .await
        .expect("open should succeed");
    (tmp, store)
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

pub fn step(trajectory_id: &str, step_seq: u64, step_type: &str, entities: &[&str], secs: i64) -> TrajectoryStep {
    TrajectoryStep {
        trajectory_id: trajectory_id.into(),
        step_seq,
        step_id: format!("{trajectory_id}-s{step_seq}"),
        step_type: step_type.into(),
        timestamp: at(secs),
        entity_refs: entities.iter().map(|e| e.to_string()).collect(),
        related_command_id: None,
    }
}
