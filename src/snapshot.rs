//! State reconstruction: full replay and the snapshot optimisation.
//!
//! Full replay of the event log is the correctness baseline. A snapshot
//! stores folded state together with the id and end offset of the last
//! event folded into it, so replay can resume from the tail. A snapshot
//! that no longer lines up with the log is ignored and state is rebuilt
//! from scratch. Writes are atomic via a temp-rename pattern.

use std::io;
use std::path::Path;

use futures::StreamExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::aggregate::{Aggregate, reduce};
use crate::error::Result;
use crate::event_store::EventStore;

/// How [`CommandLedger`](crate::CommandLedger) rebuilds state before
/// handling a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReplayStrategy {
    /// Fold the entire event log on every command.
    #[default]
    Full,
    /// Resume from a persisted snapshot, refreshing it once at least
    /// `every` events have been folded past it.
    Snapshot {
        /// Events between snapshot refreshes.
        every: u64,
    },
}

/// A point-in-time snapshot of aggregate state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "A: Serialize", deserialize = "A: DeserializeOwned"))]
pub struct Snapshot<A> {
    /// The aggregate state at the time of the snapshot.
    pub state: A,
    /// Number of log records folded into `state`.
    pub event_count: u64,
    /// Id of the last event folded into `state`.
    pub last_event_id: Option<Uuid>,
    /// Byte offset just past the last folded record.
    pub end_offset: u64,
}

impl<A: Default> Default for Snapshot<A> {
    fn default() -> Self {
        Self {
            state: A::default(),
            event_count: 0,
            last_event_id: None,
            end_offset: 0,
        }
    }
}

/// Fold the whole event log into a fresh `A`.
pub async fn replay_full<A: Aggregate>(store: &EventStore) -> Result<A> {
    let mut events = store.stream().await?;
    let mut state = A::default();
    let mut count = 0u64;
    while let Some(event) = events.next().await {
        state = reduce(state, &event?);
        count += 1;
    }
    tracing::debug!(aggregate_type = A::AGGREGATE_TYPE, events = count, "full replay complete");
    Ok(state)
}

/// Rebuild state using `strategy`.
///
/// With [`ReplayStrategy::Snapshot`], the snapshot at `snapshot_path` is
/// used when it still matches the log and refreshed when stale.
pub async fn replay<A: Aggregate>(
    store: &EventStore,
    strategy: ReplayStrategy,
    snapshot_path: &Path,
) -> Result<A> {
    let every = match strategy {
        ReplayStrategy::Full => return replay_full(store).await,
        ReplayStrategy::Snapshot { every } => every.max(1),
    };

    let base = match load_snapshot::<A>(snapshot_path).await? {
        Some(snap) if snapshot_matches_log(store, &snap).await => snap,
        Some(snap) => {
            tracing::warn!(
                path = %snapshot_path.display(),
                event_count = snap.event_count,
                "snapshot does not match event log; replaying from start"
            );
            Snapshot::default()
        }
        None => Snapshot::default(),
    };

    let mut current = base.clone();
    let mut events = store.stream_from(base.end_offset).await?;
    while let Some(item) = events.next().await {
        let (pos, event) = item?;
        current.state = reduce(current.state, &event);
        current.event_count += 1;
        current.last_event_id = Some(event.event_id);
        current.end_offset = pos.offset + pos.length;
    }

    let folded = current.event_count - base.event_count;
    tracing::debug!(
        aggregate_type = A::AGGREGATE_TYPE,
        from_snapshot = base.event_count,
        folded,
        "snapshot replay complete"
    );
    if folded >= every {
        save_snapshot(snapshot_path, &current).await?;
        tracing::debug!(event_count = current.event_count, "snapshot refreshed");
    }
    Ok(current.state)
}

async fn snapshot_matches_log<A>(store: &EventStore, snap: &Snapshot<A>) -> bool {
    match snap.last_event_id {
        None => snap.end_offset == 0 && snap.event_count == 0,
        Some(id) => match store.position_of(id).await {
            Some(pos) => pos.offset + pos.length == snap.end_offset,
            None => false,
        },
    }
}

/// Save a snapshot atomically.
///
/// Writes to `snapshot.json.tmp` in the same directory, then renames it to
/// `snapshot.json`, so readers never see a partially-written file.
pub async fn save_snapshot<A: Serialize>(path: &Path, snapshot: &Snapshot<A>) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(snapshot)?;
    tokio::fs::write(&tmp_path, &json).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Load a snapshot from disk.
///
/// Returns `Ok(None)` if the file does not exist or contains invalid JSON.
/// Deserialization failures are logged and treated as a cache miss.
pub async fn load_snapshot<A: DeserializeOwned>(path: &Path) -> Result<Option<Snapshot<A>>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice::<Snapshot<A>>(&bytes) {
        Ok(snap) => Ok(Some(snap)),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to deserialize snapshot; treating as cache miss"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterEvent};
    use crate::command::CommandContext;
    use crate::event::encode_domain_event;
    use tempfile::TempDir;

    async fn store_with_adds(tmp: &TempDir, amounts: &[u64]) -> EventStore {
        let store = EventStore::open(tmp.path().join("events.jsonl"), false)
            .await
            .expect("open should succeed");
        append_adds(&store, amounts, 0).await;
        store
    }

    async fn append_adds(store: &EventStore, amounts: &[u64], seq_base: u64) {
        for (i, amount) in amounts.iter().enumerate() {
            let event = CounterEvent::Added {
                amount: *amount,
                seq: seq_base + i as u64 + 1,
            };
            let env = encode_domain_event(&event, &CommandContext::new("c")).expect("encode");
            store.append(&env).await.expect("append should succeed");
        }
    }

    #[tokio::test]
    async fn snapshot_replay_equals_full_replay() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = store_with_adds(&tmp, &[1, 2, 3, 4, 5]).await;
        let path = tmp.path().join("snap/snapshot.json");
        let strategy = ReplayStrategy::Snapshot { every: 2 };

        let snap_state: Counter = replay(&store, strategy, &path).await.expect("replay");
        assert!(path.exists(), "snapshot should have been written");

        append_adds(&store, &[10, 20], 5).await;
        let snap_state_2: Counter = replay(&store, strategy, &path).await.expect("replay");
        let full: Counter = replay_full(&store).await.expect("replay");

        assert_eq!(snap_state.value, 15);
        assert_eq!(snap_state_2, full);
        assert_eq!(full.value, 45);
    }

    #[tokio::test]
    async fn mismatched_snapshot_falls_back_to_full_replay() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = store_with_adds(&tmp, &[1, 2]).await;
        let path = tmp.path().join("snap/snapshot.json");

        let bogus = Snapshot {
            state: Counter {
                value: 999,
                applied: 50,
            },
            event_count: 50,
            last_event_id: Some(Uuid::new_v4()),
            end_offset: 4096,
        };
        save_snapshot(&path, &bogus).await.expect("save should succeed");

        let state: Counter = replay(&store, ReplayStrategy::Snapshot { every: 100 }, &path)
            .await
            .expect("replay");
        assert_eq!(state.value, 3);
    }

    #[tokio::test]
    async fn load_corrupt_json_returns_none() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join("snapshot.json");
        std::fs::write(&path, b"this is not valid json!!!").expect("write corrupt file");

        let result = load_snapshot::<Counter>(&path).await.expect("load should succeed (not Err)");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn save_uses_atomic_temp_rename() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join("nested/snapshot.json");
        save_snapshot(&path, &Snapshot::<Counter>::default())
            .await
            .expect("save should succeed");

        assert!(path.exists(), "final snapshot file should exist");
        assert!(
            !path.with_extension("json.tmp").exists(),
            "temp file should not exist after successful save"
        );
        let loaded = load_snapshot::<Counter>(&path)
            .await
            .expect("load should succeed")
            .expect("snapshot should exist");
        assert_eq!(loaded.event_count, 0);
    }

    #[test]
    fn replay_strategy_serde_shape() {
        let json = serde_json::to_value(ReplayStrategy::Snapshot { every: 50 }).expect("serialize");
        assert_eq!(json, serde_json::json!({"mode": "snapshot", "every": 50}));
        let full: ReplayStrategy =
            serde_json::from_value(serde_json::json!({"mode": "full"})).expect("deserialize");
        assert_eq!(full, ReplayStrategy::Full);
    }
}
