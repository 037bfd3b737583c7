//! Read models folded from an event source.
//!
//! A [`ProjectionDefinition`] is a pure reducer plus a way to read the
//! freshness marker out of its state. [`rebuild_one`] folds every record of
//! an [`EventSource`] through it. [`ProjectionCache`] sits above the fold and
//! reuses the last rebuild while the source's size and mtime are unchanged.

use std::future::Future;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::event::EventEnvelope;
use crate::event_store::EventStore;
use crate::storage::SourceProbe;

/// Position of the last record folded into a projection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Freshness {
    /// Id of the last folded record, `None` before the first one.
    pub last_event_id: Option<String>,
    /// Ingestion time of the last folded record.
    pub last_ingested_at: Option<DateTime<Utc>>,
}

impl Freshness {
    /// Record that `id` (ingested at `at`) has been folded.
    pub fn observe(&mut self, id: impl ToString, at: DateTime<Utc>) {
        self.last_event_id = Some(id.to_string());
        self.last_ingested_at = Some(at);
    }

    /// Freshness after folding `event`.
    pub fn of_event(event: &EventEnvelope) -> Self {
        Self {
            last_event_id: Some(event.event_id.to_string()),
            last_ingested_at: Some(event.ingested_at),
        }
    }
}

/// A pure fold from a record stream into a read-optimised view.
///
/// # Contract
///
/// - [`apply`](ProjectionDefinition::apply) must be a pure function of the
///   prior state and the record: no I/O, no clocks, no randomness. Folding
///   the same records twice yields structurally equal state.
/// - Records the projection does not care about are returned unchanged.
/// - Bump [`VERSION`](ProjectionDefinition::VERSION) whenever `apply`
///   changes meaning, so cached results are discarded.
pub trait ProjectionDefinition: Send + Sync {
    /// Human-readable name, used in logs.
    const NAME: &'static str;

    /// Version of the fold logic.
    const VERSION: u32;

    /// Record type consumed by the fold.
    type Event: Send + 'static;

    /// Projection state.
    type State: Clone + Send + Sync + 'static;

    /// Initial state before any record is folded.
    fn init(&self) -> Self::State;

    /// Fold one record into the state.
    fn apply(&self, state: Self::State, event: &Self::Event) -> Self::State;

    /// Freshness marker carried in `state`.
    fn freshness(&self, state: &Self::State) -> Freshness;
}

/// A finite, ordered, restartable source of records.
pub trait EventSource<E>: Send + Sync {
    /// Stream every record in order. Each call restarts from the beginning.
    fn events(&self) -> impl Future<Output = Result<BoxStream<'static, Result<E>>>> + Send;

    /// Cheap change detector for the underlying storage.
    fn probe(&self) -> impl Future<Output = Result<SourceProbe>> + Send;
}

impl EventSource<EventEnvelope> for EventStore {
    async fn events(&self) -> Result<BoxStream<'static, Result<EventEnvelope>>> {
        self.stream().await
    }

    async fn probe(&self) -> Result<SourceProbe> {
        EventStore::probe(self).await
    }
}

/// A rebuilt projection: its state and where the fold stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection<S> {
    /// Folded state.
    pub data: S,
    /// Freshness marker read from `data`.
    pub freshness: Freshness,
}

/// Fold every record of `source` through `def`.
pub async fn rebuild_one<D, S>(def: &D, source: &S) -> Result<Projection<D::State>>
where
    D: ProjectionDefinition,
    S: EventSource<D::Event>,
{
    let mut events = source.events().await?;
    let mut state = def.init();
    let mut count = 0u64;
    while let Some(event) = events.next().await {
        state = def.apply(state, &event?);
        count += 1;
    }
    let freshness = def.freshness(&state);
    tracing::debug!(
        projection = D::NAME,
        version = D::VERSION,
        records = count,
        "projection rebuilt"
    );
    Ok(Projection {
        data: state,
        freshness,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheKey {
    probe: SourceProbe,
    version: u32,
}

/// Memoises [`rebuild_one`] against a [`SourceProbe`] of the source.
///
/// The cached projection is reused while the source's length and mtime and
/// the definition's version are unchanged.
pub struct ProjectionCache<D: ProjectionDefinition> {
    entry: Mutex<Option<(CacheKey, Projection<D::State>)>>,
}

impl<D: ProjectionDefinition> Default for ProjectionCache<D> {
    fn default() -> Self {
        Self {
            entry: Mutex::new(None),
        }
    }
}

impl<D: ProjectionDefinition> std::fmt::Debug for ProjectionCache<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionCache")
            .field("projection", &D::NAME)
            .finish_non_exhaustive()
    }
}

impl<D: ProjectionDefinition> ProjectionCache<D> {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached projection, rebuilding it first if the source
    /// changed since the last rebuild.
    pub async fn get<S>(&self, def: &D, source: &S) -> Result<Projection<D::State>>
    where
        S: EventSource<D::Event>,
    {
        let key = CacheKey {
            probe: source.probe().await?,
            version: D::VERSION,
        };
        let mut entry = self.entry.lock().await;
        if let Some((cached_key, projection)) = entry.as_ref()
            && *cached_key == key
        {
            tracing::trace!(projection = D::NAME, "projection cache hit");
            return Ok(projection.clone());
        }
        let projection = rebuild_one(def, source).await?;
        *entry = Some((key, projection.clone()));
        Ok(projection)
    }

    /// Drop the cached projection.
    pub async fn invalidate(&self) {
        *self.entry.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Counts events per type.
    #[derive(Default)]
    struct TypeCounter {
        applied: AtomicUsize,
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct TypeCounts {
        counts: BTreeMap<String, u64>,
        freshness: Freshness,
    }

    impl ProjectionDefinition for TypeCounter {
        const NAME: &'static str = "type-counter";
        const VERSION: u32 = 1;
        type Event = EventEnvelope;
        type State = TypeCounts;

        fn init(&self) -> TypeCounts {
            TypeCounts::default()
        }

        fn apply(&self, mut state: TypeCounts, event: &EventEnvelope) -> TypeCounts {
            self.applied.fetch_add(1, Ordering::Relaxed);
            *state.counts.entry(event.event_type.clone()).or_default() += 1;
            state.freshness = Freshness::of_event(event);
            state
        }

        fn freshness(&self, state: &TypeCounts) -> Freshness {
            state.freshness.clone()
        }
    }

    async fn store(tmp: &TempDir) -> EventStore {
        EventStore::open(tmp.path().join("events.jsonl"), false)
            .await
            .expect("open should succeed")
    }

    #[tokio::test]
    async fn rebuild_of_empty_source_is_init_state() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = store(&tmp).await;
        let projection = rebuild_one(&TypeCounter::default(), &store)
            .await
            .expect("rebuild should succeed");
        assert!(projection.data.counts.is_empty());
        assert_eq!(projection.freshness, Freshness::default());
    }

    #[tokio::test]
    async fn rebuild_folds_all_events_and_tracks_freshness() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = store(&tmp).await;
        let mut last = None;
        for (i, ty) in ["a", "b", "a"].into_iter().enumerate() {
            let event = EventEnvelope::new(ty, json!({"i": i}));
            store.append(&event).await.expect("append should succeed");
            last = Some(event);
        }
        let last = last.expect("at least one event");

        let def = TypeCounter::default();
        let first = rebuild_one(&def, &store).await.expect("rebuild should succeed");
        let second = rebuild_one(&def, &store).await.expect("rebuild should succeed");

        assert_eq!(first, second);
        assert_eq!(first.data.counts["a"], 2);
        assert_eq!(first.data.counts["b"], 1);
        assert_eq!(
            first.freshness.last_event_id,
            Some(last.event_id.to_string())
        );
        assert_eq!(first.freshness.last_ingested_at, Some(last.ingested_at));
    }

    #[tokio::test]
    async fn cache_reuses_result_until_source_changes() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = store(&tmp).await;
        store
            .append(&EventEnvelope::new("a", json!({"i": 0})))
            .await
            .expect("append should succeed");

        let def = TypeCounter::default();
        let cache = ProjectionCache::<TypeCounter>::new();

        cache.get(&def, &store).await.expect("get should succeed");
        cache.get(&def, &store).await.expect("get should succeed");
        assert_eq!(def.applied.load(Ordering::Relaxed), 1);

        store
            .append(&EventEnvelope::new("a", json!({"i": 1})))
            .await
            .expect("append should succeed");
        let projection = cache.get(&def, &store).await.expect("get should succeed");
        assert_eq!(projection.data.counts["a"], 2);
        assert_eq!(def.applied.load(Ordering::Relaxed), 3);

        cache.invalidate().await;
        cache.get(&def, &store).await.expect("get should succeed");
        assert_eq!(def.applied.load(Ordering::Relaxed), 5);
    }
}
