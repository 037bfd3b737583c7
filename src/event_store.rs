//! Append-only, replayable event log with point lookup by id.

use std::collections::HashMap;
use std::path::PathBuf;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::event::EventEnvelope;
use crate::storage::{AppendLog, RecordPos, SourceProbe};

/// Durable event log.
///
/// Events are stored one JSON object per line in append order. An in-memory
/// `event_id -> position` index is rebuilt at open time and kept current on
/// every append, which makes [`append`](EventStore::append) idempotent and
/// [`get_by_id`](EventStore::get_by_id) a single seek-and-read.
///
/// `EventStore` is `Send + Sync`; share it behind an `Arc`.
#[derive(Debug)]
pub struct EventStore {
    log: AppendLog,
    index: RwLock<HashMap<Uuid, RecordPos>>,
}

/// Whether an [`EventStore::append`] wrote a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// The event was written at this position.
    Appended(RecordPos),
    /// An event with the same id was already stored; nothing was written.
    AlreadyPresent,
}

impl AppendResult {
    /// `true` if the event was newly written.
    pub fn is_appended(&self) -> bool {
        matches!(self, AppendResult::Appended(_))
    }
}

impl EventStore {
    /// Open (or create) the event log at `path` and index its contents.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`](crate::LedgerError::Io) on filesystem
    /// failure and [`LedgerError::Serialization`](crate::LedgerError::Serialization)
    /// if a complete line does not decode as an event.
    pub async fn open(path: impl Into<PathBuf>, fsync: bool) -> Result<Self> {
        let log = AppendLog::open(path, fsync).await?;

        let mut index = HashMap::new();
        let mut records = log.records::<EventEnvelope>().await?;
        while let Some(item) = records.next().await {
            let (pos, event) = item?;
            index.entry(event.event_id).or_insert(pos);
        }
        tracing::debug!(
            path = %log.path().display(),
            events = index.len(),
            "event store opened"
        );

        Ok(Self {
            log,
            index: RwLock::new(index),
        })
    }

    /// Append `event` unless an event with the same id is already stored.
    ///
    /// Safe to call concurrently: the id check and the write happen under
    /// one lock, so two racing appends of the same event write one record.
    pub async fn append(&self, event: &EventEnvelope) -> Result<AppendResult> {
        let mut index = self.index.write().await;
        if index.contains_key(&event.event_id) {
            tracing::debug!(event_id = %event.event_id, "event already present, skipping append");
            return Ok(AppendResult::AlreadyPresent);
        }
        let pos = self.log.append(event).await?;
        index.insert(event.event_id, pos);
        tracing::debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            offset = pos.offset,
            "event appended"
        );
        Ok(AppendResult::Appended(pos))
    }

    /// Look up one event by id.
    pub async fn get_by_id(&self, event_id: Uuid) -> Result<Option<EventEnvelope>> {
        let pos = self.index.read().await.get(&event_id).copied();
        match pos {
            Some(pos) => Ok(Some(self.log.read_at(pos).await?)),
            None => Ok(None),
        }
    }

    /// Whether an event with this id is stored.
    pub async fn contains(&self, event_id: Uuid) -> bool {
        self.index.read().await.contains_key(&event_id)
    }

    /// Number of stored events.
    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    /// Whether the log holds no events.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Lazily stream every event in append order.
    ///
    /// The stream covers the events committed when it was created; calling
    /// again restarts from the first event.
    pub async fn stream(&self) -> Result<BoxStream<'static, Result<EventEnvelope>>> {
        let records = self.log.records::<EventEnvelope>().await?;
        Ok(records.map(|item| item.map(|(_, event)| event)).boxed())
    }

    /// Stream events starting at byte `offset` (a record boundary), paired
    /// with their positions.
    pub(crate) async fn stream_from(
        &self,
        offset: u64,
    ) -> Result<BoxStream<'static, Result<(RecordPos, EventEnvelope)>>> {
        self.log.records_from(offset).await
    }

    /// Position of a stored event.
    pub(crate) async fn position_of(&self, event_id: Uuid) -> Option<RecordPos> {
        self.index.read().await.get(&event_id).copied()
    }

    /// Size and modification time of the log file.
    pub async fn probe(&self) -> Result<SourceProbe> {
        self.log.probe().await
    }
}
