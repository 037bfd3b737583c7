//! SQLite secondary index over the trajectory logs.
//!
//! Every row points at the exact byte range of its record in a log. The
//! index also remembers how many bytes of each log it covers, so a store
//! reopened after a crash can index just the tail. The logs stay the source
//! of truth: the index is only ever rebuilt from them, never patched.

use std::path::Path;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Transaction, params, params_from_iter};

use crate::error::{LedgerError, Result};
use crate::storage::RecordPos;
use crate::trajectory::types::{
    OutcomeFilter, OutcomeRecorded, SortOrder, TrajectoryFilter, TrajectoryStep,
};

/// Which log a coverage marker refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogKind {
    Steps,
    Outcomes,
}

impl LogKind {
    fn meta_key(self) -> &'static str {
        match self {
            LogKind::Steps => "steps_log_len",
            LogKind::Outcomes => "outcomes_log_len",
        }
    }
}

pub(crate) struct TrajectoryIndex {
    db: Connection,
}

impl TrajectoryIndex {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS steps (
            trajectory_id TEXT NOT NULL,
            step_seq INTEGER NOT NULL,
            step_id TEXT NOT NULL,
            step_type TEXT NOT NULL,
            timestamp_us INTEGER NOT NULL,
            command_id TEXT,
            byte_offset INTEGER NOT NULL,
            byte_length INTEGER NOT NULL,
            PRIMARY KEY (trajectory_id, step_seq)
        );

        CREATE TABLE IF NOT EXISTS step_entities (
            trajectory_id TEXT NOT NULL,
            step_seq INTEGER NOT NULL,
            entity_ref TEXT NOT NULL,
            PRIMARY KEY (trajectory_id, step_seq, entity_ref)
        );

        CREATE TABLE IF NOT EXISTS outcomes (
            outcome_id TEXT PRIMARY KEY,
            trajectory_id TEXT,
            command_id TEXT,
            kind TEXT NOT NULL,
            timestamp_us INTEGER NOT NULL,
            byte_offset INTEGER NOT NULL,
            byte_length INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_steps_timestamp ON steps(timestamp_us);
        CREATE INDEX IF NOT EXISTS idx_steps_command ON steps(command_id);
        CREATE INDEX IF NOT EXISTS idx_steps_type ON steps(step_type);
        CREATE INDEX IF NOT EXISTS idx_step_entities_ref ON step_entities(entity_ref);
        CREATE INDEX IF NOT EXISTS idx_outcomes_trajectory ON outcomes(trajectory_id);
        CREATE INDEX IF NOT EXISTS idx_outcomes_command ON outcomes(command_id);
        CREATE INDEX IF NOT EXISTS idx_outcomes_timestamp ON outcomes(timestamp_us);
    ";

    /// Open or create the index database at `path`.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::initialize(Connection::open(path)?)
    }

    /// Open an in-memory index.
    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(db: Connection) -> Result<Self> {
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        db.execute_batch(Self::SCHEMA)?;
        Ok(Self { db })
    }

    /// Number of bytes of `log` covered by the index.
    pub(crate) fn indexed_len(&self, log: LogKind) -> Result<u64> {
        let value: Option<i64> = self
            .db
            .query_row(
                "SELECT value FROM index_meta WHERE key = ?1",
                params![log.meta_key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0) as u64)
    }

    /// Drop every row and coverage marker.
    pub(crate) fn clear(&mut self) -> Result<()> {
        self.db.execute_batch(
            "DELETE FROM steps; DELETE FROM step_entities; DELETE FROM outcomes; DELETE FROM index_meta;",
        )?;
        Ok(())
    }

    pub(crate) fn step_exists(&self, trajectory_id: &str, step_seq: u64) -> Result<bool> {
        let found: Option<i64> = self
            .db
            .query_row(
                "SELECT 1 FROM steps WHERE trajectory_id = ?1 AND step_seq = ?2",
                params![trajectory_id, seq_value(step_seq)?],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub(crate) fn outcome_exists(&self, outcome_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .db
            .query_row(
                "SELECT 1 FROM outcomes WHERE outcome_id = ?1",
                params![outcome_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Index a batch of steps in one transaction.
    ///
    /// Returns how many were skipped because their `(trajectory_id,
    /// step_seq)` was already indexed; the first record for a key wins.
    pub(crate) fn insert_steps(&mut self, steps: &[(RecordPos, TrajectoryStep)]) -> Result<usize> {
        let tx = self.db.transaction()?;
        let mut skipped = 0;
        for (pos, step) in steps {
            let seq = seq_value(step.step_seq)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO steps
                 (trajectory_id, step_seq, step_id, step_type, timestamp_us, command_id, byte_offset, byte_length)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    &step.trajectory_id,
                    seq,
                    &step.step_id,
                    &step.step_type,
                    step.timestamp.timestamp_micros(),
                    &step.related_command_id,
                    pos.offset as i64,
                    pos.length as i64,
                ],
            )?;
            if inserted == 0 {
                skipped += 1;
            } else {
                for entity in &step.entity_refs {
                    tx.execute(
                        "INSERT OR IGNORE INTO step_entities (trajectory_id, step_seq, entity_ref)
                         VALUES (?1, ?2, ?3)",
                        params![&step.trajectory_id, seq, entity],
                    )?;
                }
            }
            set_indexed_len(&tx, LogKind::Steps, pos.offset + pos.length)?;
        }
        tx.commit()?;
        Ok(skipped)
    }

    /// Index a batch of outcomes in one transaction.
    ///
    /// Returns how many were skipped as duplicate `outcome_id`s.
    pub(crate) fn insert_outcomes(
        &mut self,
        outcomes: &[(RecordPos, OutcomeRecorded)],
    ) -> Result<usize> {
        let tx = self.db.transaction()?;
        let mut skipped = 0;
        for (pos, outcome) in outcomes {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO outcomes
                 (outcome_id, trajectory_id, command_id, kind, timestamp_us, byte_offset, byte_length)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    &outcome.outcome_id,
                    &outcome.attaches_to.trajectory_id,
                    &outcome.attaches_to.command_id,
                    &outcome.kind,
                    outcome.timestamp.timestamp_micros(),
                    pos.offset as i64,
                    pos.length as i64,
                ],
            )?;
            if inserted == 0 {
                skipped += 1;
            }
            set_indexed_len(&tx, LogKind::Outcomes, pos.offset + pos.length)?;
        }
        tx.commit()?;
        Ok(skipped)
    }

    /// `(step_seq, position)` of every step of a trajectory, by `step_seq`.
    pub(crate) fn step_positions(&self, trajectory_id: &str) -> Result<Vec<(u64, RecordPos)>> {
        let mut stmt = self.db.prepare(
            "SELECT step_seq, byte_offset, byte_length FROM steps
             WHERE trajectory_id = ?1
             ORDER BY step_seq ASC",
        )?;
        let rows = stmt.query_map(params![trajectory_id], |row| {
            let seq: i64 = row.get(0)?;
            Ok((seq as u64, record_pos(row.get(1)?, row.get(2)?)))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Distinct trajectory ids matching `filter`, sorted, sliced to
    /// `[offset, offset + limit)`.
    pub(crate) fn list_trajectories(
        &self,
        filter: &TrajectoryFilter,
        sort: SortOrder,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<String>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(entity) = &filter.entity_ref {
            clauses.push(
                "EXISTS (SELECT 1 FROM step_entities e
                 WHERE e.trajectory_id = s.trajectory_id AND e.step_seq = s.step_seq
                 AND e.entity_ref = ?)"
                    .to_owned(),
            );
            args.push(SqlValue::Text(entity.clone()));
        }
        if let Some(command_id) = &filter.command_id {
            clauses.push("s.command_id = ?".to_owned());
            args.push(SqlValue::Text(command_id.clone()));
        }
        if let Some(types) = &filter.step_types {
            if types.is_empty() {
                return Ok(Vec::new());
            }
            let marks = vec!["?"; types.len()].join(", ");
            clauses.push(format!("s.step_type IN ({marks})"));
            args.extend(types.iter().cloned().map(SqlValue::Text));
        }
        if let Some(since) = filter.since {
            clauses.push("s.timestamp_us >= ?".to_owned());
            args.push(SqlValue::Integer(since.timestamp_micros()));
        }
        if let Some(until) = filter.until {
            clauses.push("s.timestamp_us < ?".to_owned());
            args.push(SqlValue::Integer(until.timestamp_micros()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let dir = match sort {
            SortOrder::TimeAsc => "ASC",
            SortOrder::TimeDesc => "DESC",
        };
        // Each trajectory is keyed by its first matching step in sort order.
        let sql = format!(
            "SELECT trajectory_id FROM (
                 SELECT s.trajectory_id, s.timestamp_us AS t, s.step_id AS sid,
                        ROW_NUMBER() OVER (
                            PARTITION BY s.trajectory_id
                            ORDER BY s.timestamp_us {dir}, s.step_id {dir}
                        ) AS rn
                 FROM steps s
                 {where_sql}
             )
             WHERE rn = 1
             ORDER BY t {dir}, sid {dir}, trajectory_id {dir}
             LIMIT ? OFFSET ?"
        );
        args.push(SqlValue::Integer(limit.min(i64::MAX as u64) as i64));
        args.push(SqlValue::Integer(offset.min(i64::MAX as u64) as i64));

        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Positions of outcomes matching `filter`, by time then id.
    pub(crate) fn outcome_positions(&self, filter: &OutcomeFilter) -> Result<Vec<RecordPos>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(command_id) = &filter.command_id {
            clauses.push("command_id = ?");
            args.push(SqlValue::Text(command_id.clone()));
        }
        if let Some(trajectory_id) = &filter.trajectory_id {
            clauses.push("trajectory_id = ?");
            args.push(SqlValue::Text(trajectory_id.clone()));
        }
        if let Some(kind) = &filter.kind {
            clauses.push("kind = ?");
            args.push(SqlValue::Text(kind.clone()));
        }
        if let Some(since) = filter.since {
            clauses.push("timestamp_us >= ?");
            args.push(SqlValue::Integer(since.timestamp_micros()));
        }
        if let Some(until) = filter.until {
            clauses.push("timestamp_us < ?");
            args.push(SqlValue::Integer(until.timestamp_micros()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT byte_offset, byte_length FROM outcomes {where_sql}
             ORDER BY timestamp_us ASC, outcome_id ASC"
        );
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(record_pos(row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Positions of outcomes attached to a trajectory directly or through a
    /// command one of its steps issued.
    pub(crate) fn outcome_positions_for_trajectory(&self, trajectory_id: &str) -> Result<Vec<RecordPos>> {
        let mut stmt = self.db.prepare(
            "SELECT byte_offset, byte_length FROM outcomes o
             WHERE o.trajectory_id = ?1
                OR o.command_id IN (
                    SELECT command_id FROM steps
                    WHERE trajectory_id = ?1 AND command_id IS NOT NULL
                )
             ORDER BY o.timestamp_us ASC, o.outcome_id ASC",
        )?;
        let rows = stmt.query_map(params![trajectory_id], |row| {
            Ok(record_pos(row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn set_indexed_len(tx: &Transaction<'_>, log: LogKind, len: u64) -> Result<()> {
    tx.execute(
        "INSERT INTO index_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![log.meta_key(), len as i64],
    )?;
    Ok(())
}

fn seq_value(seq: u64) -> Result<i64> {
    i64::try_from(seq).map_err(|_| LedgerError::validation(format!("step_seq {seq} out of range")))
}

fn record_pos(offset: i64, length: i64) -> RecordPos {
    RecordPos {
        offset: offset as u64,
        length: length as u64,
    }
}
