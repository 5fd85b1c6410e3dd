//! SQLite-backed durable queue and transaction index.
//!
//! Four logical tables: `queue` holds Pending/InFlight mutations,
//! `mutation_log` is the append-only audit of Synced/Failed entries,
//! `tx_index` correlates parts to submitted transaction ids, and
//! `event_cache` keeps the last observed history per part. Every mutating
//! operation runs in one `BEGIN IMMEDIATE` transaction, so a crash between
//! any two statements leaves the entry recoverable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use thiserror::Error;

use crate::core::{
    LedgerEvent, Metadata, Mutation, MutationId, MutationKind, MutationState, PartHash, SyncStatus,
    TransactionRecord,
};

const SCHEMA_VERSION: u32 = 1;
const BUSY_TIMEOUT_MS: u64 = 5_000;
/// Most-recent transaction records retained per part.
const TX_INDEX_RETAIN: u32 = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path is a symlink: {path:?}")]
    Symlink { path: PathBuf },
    #[error("store schema version mismatch: expected {expected}, got {got}")]
    SchemaVersionMismatch { expected: u32, got: u32 },
    #[error("mutation {id} not found in {table}")]
    NotFound { id: MutationId, table: &'static str },
    #[error("mutation {id} is {actual}, expected {expected}")]
    InvalidTransition {
        id: MutationId,
        expected: MutationState,
        actual: MutationState,
    },
    /// The store failed an atomicity or integrity guarantee. Fatal to sync:
    /// queued work may no longer be trustworthy and must not be silently
    /// dropped or double-submitted.
    #[error("store corruption: {0}")]
    Corruption(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Corruption(_) | StoreError::SchemaVersionMismatch { .. }
        )
    }
}

/// Handle to the on-disk store. Cheap to clone; every operation opens its
/// own connection, so queue reads never wait behind an in-flight network
/// call elsewhere in the process.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the store under `dir`.
    ///
    /// Entries left InFlight by a crash are returned to Pending here, so
    /// `list_pending` is complete from the first call after restart.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        reject_symlink(dir)?;
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let db_path = dir.join("queue.sqlite");
        reject_symlink(&db_path)?;

        let conn = open_connection(&db_path, true)?;
        let is_new = !table_exists(&conn, "meta")?;
        if is_new {
            initialize_schema(&conn)?;
        } else {
            validate_schema_version(&conn)?;
        }
        drop(conn);

        let store = Self { db_path };
        let recovered = store.recover_in_flight()?;
        if recovered > 0 {
            tracing::warn!(recovered, "requeued mutations left in flight by a previous run");
        }
        Ok(store)
    }

    /// Append a mutation to the queue; returns its FIFO id.
    pub fn enqueue(
        &self,
        kind: MutationKind,
        part_hash: &PartHash,
        payload: &Metadata,
        now_ms: u64,
    ) -> Result<MutationId, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO queue (kind, part_hash, payload, state, attempts, enqueued_at_ms) \
             VALUES (?1, ?2, ?3, 'pending', 0, ?4)",
            params![
                kind.as_str(),
                part_hash.to_hex(),
                payload.to_json_string(),
                now_ms as i64
            ],
        )?;
        Ok(MutationId(conn.last_insert_rowid()))
    }

    /// Pending mutations in FIFO order (oldest first). InFlight entries are
    /// excluded; they belong to the drain cycle that claimed them.
    pub fn list_pending(&self) -> Result<Vec<Mutation>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, part_hash, payload, state, attempts, enqueued_at_ms, \
                    last_attempt_ms, last_error \
             FROM queue WHERE state = 'pending' ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(queue_row_to_mutation(row)?);
        }
        Ok(out)
    }

    /// Claim a pending entry for one relayer submission.
    pub fn mark_in_flight(&self, id: MutationId, now_ms: u64) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = txn.execute(
            "UPDATE queue SET state = 'in_flight', last_attempt_ms = ?2 \
             WHERE id = ?1 AND state = 'pending'",
            params![id.0, now_ms as i64],
        )?;
        if updated == 0 {
            let actual = queue_state(&txn, id)?;
            return Err(match actual {
                Some(actual) => StoreError::InvalidTransition {
                    id,
                    expected: MutationState::Pending,
                    actual,
                },
                None => StoreError::NotFound { id, table: "queue" },
            });
        }
        txn.commit()?;
        Ok(())
    }

    /// Record a successful relayer submission: the entry moves from the
    /// queue to the audit log with its transaction id.
    pub fn mark_synced(
        &self,
        id: MutationId,
        transaction_id: &str,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        if transaction_id.is_empty() {
            return Err(StoreError::Corruption(format!(
                "mutation {id} marked synced without a transaction id"
            )));
        }
        let mut conn = self.conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = take_queue_row(&txn, id)?;
        txn.execute(
            "INSERT INTO mutation_log \
             (id, kind, part_hash, payload, state, attempts, enqueued_at_ms, completed_at_ms, \
              transaction_id, last_error) \
             VALUES (?1, ?2, ?3, ?4, 'synced', ?5, ?6, ?7, ?8, NULL)",
            params![
                row.id,
                row.kind,
                row.part_hash,
                row.payload,
                row.attempts,
                row.enqueued_at_ms,
                now_ms as i64,
                transaction_id
            ],
        )?;
        txn.commit()?;
        Ok(())
    }

    /// Record a transient failure. Increments the attempt counter; the
    /// entry goes back to Pending unless the retry ceiling is hit, in which
    /// case it moves to the log as Failed. Returns the resulting state.
    pub fn mark_failed(
        &self,
        id: MutationId,
        error: &str,
        max_attempts: u32,
        now_ms: u64,
    ) -> Result<MutationState, StoreError> {
        let mut conn = self.conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let attempts: u32 = txn
            .query_row(
                "SELECT attempts FROM queue WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound { id, table: "queue" })?;
        let attempts = attempts + 1;

        let state = if attempts >= max_attempts {
            let row = take_queue_row(&txn, id)?;
            txn.execute(
                "INSERT INTO mutation_log \
                 (id, kind, part_hash, payload, state, attempts, enqueued_at_ms, \
                  completed_at_ms, transaction_id, last_error) \
                 VALUES (?1, ?2, ?3, ?4, 'failed', ?5, ?6, ?7, NULL, ?8)",
                params![
                    row.id,
                    row.kind,
                    row.part_hash,
                    row.payload,
                    attempts,
                    row.enqueued_at_ms,
                    now_ms as i64,
                    error
                ],
            )?;
            MutationState::Failed
        } else {
            txn.execute(
                "UPDATE queue SET state = 'pending', attempts = ?2, last_attempt_ms = ?3, \
                 last_error = ?4 WHERE id = ?1",
                params![id.0, attempts, now_ms as i64, error],
            )?;
            MutationState::Pending
        };
        txn.commit()?;
        Ok(state)
    }

    /// Record a permanent rejection: straight to Failed regardless of the
    /// attempt count. The payload is invalid as submitted and retrying
    /// cannot help.
    pub fn mark_rejected(
        &self,
        id: MutationId,
        error: &str,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = take_queue_row(&txn, id)?;
        txn.execute(
            "INSERT INTO mutation_log \
             (id, kind, part_hash, payload, state, attempts, enqueued_at_ms, completed_at_ms, \
              transaction_id, last_error) \
             VALUES (?1, ?2, ?3, ?4, 'failed', ?5, ?6, ?7, NULL, ?8)",
            params![
                row.id,
                row.kind,
                row.part_hash,
                row.payload,
                row.attempts + 1,
                row.enqueued_at_ms,
                now_ms as i64,
                error
            ],
        )?;
        txn.commit()?;
        Ok(())
    }

    /// Append to the transaction index, pruning to the most recent
    /// `TX_INDEX_RETAIN` records per part.
    pub fn index_transaction(
        &self,
        part_hash: &PartHash,
        kind: MutationKind,
        transaction_id: &str,
        timestamp_sec: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let part = part_hash.to_hex();
        txn.execute(
            "INSERT INTO tx_index (part_hash, kind, transaction_id, timestamp_sec) \
             VALUES (?1, ?2, ?3, ?4)",
            params![part, kind.as_str(), transaction_id, timestamp_sec as i64],
        )?;
        txn.execute(
            "DELETE FROM tx_index WHERE part_hash = ?1 AND rowid NOT IN \
             (SELECT rowid FROM tx_index WHERE part_hash = ?1 \
              ORDER BY timestamp_sec DESC, rowid DESC LIMIT ?2)",
            params![part, TX_INDEX_RETAIN],
        )?;
        txn.commit()?;
        Ok(())
    }

    /// All known transaction records for a part, ascending by submission
    /// time. This ordering is what makes the reader's FIFO pairing work.
    pub fn lookup_transactions(
        &self,
        part_hash: &PartHash,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, transaction_id, timestamp_sec FROM tx_index \
             WHERE part_hash = ?1 ORDER BY timestamp_sec ASC, rowid ASC",
        )?;
        let mut rows = stmt.query(params![part_hash.to_hex()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            let transaction_id: String = row.get(1)?;
            let timestamp_sec: i64 = row.get(2)?;
            out.push(TransactionRecord {
                part_hash: *part_hash,
                kind: parse_kind(&kind)?,
                transaction_id,
                timestamp_sec: to_u64(timestamp_sec, "timestamp_sec")?,
            });
        }
        Ok(out)
    }

    /// Return InFlight entries to Pending. Called on open; also useful for
    /// tests that simulate a crash.
    pub fn recover_in_flight(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE queue SET state = 'pending' WHERE state = 'in_flight'",
            [],
        )?;
        Ok(updated)
    }

    pub fn sync_status(&self) -> Result<SyncStatus, StoreError> {
        let conn = self.conn()?;
        let pending_count: i64 = conn.query_row("SELECT COUNT(*) FROM queue", [], |r| r.get(0))?;
        let failed_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mutation_log WHERE state = 'failed'",
            [],
            |r| r.get(0),
        )?;
        let last_sync_at_ms: Option<i64> = conn.query_row(
            "SELECT MAX(completed_at_ms) FROM mutation_log WHERE state = 'synced'",
            [],
            |r| r.get(0),
        )?;
        Ok(SyncStatus {
            pending_count: pending_count.max(0) as u64,
            failed_count: failed_count.max(0) as u64,
            last_sync_at_ms: last_sync_at_ms.map(|ms| ms.max(0) as u64),
        })
    }

    /// Terminal failures, newest first. These represent unrecorded field
    /// work and are kept indefinitely for audit.
    pub fn list_failed(&self) -> Result<Vec<Mutation>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, part_hash, payload, state, attempts, enqueued_at_ms, \
                    completed_at_ms, transaction_id, last_error \
             FROM mutation_log WHERE state = 'failed' ORDER BY completed_at_ms DESC, id DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(log_row_to_mutation(row)?);
        }
        Ok(out)
    }

    /// Look up one mutation by id, wherever it currently lives.
    pub fn mutation(&self, id: MutationId) -> Result<Option<Mutation>, StoreError> {
        let conn = self.conn()?;
        let queued = conn
            .query_row(
                "SELECT id, kind, part_hash, payload, state, attempts, enqueued_at_ms, \
                        last_attempt_ms, last_error \
                 FROM queue WHERE id = ?1",
                params![id.0],
                row_to_owned_queue,
            )
            .optional()?;
        if let Some(row) = queued {
            return owned_queue_to_mutation(row).map(Some);
        }
        let logged = conn
            .query_row(
                "SELECT id, kind, part_hash, payload, state, attempts, enqueued_at_ms, \
                        completed_at_ms, transaction_id, last_error \
                 FROM mutation_log WHERE id = ?1",
                params![id.0],
                row_to_owned_log,
            )
            .optional()?;
        match logged {
            Some(row) => owned_log_to_mutation(row).map(Some),
            None => Ok(None),
        }
    }

    /// Transaction id of a synced mutation, if any.
    pub fn synced_transaction(&self, id: MutationId) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let tx: Option<String> = conn
            .query_row(
                "SELECT transaction_id FROM mutation_log WHERE id = ?1 AND state = 'synced'",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(tx)
    }

    /// Record the mined block for a synced mutation.
    pub fn record_confirmation(
        &self,
        id: MutationId,
        block_number: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE mutation_log SET block_number = ?2 WHERE id = ?1 AND state = 'synced'",
            params![id.0, block_number as i64],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                id,
                table: "mutation_log",
            });
        }
        Ok(())
    }

    /// Replace the cached history for a part. Best-effort optimization;
    /// reads never depend on it.
    pub fn cache_events(
        &self,
        part_hash: &PartHash,
        events: &[LedgerEvent],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let part = part_hash.to_hex();
        txn.execute("DELETE FROM event_cache WHERE part_hash = ?1", params![part])?;
        for (seq, event) in events.iter().enumerate() {
            txn.execute(
                "INSERT INTO event_cache \
                 (part_hash, seq, kind, timestamp_sec, metadata, transaction_id, block_number) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    part,
                    seq as i64,
                    event.kind.as_str(),
                    event.timestamp_sec as i64,
                    event.metadata.to_json_string(),
                    event.transaction_id,
                    event.block_number.map(|n| n as i64)
                ],
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Last cached history for a part, in cached order.
    pub fn cached_events(&self, part_hash: &PartHash) -> Result<Vec<LedgerEvent>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, timestamp_sec, metadata, transaction_id, block_number \
             FROM event_cache WHERE part_hash = ?1 ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![part_hash.to_hex()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            let timestamp_sec: i64 = row.get(1)?;
            let metadata: String = row.get(2)?;
            let transaction_id: Option<String> = row.get(3)?;
            let block_number: Option<i64> = row.get(4)?;
            out.push(LedgerEvent {
                kind: parse_kind(&kind)?,
                part_hash: *part_hash,
                timestamp_sec: to_u64(timestamp_sec, "timestamp_sec")?,
                metadata: Metadata::from_json_lossy(&metadata),
                transaction_id,
                block_number: block_number.map(|n| n.max(0) as u64),
            });
        }
        Ok(out)
    }

    fn conn(&self) -> Result<Connection, StoreError> {
        open_connection(&self.db_path, false)
    }
}

struct QueueRow {
    id: i64,
    kind: String,
    part_hash: String,
    payload: String,
    attempts: u32,
    enqueued_at_ms: i64,
}

/// Delete a queue row and return its columns, inside the caller's
/// transaction.
fn take_queue_row(txn: &Connection, id: MutationId) -> Result<QueueRow, StoreError> {
    let row = txn
        .query_row(
            "SELECT id, kind, part_hash, payload, attempts, enqueued_at_ms \
             FROM queue WHERE id = ?1",
            params![id.0],
            |row| {
                Ok(QueueRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    part_hash: row.get(2)?,
                    payload: row.get(3)?,
                    attempts: row.get(4)?,
                    enqueued_at_ms: row.get(5)?,
                })
            },
        )
        .optional()?
        .ok_or(StoreError::NotFound { id, table: "queue" })?;
    txn.execute("DELETE FROM queue WHERE id = ?1", params![id.0])?;
    Ok(row)
}

fn queue_state(txn: &Connection, id: MutationId) -> Result<Option<MutationState>, StoreError> {
    let raw: Option<String> = txn
        .query_row(
            "SELECT state FROM queue WHERE id = ?1",
            params![id.0],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => parse_state(&raw).map(Some),
        None => Ok(None),
    }
}

type OwnedQueueRow = (
    i64,
    String,
    String,
    String,
    String,
    u32,
    i64,
    Option<i64>,
    Option<String>,
);

fn row_to_owned_queue(row: &rusqlite::Row<'_>) -> Result<OwnedQueueRow, rusqlite::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn owned_queue_to_mutation(row: OwnedQueueRow) -> Result<Mutation, StoreError> {
    let (id, kind, part_hash, payload, state, attempts, enqueued_at_ms, last_attempt_ms, last_error) =
        row;
    Ok(Mutation {
        id: MutationId(id),
        kind: parse_kind(&kind)?,
        part_hash: parse_part_hash(&part_hash)?,
        payload: Metadata::from_json_lossy(&payload),
        state: parse_state(&state)?,
        attempts,
        enqueued_at_ms: to_u64(enqueued_at_ms, "enqueued_at_ms")?,
        last_attempt_ms: last_attempt_ms.map(|ms| ms.max(0) as u64),
        last_error,
        transaction_id: None,
    })
}

fn queue_row_to_mutation(row: &rusqlite::Row<'_>) -> Result<Mutation, StoreError> {
    owned_queue_to_mutation(row_to_owned_queue(row)?)
}

type OwnedLogRow = (
    i64,
    String,
    String,
    String,
    String,
    u32,
    i64,
    i64,
    Option<String>,
    Option<String>,
);

fn row_to_owned_log(row: &rusqlite::Row<'_>) -> Result<OwnedLogRow, rusqlite::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn owned_log_to_mutation(row: OwnedLogRow) -> Result<Mutation, StoreError> {
    let (
        id,
        kind,
        part_hash,
        payload,
        state,
        attempts,
        enqueued_at_ms,
        completed_at_ms,
        transaction_id,
        last_error,
    ) = row;
    let state = parse_state(&state)?;
    if state == MutationState::Synced && transaction_id.is_none() {
        return Err(StoreError::Corruption(format!(
            "synced mutation {id} has no transaction id"
        )));
    }
    Ok(Mutation {
        id: MutationId(id),
        kind: parse_kind(&kind)?,
        part_hash: parse_part_hash(&part_hash)?,
        payload: Metadata::from_json_lossy(&payload),
        state,
        attempts,
        enqueued_at_ms: to_u64(enqueued_at_ms, "enqueued_at_ms")?,
        last_attempt_ms: Some(to_u64(completed_at_ms, "completed_at_ms")?),
        last_error,
        transaction_id,
    })
}

fn log_row_to_mutation(row: &rusqlite::Row<'_>) -> Result<Mutation, StoreError> {
    owned_log_to_mutation(row_to_owned_log(row)?)
}

fn parse_kind(raw: &str) -> Result<MutationKind, StoreError> {
    MutationKind::parse(raw)
        .map_err(|_| StoreError::Corruption(format!("unknown mutation kind {raw:?} in store")))
}

fn parse_state(raw: &str) -> Result<MutationState, StoreError> {
    MutationState::parse(raw)
        .ok_or_else(|| StoreError::Corruption(format!("unknown mutation state {raw:?} in store")))
}

fn parse_part_hash(raw: &str) -> Result<PartHash, StoreError> {
    PartHash::parse(raw)
        .map_err(|err| StoreError::Corruption(format!("bad part hash in store: {err}")))
}

fn to_u64(value: i64, field: &str) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::Corruption(format!("negative {field} in store: {value}")))
}

fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS queue (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           kind TEXT NOT NULL,
           part_hash TEXT NOT NULL,
           payload TEXT NOT NULL,
           state TEXT NOT NULL CHECK (state IN ('pending', 'in_flight')),
           attempts INTEGER NOT NULL DEFAULT 0,
           enqueued_at_ms INTEGER NOT NULL,
           last_attempt_ms INTEGER,
           last_error TEXT
         );
         CREATE INDEX IF NOT EXISTS queue_by_state ON queue (state, id);
         CREATE TABLE IF NOT EXISTS mutation_log (
           id INTEGER PRIMARY KEY,
           kind TEXT NOT NULL,
           part_hash TEXT NOT NULL,
           payload TEXT NOT NULL,
           state TEXT NOT NULL CHECK (state IN ('synced', 'failed')),
           attempts INTEGER NOT NULL,
           enqueued_at_ms INTEGER NOT NULL,
           completed_at_ms INTEGER NOT NULL,
           transaction_id TEXT,
           block_number INTEGER,
           last_error TEXT,
           CHECK (state != 'synced' OR transaction_id IS NOT NULL)
         );
         CREATE INDEX IF NOT EXISTS log_by_state ON mutation_log (state, completed_at_ms);
         CREATE TABLE IF NOT EXISTS tx_index (
           part_hash TEXT NOT NULL,
           kind TEXT NOT NULL,
           transaction_id TEXT NOT NULL,
           timestamp_sec INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS tx_index_by_part ON tx_index (part_hash, timestamp_sec);
         CREATE TABLE IF NOT EXISTS event_cache (
           part_hash TEXT NOT NULL,
           seq INTEGER NOT NULL,
           kind TEXT NOT NULL,
           timestamp_sec INTEGER NOT NULL,
           metadata TEXT NOT NULL,
           transaction_id TEXT,
           block_number INTEGER,
           PRIMARY KEY (part_hash, seq)
         );
         CREATE TABLE IF NOT EXISTS meta (
           key TEXT PRIMARY KEY,
           value TEXT NOT NULL
         );",
    )?;
    conn.execute(
        "INSERT INTO meta (key, value) VALUES ('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

fn validate_schema_version(conn: &Connection) -> Result<(), StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let raw = raw.ok_or_else(|| StoreError::Corruption("missing schema_version".to_string()))?;
    let got: u32 = raw
        .parse()
        .map_err(|_| StoreError::Corruption(format!("bad schema_version {raw:?}")))?;
    if got != SCHEMA_VERSION {
        return Err(StoreError::SchemaVersionMismatch {
            expected: SCHEMA_VERSION,
            got,
        });
    }
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn open_connection(path: &Path, create: bool) -> Result<Connection, StoreError> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
    if create {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }
    let conn = Connection::open_with_flags(path, flags)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(conn)
}

fn reject_symlink(path: &Path) -> Result<(), StoreError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(StoreError::Symlink {
            path: path.to_path_buf(),
        }),
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}
