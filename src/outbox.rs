//! Outbox queue: the durable, append-only log of pending mutations.
//!
//! Every write that cannot be confirmed against the network lands here and
//! survives restarts. Entries move through
//! `pending -> sending -> {synced | error}`; a manual or automatic retry
//! moves `error` back to `pending` with a fresh timestamp. `sending` is
//! never terminal: an entry stuck there after an interrupted drain is
//! re-processed under its original idempotency key.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::db::{Db, Table};
use crate::error::SyncError;

/// Default retention window for synced entries before pruning.
pub const SYNCED_RETENTION: Duration = Duration::from_secs(5 * 60);

/// Entity kind a queued mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Product,
    Category,
    Pedido,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::Category => "category",
            EntityType::Pedido => "pedido",
        }
    }

    fn parse(s: &str) -> Result<Self, SyncError> {
        match s {
            "product" => Ok(EntityType::Product),
            "category" => Ok(EntityType::Category),
            "pedido" => Ok(EntityType::Pedido),
            other => Err(SyncError::UnsupportedEntry(format!("entity_type {other}"))),
        }
    }
}

/// Operation carried by an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutboxOp {
    Create,
    Update,
    Delete,
    CashPayment,
}

impl OutboxOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxOp::Create => "create",
            OutboxOp::Update => "update",
            OutboxOp::Delete => "delete",
            OutboxOp::CashPayment => "cash-payment",
        }
    }

    fn parse(s: &str) -> Result<Self, SyncError> {
        match s {
            "create" => Ok(OutboxOp::Create),
            "update" => Ok(OutboxOp::Update),
            "delete" => Ok(OutboxOp::Delete),
            "cash-payment" => Ok(OutboxOp::CashPayment),
            other => Err(SyncError::UnsupportedEntry(format!("op {other}"))),
        }
    }
}

/// Per-entry lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sending,
    Synced,
    Error,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sending => "sending",
            OutboxStatus::Synced => "synced",
            OutboxStatus::Error => "error",
        }
    }

    fn parse(s: &str) -> Result<Self, SyncError> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "sending" => Ok(OutboxStatus::Sending),
            "synced" => Ok(OutboxStatus::Synced),
            "error" => Ok(OutboxStatus::Error),
            other => Err(SyncError::UnsupportedEntry(format!("status {other}"))),
        }
    }
}

/// One queued mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub key: i64,
    pub entity_type: EntityType,
    pub op: OutboxOp,
    pub payload: Value,
    pub temp_id: Option<String>,
    pub target_id: Option<String>,
    pub idempotency_key: String,
    /// Epoch millis of the last (re)submission.
    pub ts: i64,
    pub status: OutboxStatus,
    pub error: Option<String>,
    pub synced_at: Option<String>,
}

/// Input for [`enqueue`].
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub entity_type: EntityType,
    pub op: OutboxOp,
    pub payload: Value,
    pub temp_id: Option<String>,
    pub target_id: Option<String>,
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, Option<String>, Option<String>, String, i64, String, Option<String>, Option<String>)> {
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
        row.get(10)?,
    ))
}

fn build_entry(
    raw: (i64, String, String, String, Option<String>, Option<String>, String, i64, String, Option<String>, Option<String>),
) -> Result<OutboxEntry, SyncError> {
    let (key, entity_type, op, payload, temp_id, target_id, idempotency_key, ts, status, error, synced_at) = raw;
    Ok(OutboxEntry {
        key,
        entity_type: EntityType::parse(&entity_type)?,
        op: OutboxOp::parse(&op)?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        temp_id,
        target_id,
        idempotency_key,
        ts,
        status: OutboxStatus::parse(&status)?,
        error,
        synced_at,
    })
}

const SELECT_COLS: &str = "key, entity_type, op, payload, temp_id, target_id, \
     idempotency_key, ts, status, error, synced_at";

/// Append a new entry with `status = pending` and a fresh idempotency key.
///
/// Purely local: always succeeds regardless of connectivity. The committed
/// write doubles as the background-delivery hint for any listener.
pub fn enqueue(db: &Db, new: NewEntry) -> Result<OutboxEntry, SyncError> {
    let ts = Utc::now().timestamp_millis();
    let idempotency_key = Uuid::new_v4().to_string();
    let payload = serde_json::to_string(&new.payload)?;

    let key = {
        let conn = db.conn()?;
        conn.execute(
            "INSERT INTO outbox (entity_type, op, payload, temp_id, target_id, idempotency_key, ts, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending')",
            params![
                new.entity_type.as_str(),
                new.op.as_str(),
                payload,
                new.temp_id,
                new.target_id,
                idempotency_key,
                ts,
            ],
        )?;
        conn.last_insert_rowid()
    };
    db.notify(Table::Outbox);

    debug!(
        key,
        entity_type = new.entity_type.as_str(),
        op = new.op.as_str(),
        "outbox entry enqueued"
    );

    Ok(OutboxEntry {
        key,
        entity_type: new.entity_type,
        op: new.op,
        payload: new.payload,
        temp_id: new.temp_id,
        target_id: new.target_id,
        idempotency_key,
        ts,
        status: OutboxStatus::Pending,
        error: None,
        synced_at: None,
    })
}

/// Transition an entry's status in place.
pub fn update_status(
    db: &Db,
    key: i64,
    status: OutboxStatus,
    error: Option<&str>,
) -> Result<(), SyncError> {
    {
        let conn = db.conn()?;
        match status {
            OutboxStatus::Synced => {
                conn.execute(
                    "UPDATE outbox
                     SET status = 'synced', error = NULL, ts = ?2, synced_at = ?3
                     WHERE key = ?1",
                    params![key, Utc::now().timestamp_millis(), Utc::now().to_rfc3339()],
                )?;
            }
            _ => {
                conn.execute(
                    "UPDATE outbox SET status = ?2, error = ?3 WHERE key = ?1",
                    params![key, status.as_str(), error],
                )?;
            }
        }
    }
    db.notify(Table::Outbox);
    Ok(())
}

/// Reset an entry to `pending` for a retry: fresh `ts`, cleared error.
pub fn mark_retry(db: &Db, key: i64) -> Result<(), SyncError> {
    {
        let conn = db.conn()?;
        conn.execute(
            "UPDATE outbox SET status = 'pending', error = NULL, ts = ?2 WHERE key = ?1",
            params![key, Utc::now().timestamp_millis()],
        )?;
    }
    db.notify(Table::Outbox);
    Ok(())
}

/// All entries in insertion order (drain input and the UI queue table).
pub fn list_all(db: &Db) -> Result<Vec<OutboxEntry>, SyncError> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLS} FROM outbox ORDER BY ts ASC, key ASC"
    ))?;
    let rows: Vec<_> = stmt
        .query_map([], row_to_entry)?
        .collect::<Result<_, _>>()?;
    rows.into_iter().map(build_entry).collect()
}

/// Entries awaiting delivery (`pending` or `error`), in insertion order.
pub fn list_pending(db: &Db) -> Result<Vec<OutboxEntry>, SyncError> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLS} FROM outbox
         WHERE status IN ('pending', 'error')
         ORDER BY ts ASC, key ASC"
    ))?;
    let rows: Vec<_> = stmt
        .query_map([], row_to_entry)?
        .collect::<Result<_, _>>()?;
    rows.into_iter().map(build_entry).collect()
}

/// Point lookup.
pub fn get(db: &Db, key: i64) -> Result<Option<OutboxEntry>, SyncError> {
    let conn = db.conn()?;
    let raw = conn
        .query_row(
            &format!("SELECT {SELECT_COLS} FROM outbox WHERE key = ?1"),
            params![key],
            row_to_entry,
        )
        .optional()?;
    raw.map(build_entry).transpose()
}

/// Delete an entry unconditionally (user discard / cleanup).
pub fn remove(db: &Db, key: i64) -> Result<(), SyncError> {
    {
        let conn = db.conn()?;
        conn.execute("DELETE FROM outbox WHERE key = ?1", params![key])?;
    }
    db.notify(Table::Outbox);
    Ok(())
}

/// Rewrite pending entries that still target a provisional id once the
/// server has assigned the real one, so later FIFO replays hit the right
/// resource.
pub fn remap_target(db: &Db, temp_id: &str, real_id: &str) -> Result<usize, SyncError> {
    let changed = {
        let conn = db.conn()?;
        conn.execute(
            "UPDATE outbox SET target_id = ?2
             WHERE target_id = ?1 AND status IN ('pending', 'sending', 'error')",
            params![temp_id, real_id],
        )?
    };
    if changed > 0 {
        debug!(temp_id, real_id, changed, "remapped outbox targets");
        db.notify(Table::Outbox);
    }
    Ok(changed)
}

/// Delete `synced` entries older than `max_age`. Housekeeping only: never
/// touches pending/sending/error entries; idempotent.
pub fn prune_synced(db: &Db, max_age: Duration) -> Result<usize, SyncError> {
    let limit = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
    let pruned = {
        let conn = db.conn()?;
        conn.execute(
            "DELETE FROM outbox WHERE status = 'synced' AND ts <= ?1",
            params![limit],
        )?
    };
    if pruned > 0 {
        debug!(pruned, "pruned synced outbox entries");
        db.notify(Table::Outbox);
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_db() -> Db {
        Db::open_in_memory().expect("open in-memory db")
    }

    fn enqueue_product_create(db: &Db) -> OutboxEntry {
        enqueue(
            db,
            NewEntry {
                entity_type: EntityType::Product,
                op: OutboxOp::Create,
                payload: json!({ "body": { "nombre": "Taco" } }),
                temp_id: Some("tmp-1".into()),
                target_id: None,
            },
        )
        .expect("enqueue")
    }

    #[test]
    fn test_enqueue_assigns_key_and_idempotency_key() {
        let db = test_db();
        let a = enqueue_product_create(&db);
        let b = enqueue_product_create(&db);

        assert!(b.key > a.key, "keys should be monotonically increasing");
        assert_ne!(a.idempotency_key, b.idempotency_key);
        assert_eq!(a.status, OutboxStatus::Pending);
        assert!(a.error.is_none());
    }

    #[test]
    fn test_list_pending_includes_error_entries_in_order() {
        let db = test_db();
        let a = enqueue_product_create(&db);
        let b = enqueue_product_create(&db);
        let c = enqueue_product_create(&db);

        update_status(&db, b.key, OutboxStatus::Error, Some("HTTP 503")).unwrap();
        update_status(&db, c.key, OutboxStatus::Synced, None).unwrap();

        let pending = list_pending(&db).unwrap();
        let keys: Vec<i64> = pending.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![a.key, b.key]);
        assert_eq!(pending[1].error.as_deref(), Some("HTTP 503"));
    }

    #[test]
    fn test_mark_retry_resets_ts_and_clears_error() {
        let db = test_db();
        let entry = enqueue_product_create(&db);
        update_status(&db, entry.key, OutboxStatus::Error, Some("HTTP 500")).unwrap();

        mark_retry(&db, entry.key).unwrap();

        let reloaded = get(&db, entry.key).unwrap().expect("entry exists");
        assert_eq!(reloaded.status, OutboxStatus::Pending);
        assert!(reloaded.error.is_none());
        assert!(reloaded.ts >= entry.ts);
    }

    #[test]
    fn test_prune_synced_is_idempotent_and_spares_unsynced() {
        let db = test_db();
        let synced = enqueue_product_create(&db);
        let pending = enqueue_product_create(&db);
        let errored = enqueue_product_create(&db);

        update_status(&db, synced.key, OutboxStatus::Synced, None).unwrap();
        update_status(&db, errored.key, OutboxStatus::Error, Some("x")).unwrap();

        // Age the synced entry past any retention window.
        {
            let conn = db.conn().unwrap();
            conn.execute(
                "UPDATE outbox SET ts = 0 WHERE key = ?1",
                params![synced.key],
            )
            .unwrap();
        }

        let first = prune_synced(&db, Duration::from_secs(60)).unwrap();
        assert_eq!(first, 1);
        let second = prune_synced(&db, Duration::from_secs(60)).unwrap();
        assert_eq!(second, 0, "second prune with no new synced rows is a no-op");

        assert!(get(&db, pending.key).unwrap().is_some());
        assert!(get(&db, errored.key).unwrap().is_some());
        assert!(get(&db, synced.key).unwrap().is_none());
    }

    #[test]
    fn test_prune_respects_retention_window() {
        let db = test_db();
        let fresh = enqueue_product_create(&db);
        update_status(&db, fresh.key, OutboxStatus::Synced, None).unwrap();

        // Freshly synced: ts was just refreshed, must survive a 5-minute window.
        let pruned = prune_synced(&db, SYNCED_RETENTION).unwrap();
        assert_eq!(pruned, 0);
        assert!(get(&db, fresh.key).unwrap().is_some());
    }

    #[test]
    fn test_remap_target_rewrites_only_unsynced_entries() {
        let db = test_db();
        let upd = enqueue(
            &db,
            NewEntry {
                entity_type: EntityType::Product,
                op: OutboxOp::Update,
                payload: json!({ "body": { "nombre": "Taco XL" } }),
                temp_id: None,
                target_id: Some("tmp-9".into()),
            },
        )
        .unwrap();
        let done = enqueue(
            &db,
            NewEntry {
                entity_type: EntityType::Product,
                op: OutboxOp::Delete,
                payload: json!({}),
                temp_id: None,
                target_id: Some("tmp-9".into()),
            },
        )
        .unwrap();
        update_status(&db, done.key, OutboxStatus::Synced, None).unwrap();

        let changed = remap_target(&db, "tmp-9", "42").unwrap();
        assert_eq!(changed, 1);

        assert_eq!(
            get(&db, upd.key).unwrap().unwrap().target_id.as_deref(),
            Some("42")
        );
        assert_eq!(
            get(&db, done.key).unwrap().unwrap().target_id.as_deref(),
            Some("tmp-9"),
            "synced entries keep their historical target"
        );
    }

    #[test]
    fn test_synced_status_refreshes_ts_and_synced_at() {
        let db = test_db();
        let entry = enqueue_product_create(&db);
        update_status(&db, entry.key, OutboxStatus::Synced, None).unwrap();

        let reloaded = get(&db, entry.key).unwrap().unwrap();
        assert_eq!(reloaded.status, OutboxStatus::Synced);
        assert!(reloaded.synced_at.is_some());
        assert!(reloaded.ts >= entry.ts);
    }
}
