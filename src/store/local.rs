//! SQLite-backed local replica.
//!
//! One table per collection, each row an envelope (id, workspace, update
//! timestamp, sync flag) around a JSON document payload, plus the
//! pending-deletions tombstone table and a key/value table for sync
//! metadata (last-sync timestamp per workspace, change-tracker high-water
//! mark). All multi-row mutations commit as single transactions.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::{EventKind, StoreEvent};
use super::models::{
    Collection, Entity, EntityId, PendingDeletion, ReviewProgress, Subject, UserId, WorkspaceId,
};
use super::tracker::ChangeTracker;

/// Envelope fields live in indexed columns, not in the JSON payload.
const ENVELOPE_FIELDS: [&str; 4] = ["id", "workspaceId", "updatedAt", "isSynced"];

const META_HIGH_WATER: &str = "updated_at_high_water";

/// Capacity of the committed-event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{collection} record not found: {id}")]
    NotFound { collection: Collection, id: EntityId },

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One stored row: the envelope columns plus the content payload.
/// Remote records are merged through this same shape.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: EntityId,
    pub workspace_id: WorkspaceId,
    pub updated_at: DateTime<Utc>,
    pub is_synced: bool,
    pub payload: Value,
}

impl StoredRecord {
    /// Re-inject the envelope fields into the payload so it deserializes
    /// as a full entity. The columns are authoritative; whatever the
    /// payload carried for these fields is discarded.
    pub fn hydrate(&self) -> Value {
        let mut value = self.payload.clone();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("id".into(), Value::String(self.id.to_string()));
            obj.insert(
                "workspaceId".into(),
                Value::String(self.workspace_id.to_string()),
            );
            obj.insert(
                "updatedAt".into(),
                Value::String(self.updated_at.to_rfc3339()),
            );
            obj.insert("isSynced".into(), Value::Bool(self.is_synced));
        }
        value
    }

    pub fn decode<E: Entity>(&self) -> Result<E> {
        Ok(serde_json::from_value(self.hydrate())?)
    }

    pub fn from_entity<E: Entity>(entity: &E) -> Result<Self> {
        let mut payload = serde_json::to_value(entity)?;
        if let Some(obj) = payload.as_object_mut() {
            for field in ENVELOPE_FIELDS {
                obj.remove(field);
            }
        }
        Ok(Self {
            id: entity.id().clone(),
            workspace_id: entity.workspace_id(),
            updated_at: entity.updated_at(),
            is_synced: entity.is_synced(),
            payload,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_id(raw: &str) -> Result<EntityId> {
    raw.parse()
        .map_err(|e| StorageError::Corrupt(format!("bad entity id '{}': {}", raw, e)))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StorageError::Corrupt(format!("bad uuid '{}': {}", raw, e)))
}

/// Local store for one device. Not internally synchronized; callers share
/// it behind a mutex (see `SharedStore`).
pub struct LocalStore {
    conn: Connection,
    tracker: ChangeTracker,
    events: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Corrupt(format!("cannot create store dir: {}", e)))?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let mut schema = String::new();
        for collection in Collection::all() {
            let table = collection.table_name();
            schema.push_str(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    is_synced INTEGER NOT NULL,
                    data TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_workspace ON {table}(workspace_id);
                CREATE INDEX IF NOT EXISTS idx_{table}_updated_at ON {table}(updated_at);
                CREATE INDEX IF NOT EXISTS idx_{table}_is_synced ON {table}(is_synced);
                "#,
            ));
        }
        schema.push_str(
            r#"
            CREATE TABLE IF NOT EXISTS pending_deletions (
                entity_id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                workspace_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        );
        conn.execute_batch(&schema)?;

        let high_water = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![META_HIGH_WATER],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|raw| parse_timestamp(&raw))
            .transpose()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            conn,
            tracker: ChangeTracker::new(high_water),
            events,
        })
    }

    /// Subscribe to committed-transaction events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Issue the next monotonic update timestamp and persist the mark.
    fn stamp(&mut self) -> Result<DateTime<Utc>> {
        let stamp = self.tracker.next_timestamp(Utc::now());
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
            params![META_HIGH_WATER, stamp.to_rfc3339()],
        )?;
        Ok(stamp)
    }

    fn exists(&self, collection: Collection, id: &EntityId) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE id = ?1",
                collection.table_name()
            ),
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn write_record(&self, collection: Collection, record: &StoredRecord) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, workspace_id, updated_at, is_synced, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                collection.table_name()
            ),
            params![
                record.id.to_string(),
                record.workspace_id.to_string(),
                record.updated_at.to_rfc3339(),
                record.is_synced as i64,
                serde_json::to_string(&record.payload)?,
            ],
        )?;
        Ok(())
    }

    // ==================== Local mutation path ====================

    /// Write a locally mutated entity: stamps a fresh monotonic
    /// `updated_at`, marks it unsynced, and emits a store event.
    pub fn put_local<E: Entity>(&mut self, entity: &mut E) -> Result<()> {
        let stamp = self.stamp()?;
        entity.set_updated_at(stamp);
        entity.set_synced(false);

        let record = StoredRecord::from_entity(entity)?;
        let existed = self.exists(E::COLLECTION, &record.id)?;
        self.write_record(E::COLLECTION, &record)?;

        self.emit(StoreEvent {
            workspace_id: record.workspace_id,
            collection: E::COLLECTION,
            entity_id: record.id,
            kind: if existed {
                EventKind::Updated
            } else {
                EventKind::Created
            },
        });
        Ok(())
    }

    /// Delete a local row and record its tombstone in one transaction.
    /// Rows that never reached the remote (temporary id) leave no
    /// tombstone: there is nothing remote to delete.
    pub fn delete_with_tombstone(&mut self, collection: Collection, id: &EntityId) -> Result<()> {
        let workspace_id = self.record_workspace(collection, id)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", collection.table_name()),
            params![id.to_string()],
        )?;
        if let Some(canonical) = id.canonical() {
            tx.execute(
                "INSERT OR REPLACE INTO pending_deletions (entity_id, collection, workspace_id)
                 VALUES (?1, ?2, ?3)",
                params![
                    canonical.to_string(),
                    collection.table_name(),
                    workspace_id.to_string(),
                ],
            )?;
        }
        tx.commit()?;

        self.emit(StoreEvent {
            workspace_id,
            collection,
            entity_id: id.clone(),
            kind: EventKind::Deleted,
        });
        Ok(())
    }

    fn record_workspace(&self, collection: Collection, id: &EntityId) -> Result<WorkspaceId> {
        let raw: String = self
            .conn
            .query_row(
                &format!(
                    "SELECT workspace_id FROM {} WHERE id = ?1",
                    collection.table_name()
                ),
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound {
                collection,
                id: id.clone(),
            })?;
        Ok(WorkspaceId(parse_uuid(&raw)?))
    }

    // ==================== Reads ====================

    pub fn get<E: Entity>(&self, id: &EntityId) -> Result<Option<E>> {
        let record = self.get_record(E::COLLECTION, id)?;
        record.map(|r| r.decode()).transpose()
    }

    pub fn require<E: Entity>(&self, id: &EntityId) -> Result<E> {
        self.get(id)?.ok_or_else(|| StorageError::NotFound {
            collection: E::COLLECTION,
            id: id.clone(),
        })
    }

    pub fn list<E: Entity>(&self, workspace: WorkspaceId) -> Result<Vec<E>> {
        self.list_records(E::COLLECTION, workspace)?
            .iter()
            .map(StoredRecord::decode)
            .collect()
    }

    pub fn get_record(&self, collection: Collection, id: &EntityId) -> Result<Option<StoredRecord>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, workspace_id, updated_at, is_synced, data FROM {} WHERE id = ?1",
                    collection.table_name()
                ),
                params![id.to_string()],
                Self::row_tuple,
            )
            .optional()?;
        row.map(Self::record_from_row).transpose()
    }

    pub fn list_records(
        &self,
        collection: Collection,
        workspace: WorkspaceId,
    ) -> Result<Vec<StoredRecord>> {
        self.query_records(
            &format!(
                "SELECT id, workspace_id, updated_at, is_synced, data FROM {}
                 WHERE workspace_id = ?1 ORDER BY updated_at",
                collection.table_name()
            ),
            params![workspace.to_string()],
        )
    }

    /// All records awaiting a push for the workspace.
    pub fn list_unsynced(
        &self,
        collection: Collection,
        workspace: WorkspaceId,
    ) -> Result<Vec<StoredRecord>> {
        self.query_records(
            &format!(
                "SELECT id, workspace_id, updated_at, is_synced, data FROM {}
                 WHERE workspace_id = ?1 AND is_synced = 0 ORDER BY updated_at",
                collection.table_name()
            ),
            params![workspace.to_string()],
        )
    }

    fn query_records(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<StoredRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, Self::row_tuple)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(Self::record_from_row).collect()
    }

    #[allow(clippy::type_complexity)]
    fn row_tuple(row: &rusqlite::Row) -> rusqlite::Result<(String, String, String, i64, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
        ))
    }

    fn record_from_row(
        (id, workspace, updated_at, is_synced, data): (String, String, String, i64, String),
    ) -> Result<StoredRecord> {
        Ok(StoredRecord {
            id: parse_id(&id)?,
            workspace_id: WorkspaceId(parse_uuid(&workspace)?),
            updated_at: parse_timestamp(&updated_at)?,
            is_synced: is_synced != 0,
            payload: serde_json::from_str(&data)?,
        })
    }

    // ==================== Sync-side operations ====================

    /// Merge a batch of remote records with last-writer-wins: a record is
    /// applied only when no local row exists or the remote `updated_at` is
    /// strictly newer. The whole batch commits as one transaction, so a
    /// later network failure cannot undo it. Returns how many were applied.
    pub fn merge_remote_batch(
        &mut self,
        collection: Collection,
        records: &[StoredRecord],
    ) -> Result<usize> {
        let mut events = Vec::new();
        let tx = self.conn.transaction()?;
        for record in records {
            let existing: Option<String> = tx
                .query_row(
                    &format!(
                        "SELECT updated_at FROM {} WHERE id = ?1",
                        collection.table_name()
                    ),
                    params![record.id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            let newer = match &existing {
                None => true,
                Some(raw) => record.updated_at > parse_timestamp(raw)?,
            };
            if !newer {
                // Local is newer or equal; the next push supersedes it.
                continue;
            }

            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (id, workspace_id, updated_at, is_synced, data)
                     VALUES (?1, ?2, ?3, 1, ?4)",
                    collection.table_name()
                ),
                params![
                    record.id.to_string(),
                    record.workspace_id.to_string(),
                    record.updated_at.to_rfc3339(),
                    serde_json::to_string(&record.payload)?,
                ],
            )?;
            events.push(StoreEvent {
                workspace_id: record.workspace_id,
                collection,
                entity_id: record.id.clone(),
                kind: if existing.is_some() {
                    EventKind::Updated
                } else {
                    EventKind::Created
                },
            });
        }
        tx.commit()?;

        let applied = events.len();
        for event in events {
            self.emit(event);
        }
        Ok(applied)
    }

    /// Flip a pushed record to synced once the remote upsert acknowledged.
    /// Conditional on the `updated_at` that was pushed: a row edited while
    /// the upsert was in flight keeps its unsynced flag, so the edit
    /// uploads on the next cycle instead of being silently dropped.
    pub fn mark_synced(
        &mut self,
        collection: Collection,
        id: &EntityId,
        pushed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            &format!(
                "UPDATE {} SET is_synced = 1 WHERE id = ?1 AND updated_at = ?2",
                collection.table_name()
            ),
            params![id.to_string(), pushed_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Temporary-id reconciliation: drop the temp row and insert the
    /// canonical one the remote returned, atomically. `pushed_at` is the
    /// `updated_at` that went over the wire; if the temp row was edited
    /// after that, the edit's payload survives under the canonical id and
    /// stays unsynced rather than being overwritten by the echo.
    pub fn replace_temporary(
        &mut self,
        collection: Collection,
        temporary: &EntityId,
        canonical: &StoredRecord,
        pushed_at: DateTime<Utc>,
    ) -> Result<()> {
        let local = self.get_record(collection, temporary)?;
        let (updated_at, is_synced, payload) = match &local {
            Some(row) if row.updated_at > pushed_at => (row.updated_at, 0i64, &row.payload),
            _ => (canonical.updated_at, 1i64, &canonical.payload),
        };

        let tx = self.conn.transaction()?;
        tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", collection.table_name()),
            params![temporary.to_string()],
        )?;
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, workspace_id, updated_at, is_synced, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                collection.table_name()
            ),
            params![
                canonical.id.to_string(),
                canonical.workspace_id.to_string(),
                updated_at.to_rfc3339(),
                is_synced,
                serde_json::to_string(payload)?,
            ],
        )?;
        tx.commit()?;

        self.emit(StoreEvent {
            workspace_id: canonical.workspace_id,
            collection,
            entity_id: temporary.clone(),
            kind: EventKind::Deleted,
        });
        self.emit(StoreEvent {
            workspace_id: canonical.workspace_id,
            collection,
            entity_id: canonical.id.clone(),
            kind: EventKind::Created,
        });
        Ok(())
    }

    /// Rewrite a payload reference field after its target gained a
    /// canonical id. Touched rows are re-stamped and marked unsynced so
    /// the corrected reference pushes in the same cycle.
    pub fn rewrite_reference(
        &mut self,
        collection: Collection,
        field: &str,
        old: &EntityId,
        new: &EntityId,
    ) -> Result<usize> {
        let rows = self.query_records(
            &format!(
                "SELECT id, workspace_id, updated_at, is_synced, data FROM {}",
                collection.table_name()
            ),
            [],
        )?;

        let old_value = Value::String(old.to_string());
        let mut rewritten = 0;
        for mut record in rows {
            let matches = record.payload.get(field) == Some(&old_value);
            if !matches {
                continue;
            }
            if let Some(obj) = record.payload.as_object_mut() {
                obj.insert(field.to_string(), Value::String(new.to_string()));
            }
            record.updated_at = self.stamp()?;
            record.is_synced = false;
            self.write_record(collection, &record)?;
            self.emit(StoreEvent {
                workspace_id: record.workspace_id,
                collection,
                entity_id: record.id.clone(),
                kind: EventKind::Updated,
            });
            rewritten += 1;
        }
        Ok(rewritten)
    }

    /// Apply a deletion received from the remote change feed.
    pub fn apply_remote_delete(
        &mut self,
        collection: Collection,
        workspace: WorkspaceId,
        id: Uuid,
    ) -> Result<bool> {
        let removed = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", collection.table_name()),
            params![id.to_string()],
        )?;
        if removed > 0 {
            self.emit(StoreEvent {
                workspace_id: workspace,
                collection,
                entity_id: EntityId::Canonical(id),
                kind: EventKind::Deleted,
            });
        }
        Ok(removed > 0)
    }

    // ==================== Tombstones ====================

    pub fn pending_deletions(&self, workspace: WorkspaceId) -> Result<Vec<PendingDeletion>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, collection, workspace_id FROM pending_deletions
             WHERE workspace_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![workspace.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(entity_id, collection, ws)| {
                let collection = Collection::all()
                    .into_iter()
                    .find(|c| c.table_name() == collection)
                    .ok_or_else(|| {
                        StorageError::Corrupt(format!("unknown collection '{}'", collection))
                    })?;
                Ok(PendingDeletion {
                    entity_id: parse_uuid(&entity_id)?,
                    collection,
                    workspace_id: WorkspaceId(parse_uuid(&ws)?),
                })
            })
            .collect()
    }

    pub fn remove_tombstone(&mut self, entity_id: Uuid) -> Result<()> {
        self.conn.execute(
            "DELETE FROM pending_deletions WHERE entity_id = ?1",
            params![entity_id.to_string()],
        )?;
        Ok(())
    }

    // ==================== Sync metadata ====================

    pub fn last_sync(&self, workspace: WorkspaceId) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![format!("last_sync:{}", workspace)],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| parse_timestamp(&r)).transpose()
    }

    pub fn set_last_sync(&mut self, workspace: WorkspaceId, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
            params![format!("last_sync:{}", workspace), at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Drop every row belonging to the workspace (sign-out, after a
    /// successful final sync).
    pub fn clear_workspace(&mut self, workspace: WorkspaceId) -> Result<()> {
        let tx = self.conn.transaction()?;
        for collection in Collection::all() {
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE workspace_id = ?1",
                    collection.table_name()
                ),
                params![workspace.to_string()],
            )?;
        }
        tx.execute(
            "DELETE FROM pending_deletions WHERE workspace_id = ?1",
            params![workspace.to_string()],
        )?;
        tx.execute(
            "DELETE FROM sync_meta WHERE key = ?1",
            params![format!("last_sync:{}", workspace)],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ==================== Typed lookups ====================

    /// Case-insensitive subject lookup within a workspace.
    pub fn find_subject_by_name(
        &self,
        workspace: WorkspaceId,
        name: &str,
    ) -> Result<Option<Subject>> {
        let subjects: Vec<Subject> = self.list(workspace)?;
        Ok(subjects
            .into_iter()
            .find(|s| s.name.eq_ignore_ascii_case(name)))
    }

    /// The progress record for one (card, user) pair, if any.
    pub fn progress_for(
        &self,
        workspace: WorkspaceId,
        card_id: &EntityId,
        user: UserId,
    ) -> Result<Option<ReviewProgress>> {
        let all: Vec<ReviewProgress> = self.list(workspace)?;
        Ok(all
            .into_iter()
            .find(|p| &p.card_id == card_id && p.user_id == user))
    }

    /// All progress records for a user in a workspace.
    pub fn progress_for_user(
        &self,
        workspace: WorkspaceId,
        user: UserId,
    ) -> Result<Vec<ReviewProgress>> {
        let all: Vec<ReviewProgress> = self.list(workspace)?;
        Ok(all.into_iter().filter(|p| p.user_id == user).collect())
    }
}
