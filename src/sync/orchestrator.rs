//! Sync orchestrator: keeps the local replica and the remote store
//! eventually consistent per workspace.
//!
//! A cycle runs pull, then push, then the tombstone queue. Pull applies
//! fully before push begins, so a push can never clobber a freshly pulled
//! remote change with stale local data unless the local row is explicitly
//! marked unsynced (intentionally newer). At most one cycle runs at a time
//! per orchestrator; mutations landing mid-cycle stay unsynced and are
//! picked up by the next cycle.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::store::{Collection, EntityId, LocalStore, StorageError, StoredRecord, WorkspaceId};

use super::config::SyncConfig;
use super::remote::{ChangeKind, RemoteError, RemoteRecord, RemoteStore, SyncContext};

/// Type alias for the shared local store.
pub type SharedStore = Arc<Mutex<LocalStore>>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("active workspace changed during sync")]
    WorkspaceChanged,
}

impl SyncError {
    /// Transient failures resolve themselves on a later cycle; the caller
    /// should report non-success rather than surface an error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Remote(RemoteError::Network(_) | RemoteError::Timeout)
                | SyncError::WorkspaceChanged
        )
    }
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub success: bool,
    /// Another cycle was already running; nothing was done.
    pub in_flight: bool,
    pub pulled: usize,
    pub pushed: usize,
    pub tombstones_cleared: usize,
    /// Created records whose natural key was not unique within the push
    /// batch (reconciliation is heuristic; see push phase).
    pub ambiguities: usize,
}

impl SyncReport {
    fn in_flight_skip() -> Self {
        Self {
            in_flight: true,
            ..Default::default()
        }
    }
}

/// Which payload fields in other collections reference ids from this one.
/// After a temporary id is swapped for its canonical id, these rows are
/// rewritten (and re-marked unsynced) so they push correct references.
fn reference_fields(collection: Collection) -> &'static [(Collection, &'static str)] {
    match collection {
        Collection::Subjects => &[
            (Collection::Cards, "subjectId"),
            (Collection::Courses, "subjectId"),
        ],
        Collection::Cards => &[(Collection::ReviewProgress, "cardId")],
        Collection::Courses => &[(Collection::Memos, "courseId")],
        Collection::Memos | Collection::ReviewProgress => &[],
    }
}

pub struct SyncOrchestrator {
    store: SharedStore,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    /// At most one sync cycle at a time.
    in_flight: tokio::sync::Mutex<()>,
    /// The workspace whose results may be applied. A cycle started for a
    /// workspace that is switched away from finishes without committing.
    active_workspace: Mutex<Option<WorkspaceId>>,
}

impl SyncOrchestrator {
    pub fn new(store: SharedStore, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        Self {
            store,
            remote,
            config,
            in_flight: tokio::sync::Mutex::new(()),
            active_workspace: Mutex::new(None),
        }
    }

    pub fn set_active_workspace(&self, workspace: Option<WorkspaceId>) {
        *self.active_workspace.lock().unwrap() = workspace;
    }

    fn ensure_active(&self, ctx: &SyncContext) -> Result<(), SyncError> {
        let active = *self.active_workspace.lock().unwrap();
        match active {
            Some(ws) if ws != ctx.workspace => Err(SyncError::WorkspaceChanged),
            _ => Ok(()),
        }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        tokio::time::timeout(self.config.request_timeout, fut)
            .await
            .map_err(|_| RemoteError::Timeout)?
    }

    /// Run one full sync cycle for the workspace. Returns an in-flight
    /// report without doing anything if a cycle is already running.
    pub async fn sync_workspace(&self, ctx: &SyncContext) -> Result<SyncReport, SyncError> {
        let _guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::debug!("sync: cycle already in flight, skipping");
                return Ok(SyncReport::in_flight_skip());
            }
        };

        self.ensure_active(ctx)?;
        let cycle_start = Utc::now();
        log::info!("sync: starting cycle for workspace {}", ctx.workspace);

        let mut report = SyncReport::default();
        self.pull_phase(ctx, &mut report).await?;
        self.push_phase(ctx, &mut report).await?;
        self.tombstone_phase(ctx, &mut report).await?;

        {
            let mut store = self.store.lock().unwrap();
            store.set_last_sync(ctx.workspace, cycle_start)?;
        }

        report.success = true;
        log::info!(
            "sync: cycle complete for workspace {} (pulled {}, pushed {}, tombstones {})",
            ctx.workspace,
            report.pulled,
            report.pushed,
            report.tombstones_cleared,
        );
        Ok(report)
    }

    /// Pull: fetch remote records changed since the last sync and merge
    /// them with last-writer-wins. Each collection's batch commits as one
    /// local transaction, so work merged before a later failure stays.
    async fn pull_phase(&self, ctx: &SyncContext, report: &mut SyncReport) -> Result<(), SyncError> {
        let since = {
            let store = self.store.lock().unwrap();
            store
                .last_sync(ctx.workspace)?
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        };

        for collection in Collection::all() {
            let records = self
                .with_timeout(self.remote.fetch_changed_since(collection, ctx, since))
                .await?;
            if records.is_empty() {
                continue;
            }

            let incoming: Vec<StoredRecord> = records
                .into_iter()
                .filter_map(|r| match stored_from_remote(&r) {
                    Some(stored) => Some(stored),
                    None => {
                        log::warn!("sync: pull returned {} record without id", collection);
                        None
                    }
                })
                .collect();

            self.ensure_active(ctx)?;
            let applied = {
                let mut store = self.store.lock().unwrap();
                store.merge_remote_batch(collection, &incoming)?
            };
            log::info!(
                "sync: pull {} — {} fetched, {} applied",
                collection,
                incoming.len(),
                applied,
            );
            report.pulled += applied;
        }
        Ok(())
    }

    /// Push: upload unsynced records, one batch per collection. Creates
    /// travel without their temporary id; the canonical rows the remote
    /// returns are matched back by natural key.
    async fn push_phase(&self, ctx: &SyncContext, report: &mut SyncReport) -> Result<(), SyncError> {
        for collection in Collection::all() {
            // Re-listed per collection: reference rewrites from an earlier
            // collection's reconciliation must be visible here.
            let unsynced = {
                let store = self.store.lock().unwrap();
                store.list_unsynced(collection, ctx.workspace)?
            };
            if unsynced.is_empty() {
                continue;
            }

            let (creates, updates): (Vec<_>, Vec<_>) =
                unsynced.into_iter().partition(|r| r.id.is_temporary());

            let outgoing: Vec<RemoteRecord> = updates
                .iter()
                .chain(creates.iter())
                .map(|record| RemoteRecord {
                    id: record.id.canonical(),
                    workspace_id: record.workspace_id,
                    updated_at: record.updated_at,
                    payload: record.payload.clone(),
                })
                .collect();

            log::info!(
                "sync: push {} — {} updates, {} creates",
                collection,
                updates.len(),
                creates.len(),
            );
            let returned = self
                .with_timeout(self.remote.upsert(collection, outgoing))
                .await?;
            self.ensure_active(ctx)?;

            let update_ids: HashSet<Uuid> =
                updates.iter().filter_map(|r| r.id.canonical()).collect();
            self.reconcile_creates(collection, &creates, &update_ids, returned, report)?;

            let mut store = self.store.lock().unwrap();
            for update in &updates {
                // Conditional flip: an edit made while the upsert was in
                // flight stays unsynced and goes out next cycle.
                store.mark_synced(collection, &update.id, update.updated_at)?;
            }
            report.pushed += updates.len();
        }
        Ok(())
    }

    /// Match canonical rows returned by the upsert back to the local
    /// temporary rows they were created from. The match is heuristic
    /// (creates lose their temporary id before upload): two simultaneous
    /// creates with an identical natural key cannot be told apart, so
    /// that case is logged and counted but not treated as fatal.
    fn reconcile_creates(
        &self,
        collection: Collection,
        creates: &[StoredRecord],
        update_ids: &HashSet<Uuid>,
        returned: Vec<RemoteRecord>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        if creates.is_empty() {
            return Ok(());
        }

        // Echoes of pushed updates are excluded from the candidate pool:
        // the response carries no ordering, and a create matching an
        // update's echo would adopt the live row's canonical id and
        // collapse two logical records into one.
        let mut update_keys: HashSet<String> = HashSet::new();
        let mut by_key: HashMap<String, Vec<RemoteRecord>> = HashMap::new();
        for record in returned {
            let Some(id) = record.id else { continue };
            if let Some(key) = collection.natural_key(&record.payload) {
                if update_ids.contains(&id) {
                    update_keys.insert(key);
                } else {
                    by_key.entry(key).or_default().push(record);
                }
            }
        }

        let mut seen_keys: HashMap<String, usize> = HashMap::new();
        for create in creates {
            if let Some(key) = collection.natural_key(&create.payload) {
                *seen_keys.entry(key).or_insert(0) += 1;
            }
        }

        let mut store = self.store.lock().unwrap();
        for create in creates {
            let Some(key) = collection.natural_key(&create.payload) else {
                log::warn!(
                    "sync: {} create {} has no natural key, cannot reconcile",
                    collection,
                    create.id,
                );
                continue;
            };

            if seen_keys.get(&key).copied().unwrap_or(0) > 1 || update_keys.contains(&key) {
                log::warn!(
                    "sync: ambiguous reconciliation in {} — natural key {:?} is not unique in this batch",
                    collection,
                    key,
                );
                report.ambiguities += 1;
            }

            let Some(canonical) = by_key.get_mut(&key).and_then(Vec::pop) else {
                // Left unsynced; retried next cycle.
                log::warn!(
                    "sync: no canonical match for {} create {} (key {:?})",
                    collection,
                    create.id,
                    key,
                );
                continue;
            };

            let Some(stored) = stored_from_remote(&canonical) else {
                continue;
            };
            let canonical_id = stored.id.clone();
            store.replace_temporary(collection, &create.id, &stored, create.updated_at)?;
            report.pushed += 1;

            for (dependent, field) in reference_fields(collection) {
                let rewritten =
                    store.rewrite_reference(*dependent, field, &create.id, &canonical_id)?;
                if rewritten > 0 {
                    log::debug!(
                        "sync: rewrote {} {} references {} -> {}",
                        rewritten,
                        dependent,
                        create.id,
                        canonical_id,
                    );
                }
            }
        }
        Ok(())
    }

    /// Tombstones: issue remote deletes for the pending-deletions queue.
    /// "Already gone" counts as success remote-side; a transport failure
    /// aborts the phase and leaves the remaining tombstones queued.
    async fn tombstone_phase(
        &self,
        ctx: &SyncContext,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let pending = {
            let store = self.store.lock().unwrap();
            store.pending_deletions(ctx.workspace)?
        };
        if pending.is_empty() {
            return Ok(());
        }

        log::info!("sync: {} pending deletions", pending.len());
        for deletion in pending {
            self.with_timeout(self.remote.delete(deletion.collection, deletion.entity_id))
                .await?;
            self.ensure_active(ctx)?;
            let mut store = self.store.lock().unwrap();
            store.remove_tombstone(deletion.entity_id)?;
            report.tombstones_cleared += 1;
        }
        Ok(())
    }

    /// Consume the remote change feed: near-real-time convergence between
    /// full cycles. Upserts apply the same last-writer-wins comparison as
    /// the pull phase; deletes remove the local row directly. Returns when
    /// the feed closes or the active workspace moves away.
    pub async fn run_change_feed(&self, ctx: SyncContext) -> Result<(), SyncError> {
        let mut feed = self.remote.subscribe(&ctx);
        log::info!("sync: change feed open for workspace {}", ctx.workspace);

        while let Some(event) = feed.recv().await {
            if self.ensure_active(&ctx).is_err() {
                log::info!("sync: change feed stopping, workspace switched away");
                return Ok(());
            }

            let mut store = self.store.lock().unwrap();
            match event.kind {
                ChangeKind::Upserted(record) => {
                    let Some(stored) = stored_from_remote(&record) else {
                        log::warn!("sync: feed {} upsert without id", event.collection);
                        continue;
                    };
                    let applied = store.merge_remote_batch(event.collection, &[stored])?;
                    log::debug!(
                        "sync: feed {} upsert ({})",
                        event.collection,
                        if applied > 0 { "applied" } else { "discarded" },
                    );
                }
                ChangeKind::Deleted(id) => {
                    store.apply_remote_delete(event.collection, ctx.workspace, id)?;
                    log::debug!("sync: feed {} delete {}", event.collection, id);
                }
            }
        }

        log::info!("sync: change feed closed for workspace {}", ctx.workspace);
        Ok(())
    }
}

/// Remote records merge into the store as already-synced rows.
fn stored_from_remote(record: &RemoteRecord) -> Option<StoredRecord> {
    Some(StoredRecord {
        id: EntityId::Canonical(record.id?),
        workspace_id: record.workspace_id,
        updated_at: record.updated_at,
        is_synced: true,
        payload: record.payload.clone(),
    })
}
