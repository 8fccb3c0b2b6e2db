//! Remote store interface.
//!
//! The shared backend is an external collaborator; the orchestrator only
//! sees this trait. Canonical ids are assigned remote-side: an outgoing
//! record with `id: None` is a create, and the upsert response carries the
//! canonical row back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::store::{Collection, UserId, WorkspaceId};

#[derive(Error, Debug)]
pub enum RemoteError {
    /// Transient transport failure; retried on the next cycle.
    #[error("network error: {0}")]
    Network(String),

    /// No response within the configured request timeout.
    #[error("request timed out")]
    Timeout,

    /// The remote store refused the operation.
    #[error("rejected by remote store: {0}")]
    Rejected(String),
}

/// Workspace and user a sync cycle runs for. Threaded explicitly through
/// every call; nothing about the active workspace is ambient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncContext {
    pub workspace: WorkspaceId,
    pub user: UserId,
}

/// A record on the wire. `payload` holds the entity's content fields;
/// the envelope (id, workspace, update time) travels alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    /// `None` on a create: the remote store assigns the canonical id.
    pub id: Option<Uuid>,
    pub workspace_id: WorkspaceId,
    pub updated_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// One notification from the per-workspace change feed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone)]
pub enum ChangeKind {
    /// Insert or update of a canonical record.
    Upserted(RemoteRecord),
    /// Deletion of a canonical record.
    Deleted(Uuid),
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch records changed at or after `since` for the workspace.
    /// ReviewProgress is additionally scoped to `ctx.user`.
    async fn fetch_changed_since(
        &self,
        collection: Collection,
        ctx: &SyncContext,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Upsert a batch; returns the canonical records, including
    /// server-assigned ids for creates.
    async fn upsert(
        &self,
        collection: Collection,
        records: Vec<RemoteRecord>,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Delete by canonical id. "Already gone" is success.
    async fn delete(&self, collection: Collection, id: Uuid) -> Result<(), RemoteError>;

    /// Subscribe to the workspace's change feed. The receiver closes when
    /// the remote drops the subscription.
    fn subscribe(&self, ctx: &SyncContext) -> mpsc::Receiver<ChangeEvent>;
}
