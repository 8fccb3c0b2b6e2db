//! Committed-transaction events emitted by the local store.
//!
//! Front ends subscribe here instead of observing live queries: an event
//! fires after the underlying transaction commits, and a lagging receiver
//! (tokio broadcast semantics) should treat a missed event as a cue to
//! re-query rather than expecting a complete history.

use serde::Serialize;

use super::models::{Collection, EntityId, WorkspaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEvent {
    pub workspace_id: WorkspaceId,
    pub collection: Collection,
    pub entity_id: EntityId,
    pub kind: EventKind,
}
