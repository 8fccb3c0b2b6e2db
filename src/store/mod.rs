mod events;
mod local;
mod models;
mod tracker;

pub use events::{EventKind, StoreEvent};
pub use local::{LocalStore, Result, StorageError, StoredRecord};
pub use models::{
    Card, Collection, Course, Entity, EntityId, Memo, PendingDeletion, Rating, ReviewProgress,
    ReviewStatus, Subject, UserId, WorkspaceId,
};
pub use tracker::ChangeTracker;
