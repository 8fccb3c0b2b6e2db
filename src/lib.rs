//! Offline-first study core: a local flashcard store, a deterministic
//! spaced-repetition scheduler, and a sync engine that reconciles the
//! local replica with a shared remote store.

pub mod scheduler;
pub mod service;
pub mod store;
pub mod sync;

pub use service::{DueCard, ServiceError, StudyService, DEFAULT_SUBJECT_NAME};
pub use store::{
    Card, Collection, Course, EntityId, LocalStore, Memo, Rating, ReviewProgress, ReviewStatus,
    Subject, UserId, WorkspaceId,
};
pub use sync::{
    ConnectivityMonitor, RemoteStore, SyncConfig, SyncContext, SyncError, SyncReport,
};
