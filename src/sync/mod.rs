pub mod config;
pub mod connectivity;
pub mod remote;

mod orchestrator;

pub use config::SyncConfig;
pub use connectivity::ConnectivityMonitor;
pub use orchestrator::{SharedStore, SyncError, SyncOrchestrator, SyncReport};
pub use remote::{ChangeEvent, ChangeKind, RemoteError, RemoteRecord, RemoteStore, SyncContext};
