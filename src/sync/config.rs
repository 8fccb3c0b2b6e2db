//! Sync engine settings.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Per-request deadline for remote calls. A cycle with no response
    /// within this window fails the phase as a network error rather than
    /// hanging.
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}
