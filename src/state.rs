use crate::services::{
    queue_service::QueueService,
    storage_service::{StorageService, UploadStore},
};

/// Shared handler state. Components are wired once in main and cloned per
/// request; there is no other shared mutable state.
#[derive(Clone)]
pub struct AppState {
    /// Write-only store handle for the upload gateway.
    pub uploads: UploadStore,
    /// Full store handle for reads and probes.
    pub storage: StorageService,
    pub queue: QueueService,
}
