pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod storage;

pub use crate::core::{
    synchronize, Direction, ProgressEvent, ProgressReporter, RelPath, SyncConfig, SyncEngine,
    SyncError, SyncMode, SyncReport, SyncRequest, SyncStatus,
};
pub use crate::storage::{LocalStorage, Storage, StorageError, WebDavStorage};
