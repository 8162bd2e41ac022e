pub mod comparator;
pub mod engine;
pub mod error;
pub mod path;
pub mod progress;
pub mod scanner;
pub mod throttle;
pub mod transfer;

pub use comparator::{Action, ActionSummary, CompareConfig, FileComparator, Plan, SyncMode};
pub use engine::{
    plan, synchronize, Direction, SyncConfig, SyncEngine, SyncPlan, SyncReport, SyncRequest, SyncStatus,
};
pub use error::SyncError;
pub use path::{normalize, PathError, RelPath};
pub use progress::{ActionKind, Outcome, ProgressEvent, ProgressReporter};
pub use scanner::{FileScanner, PartialListingPolicy, ScanConfig, TreeListing, WalkEvent};
pub use transfer::{ExecutionSummary, ExecutorConfig, FailedItem, TransferExecutor};
