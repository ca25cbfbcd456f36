//! Persistent job storage engine.
//!
//! Built on top of a [`jobvault_store::RecordStore`], this crate provides the
//! storage side of a background job system:
//!
//! - `LockManager`: resource-scoped mutual exclusion among all holders of a store
//! - `JobRepository`: jobs, parameters, and append-only state history
//! - `QueueService`: claim-based enqueue/dequeue with fetch timeouts
//! - `SortedSetStore` / `HashStore`: scheduling and indexing primitives
//! - `ServerRegistry`: worker-process liveness and timeout eviction
//! - `ExpirationSweeper`: background reclamation of expired records
//! - `WriteBatch`: several mutations committed as one transaction
//! - `MonitoringApi`: read-only aggregate views
//!
//! `JobStorage` ties them together over one explicit store handle.

pub mod batch;
pub mod cancel;
pub mod error;
pub mod hashes;
pub mod jobs;
pub mod lock;
pub mod monitoring;
pub mod options;
pub mod queue;
pub mod schema;
pub mod servers;
pub mod sets;
pub mod storage;
pub mod sweeper;
pub mod workers;

mod time;


pub use batch::WriteBatch;
pub use cancel::CancellationToken;
pub use error::{LockError, StorageError, StorageResult};
pub use hashes::HashStore;
pub use jobs::{Invocation, JobData, JobRepository, LoadError, NewState, StateData};
pub use lock::{LockGuard, LockManager};
pub use monitoring::{JobDetails, JobSummary, MonitoringApi, QueueSummary, Statistics};
pub use options::{BackoffStrategy, PollBackoff, StorageOptions};
pub use queue::{FetchedJob, QueueService};
pub use schema::Database;
pub use servers::{ServerContext, ServerRecord, ServerRegistry, ServerWatchdog};
pub use sets::SortedSetStore;
pub use storage::JobStorage;
pub use sweeper::{ExpirationSweeper, SweepReport};
pub use workers::WorkerHandle;
