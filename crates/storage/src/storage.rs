//! Entry point tying the components to one store handle.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use jobvault_store::{FileStore, InMemoryStore, RecordStore};

use crate::batch::WriteBatch;
use crate::error::{StorageError, StorageResult};
use crate::hashes::HashStore;
use crate::jobs::JobRepository;
use crate::lock::LockManager;
use crate::monitoring::MonitoringApi;
use crate::options::StorageOptions;
use crate::queue::QueueService;
use crate::schema::Database;
use crate::servers::{ServerRegistry, ServerWatchdog};
use crate::sets::SortedSetStore;
use crate::sweeper::ExpirationSweeper;

/// Job storage over an explicit store handle.
///
/// Cheap to clone when `S` is (e.g. an `Arc`); every component handed out
/// shares the same store.
#[derive(Debug, Clone)]
pub struct JobStorage<S> {
    store: S,
    options: StorageOptions,
}

impl JobStorage<Arc<InMemoryStore<Database>>> {
    /// Process-local storage, lost on exit.
    pub fn in_memory(options: StorageOptions) -> Self {
        Self::new(Arc::new(InMemoryStore::new(Database::default())), options)
    }
}

impl JobStorage<Arc<FileStore<Database>>> {
    /// Storage persisted to a JSON snapshot at `path`, loading it if present.
    ///
    /// Fails while another handle owns the same path; share one `JobStorage`
    /// (it is cheap to clone) instead of opening the path twice.
    pub fn open(path: impl Into<PathBuf>, options: StorageOptions) -> StorageResult<Self> {
        let path = path.into();
        let store = FileStore::open(path.clone())
            .map_err(|e| StorageError::from(e).context("open", path.display().to_string()))?;
        info!(path = %path.display(), "job storage opened");
        Ok(Self::new(Arc::new(store), options))
    }
}

impl<S> JobStorage<S>
where
    S: RecordStore<State = Database> + Clone,
{
    pub fn new(store: S, options: StorageOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn locks(&self) -> LockManager<S> {
        LockManager::new(
            self.store.clone(),
            self.options.lock_poll_interval,
            self.options.lock_lifetime,
        )
    }

    pub fn jobs(&self) -> JobRepository<S> {
        JobRepository::new(self.store.clone())
    }

    pub fn queues(&self) -> QueueService<S> {
        QueueService::new(self.store.clone(), &self.options)
    }

    pub fn sets(&self) -> SortedSetStore<S> {
        SortedSetStore::new(self.store.clone())
    }

    pub fn hashes(&self) -> HashStore<S> {
        HashStore::new(self.store.clone())
    }

    pub fn servers(&self) -> ServerRegistry<S> {
        ServerRegistry::new(self.store.clone())
    }

    pub fn monitoring(&self) -> MonitoringApi<S> {
        MonitoringApi::new(self.store.clone())
    }

    pub fn batch(&self) -> WriteBatch<S> {
        WriteBatch::new(self.store.clone())
    }

    pub fn sweeper(&self) -> ExpirationSweeper<S> {
        ExpirationSweeper::new(self.store.clone(), &self.options)
    }
}

impl<S> JobStorage<S>
where
    S: RecordStore<State = Database> + Clone + 'static,
{
    pub fn watchdog(&self) -> ServerWatchdog<S> {
        ServerWatchdog::new(
            self.servers(),
            self.options.server_check_interval,
            self.options.server_timeout,
        )
    }
}
