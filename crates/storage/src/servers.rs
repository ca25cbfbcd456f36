//! Worker-process registry.
//!
//! Each worker process announces itself, heartbeats periodically, and removes
//! itself on clean shutdown. Processes that die silently are evicted by the
//! [`ServerWatchdog`] once their last heartbeat is older than the timeout.

use std::io;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument};

use jobvault_core::require_non_empty;
use jobvault_store::RecordStore;

use crate::error::{StorageError, StorageResult};
use crate::schema::Database;
use crate::time;
use crate::workers::{WorkerHandle, spawn_periodic};

pub use crate::schema::ServerRecord;

/// What a server announces about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerContext {
    pub queues: Vec<String>,
    pub worker_count: u32,
}

impl ServerContext {
    pub fn new<Q: Into<String>>(queues: impl IntoIterator<Item = Q>, worker_count: u32) -> Self {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            worker_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerRegistry<S> {
    store: S,
}

impl<S> ServerRegistry<S>
where
    S: RecordStore<State = Database>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Register or re-register a server. A re-announce keeps the original
    /// `started_at`.
    #[instrument(skip(self, context), err)]
    pub fn announce(&self, server_id: &str, context: ServerContext) -> StorageResult<()> {
        require_non_empty("server_id", server_id)?;
        let now = Utc::now();

        self.store
            .write(|db| {
                let started_at = db
                    .servers
                    .find(&server_id.to_string())
                    .map_or(now, |existing| existing.started_at);

                db.servers.insert(ServerRecord {
                    id: server_id.to_string(),
                    queues: context.queues,
                    worker_count: context.worker_count,
                    started_at,
                    last_heartbeat: now,
                });
                Ok::<_, StorageError>(())
            })
            .map_err(|e| e.context("announce_server", server_id))?;

        info!(server_id, "server announced");
        Ok(())
    }

    /// Refresh the heartbeat. Unknown servers are ignored.
    pub fn heartbeat(&self, server_id: &str) -> StorageResult<()> {
        require_non_empty("server_id", server_id)?;
        let now = Utc::now();

        self.store
            .write(|db| {
                if let Some(server) = db.servers.find_mut(&server_id.to_string()) {
                    server.last_heartbeat = now;
                }
                Ok::<_, StorageError>(())
            })
            .map_err(|e| e.context("heartbeat", server_id))
    }

    /// Deregister a server. Unknown servers are ignored.
    pub fn remove(&self, server_id: &str) -> StorageResult<()> {
        require_non_empty("server_id", server_id)?;

        let removed = self
            .store
            .write(|db| Ok::<_, StorageError>(db.servers.remove(&server_id.to_string()).is_some()))
            .map_err(|e| e.context("remove_server", server_id))?;

        if removed {
            info!(server_id, "server removed");
        }
        Ok(())
    }

    /// Remove every server whose last heartbeat is older than `timeout`.
    pub fn remove_timed_out(&self, timeout: Duration) -> StorageResult<usize> {
        let cutoff = time::sub(Utc::now(), timeout);

        let removed = self
            .store
            .write(|db| Ok::<_, StorageError>(db.servers.remove_where(|s| s.last_heartbeat < cutoff)))
            .map_err(|e| e.context("remove_timed_out_servers", ""))?;

        if removed > 0 {
            info!(removed, ?timeout, "evicted timed-out servers");
        }
        Ok(removed)
    }

    pub fn servers(&self) -> StorageResult<Vec<ServerRecord>> {
        self.store
            .read(|db| db.servers.iter().cloned().collect())
            .map_err(|e| StorageError::from(e).context("servers", ""))
    }
}

/// Background eviction of servers that stopped heartbeating.
#[derive(Debug, Clone)]
pub struct ServerWatchdog<S> {
    registry: ServerRegistry<S>,
    check_interval: Duration,
    server_timeout: Duration,
}

impl<S> ServerWatchdog<S>
where
    S: RecordStore<State = Database> + 'static,
{
    pub fn new(registry: ServerRegistry<S>, check_interval: Duration, server_timeout: Duration) -> Self {
        Self {
            registry,
            check_interval,
            server_timeout,
        }
    }

    pub fn spawn(self) -> io::Result<WorkerHandle> {
        debug!(
            check_interval = ?self.check_interval,
            server_timeout = ?self.server_timeout,
            "starting server watchdog"
        );
        let Self {
            registry,
            check_interval,
            server_timeout,
        } = self;

        spawn_periodic("jobvault-server-watchdog", check_interval, move || {
            registry.remove_timed_out(server_timeout).map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use jobvault_store::InMemoryStore;

    type Store = Arc<InMemoryStore<Database>>;

    fn registry() -> ServerRegistry<Store> {
        ServerRegistry::new(Arc::new(InMemoryStore::new(Database::default())))
    }

    fn backdate(registry: &ServerRegistry<Store>, server_id: &str, hours: i64) {
        registry
            .store
            .write(|db| {
                if let Some(server) = db.servers.find_mut(&server_id.to_string()) {
                    server.last_heartbeat = Utc::now() - chrono::Duration::hours(hours);
                }
                Ok::<_, StorageError>(())
            })
            .unwrap();
    }

    #[test]
    fn announce_then_reannounce_keeps_start_time() {
        let registry = registry();
        registry
            .announce("server-1", ServerContext::new(["default"], 4))
            .unwrap();
        let first = registry.servers().unwrap().remove(0);

        thread::sleep(Duration::from_millis(5));
        registry
            .announce("server-1", ServerContext::new(["default", "critical"], 8))
            .unwrap();
        let servers = registry.servers().unwrap();

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].started_at, first.started_at);
        assert_eq!(servers[0].worker_count, 8);
        assert_eq!(servers[0].queues, vec!["default", "critical"]);
        assert!(servers[0].last_heartbeat > first.last_heartbeat);
    }

    #[test]
    fn heartbeat_refreshes_last_heartbeat() {
        let registry = registry();
        registry.announce("server-1", ServerContext::default()).unwrap();
        backdate(&registry, "server-1", 1);

        registry.heartbeat("server-1").unwrap();
        let server = registry.servers().unwrap().remove(0);
        assert!(Utc::now() - server.last_heartbeat < chrono::Duration::minutes(1));
    }

    #[test]
    fn unknown_server_heartbeat_and_remove_are_noops() {
        let registry = registry();
        registry.heartbeat("ghost").unwrap();
        registry.remove("ghost").unwrap();
        assert!(registry.servers().unwrap().is_empty());
    }

    #[test]
    fn empty_server_id_is_rejected() {
        let registry = registry();
        assert!(registry.announce("", ServerContext::default()).unwrap_err().is_validation());
        assert!(registry.heartbeat("").unwrap_err().is_validation());
        assert!(registry.remove("").unwrap_err().is_validation());
    }

    #[test]
    fn remove_timed_out_evicts_only_silent_servers() {
        let registry = registry();
        for (id, hours) in [("server-1", 24), ("server-2", 12), ("server-3", 17)] {
            registry.announce(id, ServerContext::default()).unwrap();
            backdate(&registry, id, hours);
        }

        let removed = registry
            .remove_timed_out(Duration::from_secs(15 * 3600))
            .unwrap();

        assert_eq!(removed, 2);
        let left: Vec<_> = registry.servers().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(left, vec!["server-2"]);
    }

    #[test]
    fn watchdog_evicts_in_background() {
        let registry = registry();
        registry.announce("stale", ServerContext::default()).unwrap();
        backdate(&registry, "stale", 2);
        registry.announce("fresh", ServerContext::default()).unwrap();

        let handle = ServerWatchdog::new(
            registry.clone(),
            Duration::from_millis(5),
            Duration::from_secs(3600),
        )
        .spawn()
        .unwrap();
        thread::sleep(Duration::from_millis(50));
        handle.shutdown();

        let left: Vec<_> = registry.servers().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(left, vec!["fresh"]);
    }
}
