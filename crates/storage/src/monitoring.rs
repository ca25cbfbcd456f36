//! Read-only views for dashboards.
//!
//! Every call is a single read, so the numbers in one result are mutually
//! consistent.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use jobvault_core::{JobId, require_non_empty};
use jobvault_store::RecordStore;

use crate::error::{StorageError, StorageResult};
use crate::jobs::repository::to_job_data;
use crate::jobs::{JobData, StateData};
use crate::schema::{Database, ServerRecord};

/// Aggregate counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub jobs: usize,
    /// Job count per current state name. Jobs without a state are not
    /// counted.
    pub states: BTreeMap<String, usize>,
    pub servers: usize,
    pub queues: usize,
    /// Sizes of the sorted sets asked for, keyed by set name.
    pub sets: BTreeMap<String, usize>,
}

impl Statistics {
    pub fn in_state(&self, state: &str) -> usize {
        self.states.get(state).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub name: String,
    pub enqueued: usize,
    pub fetched: usize,
    /// Oldest unfetched job ids, up to the requested peek size.
    pub first_jobs: Vec<JobId>,
}

/// Job with everything it owns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDetails {
    pub job: JobData,
    pub parameters: BTreeMap<String, String>,
    /// Oldest first.
    pub history: Vec<StateData>,
}

/// One row of a per-state job listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub state: Option<StateData>,
}

#[derive(Debug, Clone)]
pub struct MonitoringApi<S> {
    store: S,
}

impl<S> MonitoringApi<S>
where
    S: RecordStore<State = Database>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Counts across the whole store plus the size of each set in `sets`.
    pub fn statistics(&self, sets: &[&str]) -> StorageResult<Statistics> {
        self.store
            .read(|db| {
                let mut states = BTreeMap::new();
                for name in db.jobs.iter().filter_map(|j| j.state_name.as_deref()) {
                    *states.entry(name.to_string()).or_insert(0) += 1;
                }
    
                Statistics {
                    jobs: db.jobs.len(),
                    states,
                    servers: db.servers.len(),
                    queues: queue_names(db).len(),
                    sets: sets
                        .iter()
                        .map(|set| (set.to_string(), db.set_entries(set).count()))
                        .collect(),
                }
            })
            .map_err(|e| StorageError::from(e).context("statistics", ""))
    }

    /// Every non-empty queue with its lengths and the first `peek` waiting
    /// jobs.
    pub fn queues(&self, peek: usize) -> StorageResult<Vec<QueueSummary>> {
        self.store
            .read(|db| {
                queue_names(db)
                    .into_iter()
                    .map(|name| {
                        let (mut enqueued, mut fetched) = (0, 0);
                        let mut first_jobs = Vec::new();
                        for entry in db.queue_entries(&name) {
                            if entry.fetched_at.is_some() {
                                fetched += 1;
                                continue;
                            }
                            enqueued += 1;
                            if first_jobs.len() < peek {
                                first_jobs.push(entry.job_id.clone());
                            }
                        }
                        QueueSummary {
                            name,
                            enqueued,
                            fetched,
                            first_jobs,
                        }
                    })
                    .collect()
            })
            .map_err(|e| StorageError::from(e).context("queues", ""))
    }

    pub fn servers(&self) -> StorageResult<Vec<ServerRecord>> {
        self.store
            .read(|db| db.servers.iter().cloned().collect())
            .map_err(|e| StorageError::from(e).context("servers", ""))
    }

    pub fn job_details(&self, id: &JobId) -> StorageResult<Option<JobDetails>> {
        self.store
            .read(|db| {
                db.jobs.find(id).cloned().map(|job| JobDetails {
                    job: to_job_data(job),
                    parameters: db
                        .parameters_of(id)
                        .map(|p| (p.key.clone(), p.value.clone()))
                        .collect(),
                    history: db.states_of(id).map(StateData::from).collect(),
                })
            })
            .map_err(|e| StorageError::from(e).context("job_details", id.as_str()))
    }

    /// Jobs currently in `state`, newest first, paged by `offset`/`count`.
    pub fn jobs_in_state(&self, state: &str, offset: usize, count: usize) -> StorageResult<Vec<JobSummary>> {
        require_non_empty("state name", state)?;

        self.store
            .read(|db| {
                let mut jobs: Vec<_> = db
                    .jobs
                    .query(|j| j.state_name.as_deref() == Some(state))
                    .collect();
                jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    
                jobs.into_iter()
                    .skip(offset)
                    .take(count)
                    .map(|j| JobSummary {
                        id: j.id.clone(),
                        created_at: j.created_at,
                        state: db.states_of(&j.id).last().map(StateData::from),
                    })
                    .collect()
            })
            .map_err(|e| StorageError::from(e).context("jobs_in_state", state))
    }

    pub fn set_count(&self, set: &str) -> StorageResult<usize> {
        require_non_empty("set", set)?;
        self.store
            .read(|db| db.set_entries(set).count())
            .map_err(|e| StorageError::from(e).context("set_count", set))
    }
}

fn queue_names(db: &Database) -> BTreeSet<String> {
    db.queue.iter().map(|e| e.queue.clone()).collect()
}
