//! Persisted record layout.
//!
//! Every record is a plain struct in a [`Table`] of [`Database`]. Job-owned
//! records (state history, parameters) live in their own tables keyed by
//! `(job id, ..)` so they can be range-scanned and deleted together with the
//! job inside one transaction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobvault_core::{JobId, LockToken, QueueEntryId};
use jobvault_store::{Record, Table};

/// The complete typed state held by the record store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub jobs: Table<JobRecord>,
    pub job_states: Table<StateRecord>,
    pub job_parameters: Table<ParameterRecord>,
    pub queue: Table<QueueEntry>,
    pub sets: Table<SetEntry>,
    pub hashes: Table<HashRecord>,
    pub servers: Table<ServerRecord>,
    pub locks: Table<LockRecord>,
    /// Next queue sequence number; gives FIFO order within a queue without
    /// relying on identifier values.
    pub next_queue_seq: u64,
}

/// A job: invocation payload plus the name of its current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// JSON-encoded `Invocation`.
    pub invocation: String,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    /// Mirrors the name of the last entry in the state history.
    pub state_name: Option<String>,
    /// Number of state entries appended so far (next sequence index).
    pub state_count: u64,
}

impl Record for JobRecord {
    type Key = JobId;

    fn key(&self) -> JobId {
        self.id.clone()
    }
}

/// One immutable entry of a job's state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub job_id: JobId,
    pub seq: u64,
    pub name: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub data: BTreeMap<String, String>,
}

impl Record for StateRecord {
    type Key = (JobId, u64);

    fn key(&self) -> Self::Key {
        (self.job_id.clone(), self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub job_id: JobId,
    pub key: String,
    pub value: String,
}

impl Record for ParameterRecord {
    type Key = (JobId, String);

    fn key(&self) -> Self::Key {
        (self.job_id.clone(), self.key.clone())
    }
}

/// A job waiting in (or claimed from) a named queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub queue: String,
    pub seq: u64,
    pub job_id: JobId,
    pub enqueued_at: DateTime<Utc>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// Claimable iff never fetched, or fetched before `stale_before`.
    pub fn is_visible(&self, stale_before: DateTime<Utc>) -> bool {
        self.fetched_at.is_none_or(|fetched| fetched < stale_before)
    }
}

impl Record for QueueEntry {
    type Key = (String, u64);

    fn key(&self) -> Self::Key {
        (self.queue.clone(), self.seq)
    }
}

/// Member of a sorted set; `(set, member)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetEntry {
    pub set: String,
    pub member: String,
    pub score: f64,
    pub expire_at: Option<DateTime<Utc>>,
}

impl Record for SetEntry {
    type Key = (String, String);

    fn key(&self) -> Self::Key {
        (self.set.clone(), self.member.clone())
    }
}

/// Field map stored under one key; expiration applies to the whole map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashRecord {
    pub key: String,
    pub fields: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
}

impl Record for HashRecord {
    type Key = String;

    fn key(&self) -> String {
        self.key.clone()
    }
}

/// A worker process announced to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub queues: Vec<String>,
    pub worker_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Record for ServerRecord {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// A held distributed lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource: String,
    pub token: LockToken,
    pub acquired_at: DateTime<Utc>,
    /// Past this instant the lock is considered abandoned.
    pub expires_at: DateTime<Utc>,
}

impl Record for LockRecord {
    type Key = String;

    fn key(&self) -> String {
        self.resource.clone()
    }
}

impl Database {
    /// State history of a job, oldest first.
    pub fn states_of<'a>(&'a self, job_id: &'a JobId) -> impl Iterator<Item = &'a StateRecord> + 'a {
        self.job_states
            .range((job_id.clone(), 0)..=(job_id.clone(), u64::MAX))
    }

    pub fn parameters_of<'a>(&'a self, job_id: &'a JobId) -> impl Iterator<Item = &'a ParameterRecord> + 'a {
        self.job_parameters
            .range((job_id.clone(), String::new())..)
            .take_while(move |p| &p.job_id == job_id)
    }

    /// Entries of one queue in FIFO order.
    pub fn queue_entries<'a>(&'a self, queue: &str) -> impl Iterator<Item = &'a QueueEntry> + 'a {
        self.queue
            .range((queue.to_string(), 0)..=(queue.to_string(), u64::MAX))
    }

    /// Members of one sorted set in member order.
    pub fn set_entries<'a>(&'a self, set: &'a str) -> impl Iterator<Item = &'a SetEntry> + 'a {
        self.sets
            .range((set.to_string(), String::new())..)
            .take_while(move |e| e.set == set)
    }

    /// Delete a job together with everything it owns. Returns `false` if the
    /// job did not exist.
    pub fn delete_job(&mut self, job_id: &JobId) -> bool {
        if self.jobs.remove(job_id).is_none() {
            return false;
        }

        let state_keys: Vec<_> = self.states_of(job_id).map(Record::key).collect();
        for key in &state_keys {
            self.job_states.remove(key);
        }

        let parameter_keys: Vec<_> = self.parameters_of(job_id).map(Record::key).collect();
        for key in &parameter_keys {
            self.job_parameters.remove(key);
        }

        true
    }

    /// Append a queue entry for `job_id` to `queue`.
    pub fn push_queue_entry(&mut self, queue: &str, job_id: &JobId, now: DateTime<Utc>) -> QueueEntryId {
        let seq = self.next_queue_seq;
        self.next_queue_seq += 1;

        let id = QueueEntryId::new();
        self.queue.insert(QueueEntry {
            id: id.clone(),
            queue: queue.to_string(),
            seq,
            job_id: job_id.clone(),
            enqueued_at: now,
            fetched_at: None,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &JobId) -> JobRecord {
        JobRecord {
            id: id.clone(),
            invocation: "{}".into(),
            created_at: Utc::now(),
            expire_at: None,
            state_name: None,
            state_count: 0,
        }
    }

    fn state(job_id: &JobId, seq: u64) -> StateRecord {
        StateRecord {
            job_id: job_id.clone(),
            seq,
            name: format!("s{seq}"),
            reason: None,
            created_at: Utc::now(),
            data: BTreeMap::new(),
        }
    }

    #[test]
    fn delete_job_cascades_only_to_owned_records() {
        let mut db = Database::default();
        let a = JobId::new();
        let b = JobId::new();

        for id in [&a, &b] {
            db.jobs.insert(job(id));
            db.job_states.insert(state(id, 0));
            db.job_states.insert(state(id, 1));
            db.job_parameters.insert(ParameterRecord {
                job_id: id.clone(),
                key: "k".into(),
                value: "v".into(),
            });
        }

        assert!(db.delete_job(&a));
        assert!(!db.delete_job(&a));

        assert_eq!(db.states_of(&a).count(), 0);
        assert_eq!(db.parameters_of(&a).count(), 0);
        assert_eq!(db.states_of(&b).count(), 2);
        assert_eq!(db.parameters_of(&b).count(), 1);
    }

    #[test]
    fn queue_entries_keep_enqueue_order() {
        let mut db = Database::default();
        let first = JobId::new();
        let second = JobId::new();
        let now = Utc::now();

        db.push_queue_entry("default", &first, now);
        db.push_queue_entry("critical", &second, now);
        db.push_queue_entry("default", &second, now);

        let order: Vec<_> = db.queue_entries("default").map(|e| e.job_id.clone()).collect();
        assert_eq!(order, vec![first, second]);
    }
}
