//! Several mutations committed as one transaction.
//!
//! A state transition in the job framework touches the job, its history, a
//! queue and some indexes at once. `WriteBatch` records those commands and
//! applies them together on `commit`: either every command takes effect or
//! none does.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use jobvault_core::{JobId, ValidationResult, require_finite, require_non_empty};
use jobvault_store::RecordStore;

use crate::error::{StorageError, StorageResult};
use crate::hashes;
use crate::jobs::NewState;
use crate::jobs::repository::{append_state, set_job_expiry};
use crate::schema::Database;
use crate::sets;
use crate::time;

#[derive(Debug, Clone, PartialEq)]
enum Command {
    ExpireJob { job_id: JobId, expire_in: Duration },
    PersistJob { job_id: JobId },
    AddState { job_id: JobId, state: NewState },
    AddToQueue { queue: String, job_id: JobId },
    AddToSet { set: String, member: String, score: f64 },
    RemoveFromSet { set: String, member: String },
    ExpireSet { set: String, expire_in: Duration },
    PersistSet { set: String },
    SetRangeInHash { key: String, fields: Vec<(String, String)> },
    RemoveHash { key: String },
    ExpireHash { key: String, expire_in: Duration },
    PersistHash { key: String },
}

impl Command {
    fn validate(&self) -> ValidationResult<()> {
        match self {
            Command::ExpireJob { .. } | Command::PersistJob { .. } => {}
            Command::AddState { state, .. } => {
                require_non_empty("state name", &state.name)?;
            }
            Command::AddToQueue { queue, .. } => {
                require_non_empty("queue", queue)?;
            }
            Command::AddToSet { set, member, score } => {
                require_non_empty("set", set)?;
                require_non_empty("member", member)?;
                require_finite("score", *score)?;
            }
            Command::RemoveFromSet { set, member } => {
                require_non_empty("set", set)?;
                require_non_empty("member", member)?;
            }
            Command::ExpireSet { set, .. } | Command::PersistSet { set } => {
                require_non_empty("set", set)?;
            }
            Command::SetRangeInHash { key, fields } => {
                require_non_empty("key", key)?;
                for (field, _) in fields {
                    require_non_empty("field", field)?;
                }
            }
            Command::RemoveHash { key } | Command::ExpireHash { key, .. } | Command::PersistHash { key } => {
                require_non_empty("key", key)?;
            }
        }
        Ok(())
    }

    /// Missing jobs are skipped by expire/persist but fail `AddState`, which
    /// aborts the whole batch.
    fn apply(self, db: &mut Database, now: DateTime<Utc>) -> StorageResult<()> {
        match self {
            Command::ExpireJob { job_id, expire_in } => {
                set_job_expiry(db, &job_id, Some(time::add(now, expire_in)));
            }
            Command::PersistJob { job_id } => set_job_expiry(db, &job_id, None),
            Command::AddState { job_id, state } => append_state(db, &job_id, state, now)?,
            Command::AddToQueue { queue, job_id } => {
                db.push_queue_entry(&queue, &job_id, now);
            }
            Command::AddToSet { set, member, score } => sets::upsert(db, &set, &member, score),
            Command::RemoveFromSet { set, member } => {
                db.sets.remove(&(set, member));
            }
            Command::ExpireSet { set, expire_in } => {
                sets::set_expiry(db, &set, Some(time::add(now, expire_in)));
            }
            Command::PersistSet { set } => sets::set_expiry(db, &set, None),
            Command::SetRangeInHash { key, fields } => hashes::merge_fields(db, &key, fields, now),
            Command::RemoveHash { key } => {
                db.hashes.remove(&key);
            }
            Command::ExpireHash { key, expire_in } => {
                hashes::set_expiry(db, &key, Some(time::add(now, expire_in)));
            }
            Command::PersistHash { key } => hashes::set_expiry(db, &key, None),
        }
        Ok(())
    }
}

/// Pending mutations, applied atomically by [`WriteBatch::commit`].
#[derive(Debug)]
pub struct WriteBatch<S> {
    store: S,
    commands: Vec<Command>,
}

impl<S> WriteBatch<S>
where
    S: RecordStore<State = Database>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            commands: Vec::new(),
        }
    }

    pub fn expire_job(&mut self, job_id: &JobId, expire_in: Duration) -> &mut Self {
        self.push(Command::ExpireJob {
            job_id: job_id.clone(),
            expire_in,
        })
    }

    pub fn persist_job(&mut self, job_id: &JobId) -> &mut Self {
        self.push(Command::PersistJob { job_id: job_id.clone() })
    }

    pub fn add_state(&mut self, job_id: &JobId, state: NewState) -> &mut Self {
        self.push(Command::AddState {
            job_id: job_id.clone(),
            state,
        })
    }

    pub fn add_to_queue(&mut self, queue: &str, job_id: &JobId) -> &mut Self {
        self.push(Command::AddToQueue {
            queue: queue.to_string(),
            job_id: job_id.clone(),
        })
    }

    pub fn add_to_set(&mut self, set: &str, member: &str, score: f64) -> &mut Self {
        self.push(Command::AddToSet {
            set: set.to_string(),
            member: member.to_string(),
            score,
        })
    }

    pub fn remove_from_set(&mut self, set: &str, member: &str) -> &mut Self {
        self.push(Command::RemoveFromSet {
            set: set.to_string(),
            member: member.to_string(),
        })
    }

    pub fn expire_set(&mut self, set: &str, expire_in: Duration) -> &mut Self {
        self.push(Command::ExpireSet {
            set: set.to_string(),
            expire_in,
        })
    }

    pub fn persist_set(&mut self, set: &str) -> &mut Self {
        self.push(Command::PersistSet { set: set.to_string() })
    }

    pub fn set_range_in_hash<K, V>(&mut self, key: &str, fields: impl IntoIterator<Item = (K, V)>) -> &mut Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.push(Command::SetRangeInHash {
            key: key.to_string(),
            fields: fields.into_iter().map(|(f, v)| (f.into(), v.into())).collect(),
        })
    }

    pub fn remove_hash(&mut self, key: &str) -> &mut Self {
        self.push(Command::RemoveHash { key: key.to_string() })
    }

    pub fn expire_hash(&mut self, key: &str, expire_in: Duration) -> &mut Self {
        self.push(Command::ExpireHash {
            key: key.to_string(),
            expire_in,
        })
    }

    pub fn persist_hash(&mut self, key: &str) -> &mut Self {
        self.push(Command::PersistHash { key: key.to_string() })
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Validate every command, then apply them in order inside one
    /// transaction.
    #[instrument(skip(self), fields(commands = self.commands.len()), err)]
    pub fn commit(self) -> StorageResult<()> {
        if self.commands.is_empty() {
            return Ok(());
        }
        for command in &self.commands {
            command.validate()?;
        }

        let count = self.commands.len();
        let commands = self.commands;
        let now = Utc::now();

        self.store
            .write(|db| {
                for command in commands {
                    command.apply(db, now)?;
                }
                Ok::<_, StorageError>(())
            })
            .map_err(|e| e.context("commit_batch", ""))?;

        debug!(commands = count, "batch committed");
        Ok(())
    }

    fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }
}
