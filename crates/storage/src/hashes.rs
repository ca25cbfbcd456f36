//! Hashes: a field map stored under one key.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;

use jobvault_core::require_non_empty;
use jobvault_store::RecordStore;

use crate::error::{StorageError, StorageResult};
use crate::schema::{Database, HashRecord};
use crate::time;

#[derive(Debug, Clone)]
pub struct HashStore<S> {
    store: S,
}

impl<S> HashStore<S>
where
    S: RecordStore<State = Database>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Upsert one field, creating the hash if needed.
    pub fn set_field(&self, key: &str, field: &str, value: impl Into<String>) -> StorageResult<()> {
        self.set_range(key, [(field.to_string(), value.into())])
    }

    /// Upsert many fields in one transaction.
    #[instrument(skip(self, fields), err)]
    pub fn set_range<K, V>(&self, key: &str, fields: impl IntoIterator<Item = (K, V)>) -> StorageResult<()>
    where
        K: Into<String>,
        V: Into<String>,
    {
        require_non_empty("key", key)?;
        let fields: Vec<(String, String)> = fields
            .into_iter()
            .map(|(f, v)| (f.into(), v.into()))
            .collect();
        for (field, _) in &fields {
            require_non_empty("field", field)?;
        }

        let now = Utc::now();
        self.store
            .write(|db| {
                merge_fields(db, key, fields, now);
                Ok::<_, StorageError>(())
            })
            .map_err(|e| e.context("set_range_in_hash", key))
    }

    pub fn field(&self, key: &str, field: &str) -> StorageResult<Option<String>> {
        require_non_empty("key", key)?;

        self.store
            .read(|db| {
                db.hashes
                    .find(&key.to_string())
                    .and_then(|h| h.fields.get(field).cloned())
            })
            .map_err(|e| StorageError::from(e).context("hash_field", key))
    }

    /// Every field of the hash, or `None` if it does not exist.
    pub fn all(&self, key: &str) -> StorageResult<Option<BTreeMap<String, String>>> {
        require_non_empty("key", key)?;
        self.store
            .read(|db| db.hashes.find(&key.to_string()).map(|h| h.fields.clone()))
            .map_err(|e| StorageError::from(e).context("hash_all", key))
    }

    /// Delete the hash. Returns whether it existed.
    pub fn remove(&self, key: &str) -> StorageResult<bool> {
        require_non_empty("key", key)?;

        self.store
            .write(|db| Ok::<_, StorageError>(db.hashes.remove(&key.to_string()).is_some()))
            .map_err(|e| e.context("remove_hash", key))
    }

    pub fn expire(&self, key: &str, expire_in: Duration) -> StorageResult<()> {
        require_non_empty("key", key)?;
        let expire_at = time::add(Utc::now(), expire_in);

        self.store
            .write(|db| {
                set_expiry(db, key, Some(expire_at));
                Ok::<_, StorageError>(())
            })
            .map_err(|e| e.context("expire_hash", key))
    }

    pub fn persist(&self, key: &str) -> StorageResult<()> {
        require_non_empty("key", key)?;

        self.store
            .write(|db| {
                set_expiry(db, key, None);
                Ok::<_, StorageError>(())
            })
            .map_err(|e| e.context("persist_hash", key))
    }

    pub fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        require_non_empty("key", key)?;
        let now = Utc::now();

        self.store
            .read(|db| {
                db.hashes
                    .find(&key.to_string())
                    .and_then(|h| h.expire_at)
                    .map(|at| time::until(at, now))
            })
            .map_err(|e| StorageError::from(e).context("hash_ttl", key))
    }
}

pub(crate) fn merge_fields(db: &mut Database, key: &str, fields: Vec<(String, String)>, now: DateTime<Utc>) {
    let key = key.to_string();
    if !db.hashes.contains(&key) {
        db.hashes.insert(HashRecord {
            key: key.clone(),
            fields: BTreeMap::new(),
            created_at: now,
            expire_at: None,
        });
    }
    if let Some(hash) = db.hashes.find_mut(&key) {
        hash.fields.extend(fields);
    }
}

/// No-op for a missing hash.
pub(crate) fn set_expiry(db: &mut Database, key: &str, expire_at: Option<DateTime<Utc>>) {
    if let Some(hash) = db.hashes.find_mut(&key.to_string()) {
        hash.expire_at = expire_at;
    }
}
