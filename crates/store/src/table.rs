//! Typed tables with primary-key lookup and ordered scans.

use std::collections::BTreeMap;
use std::ops::RangeBounds;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A record stored in a [`Table`], identified by its primary key.
pub trait Record: Clone {
    /// Primary key. Ordering of keys is the scan order of the table.
    type Key: Ord + Clone + core::fmt::Debug;

    fn key(&self) -> Self::Key;
}

/// Primary-key indexed collection of records.
///
/// Keys are kept ordered, so compound keys such as `(owner, index)` give cheap
/// prefix scans through [`Table::range`].
///
/// Serialized as a plain sequence of records; the key index is rebuilt on
/// load.
#[derive(Debug, Clone)]
pub struct Table<R: Record> {
    rows: BTreeMap<R::Key, R>,
}

impl<R: Record> Default for Table<R> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<R: Record> Table<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, key: &R::Key) -> Option<&R> {
        self.rows.get(key)
    }

    pub fn find_mut(&mut self, key: &R::Key) -> Option<&mut R> {
        self.rows.get_mut(key)
    }

    pub fn contains(&self, key: &R::Key) -> bool {
        self.rows.contains_key(key)
    }

    /// Insert or replace by primary key. Returns the replaced record, if any.
    pub fn insert(&mut self, record: R) -> Option<R> {
        self.rows.insert(record.key(), record)
    }

    pub fn remove(&mut self, key: &R::Key) -> Option<R> {
        self.rows.remove(key)
    }

    /// All records in key order.
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    /// Records matching `predicate`, in key order.
    pub fn query<P>(&self, mut predicate: P) -> impl Iterator<Item = &R>
    where
        P: FnMut(&R) -> bool,
    {
        self.rows.values().filter(move |r| predicate(r))
    }

    /// Records whose key falls in `range`, in key order.
    pub fn range(&self, range: impl RangeBounds<R::Key>) -> impl Iterator<Item = &R> {
        self.rows.range(range).map(|(_, r)| r)
    }

    /// Remove every record matching `predicate`; returns how many were removed.
    pub fn remove_where<P>(&mut self, mut predicate: P) -> usize
    where
        P: FnMut(&R) -> bool,
    {
        let before = self.rows.len();
        self.rows.retain(|_, r| !predicate(r));
        before - self.rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<R: Record> FromIterator<R> for Table<R> {
    fn from_iter<I: IntoIterator<Item = R>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().map(|r| (r.key(), r)).collect(),
        }
    }
}

impl<R> Serialize for Table<R>
where
    R: Record + Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.rows.values())
    }
}

impl<'de, R> Deserialize<'de> for Table<R>
where
    R: Record + Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rows = Vec::<R>::deserialize(deserializer)?;
        Ok(rows.into_iter().collect())
    }
}
