//! Sorted sets: `(set, member) -> score`.
//!
//! Used by the job framework for scheduling (score = due time) and as a
//! general index. Members of one set are stored contiguously in member order,
//! so score queries scan a single set and pick by score.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;

use jobvault_core::{require_finite, require_non_empty};
use jobvault_store::RecordStore;

use crate::error::{StorageError, StorageResult};
use crate::schema::{Database, SetEntry};
use crate::time;

#[derive(Debug, Clone)]
pub struct SortedSetStore<S> {
    store: S,
}

impl<S> SortedSetStore<S>
where
    S: RecordStore<State = Database>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Insert `member` or update its score. An existing entry keeps its
    /// expiration.
    #[instrument(skip(self), err)]
    pub fn add(&self, set: &str, member: &str, score: f64) -> StorageResult<()> {
        require_non_empty("set", set)?;
        require_non_empty("member", member)?;
        require_finite("score", score)?;

        self.store
            .write(|db| {
                upsert(db, set, member, score);
                Ok::<_, StorageError>(())
            })
            .map_err(|e| e.context("add_to_set", set))
    }

    /// Returns whether the member was present.
    pub fn remove(&self, set: &str, member: &str) -> StorageResult<bool> {
        require_non_empty("set", set)?;
        require_non_empty("member", member)?;

        self.store
            .write(|db| Ok::<_, StorageError>(db.sets.remove(&(set.to_string(), member.to_string())).is_some()))
            .map_err(|e| e.context("remove_from_set", set))
    }

    /// The member with the lowest score in `[from, to]`. Equal scores resolve
    /// to the smallest member. An inverted range matches nothing.
    pub fn first_by_score(&self, set: &str, from: f64, to: f64) -> StorageResult<Option<String>> {
        require_non_empty("set", set)?;

        self.store
            .read(|db| {
                db.set_entries(set)
                    .filter(|e| in_range(e.score, from, to))
                    .min_by(|a, b| by_score(a, b))
                    .map(|e| e.member.clone())
            })
            .map_err(|e| StorageError::from(e).context("first_by_score", set))
    }

    /// Up to `limit` members with scores in `[from, to]`, lowest score first.
    pub fn range_by_score(&self, set: &str, from: f64, to: f64, limit: usize) -> StorageResult<Vec<String>> {
        require_non_empty("set", set)?;

        self.store
            .read(|db| {
                let mut hits: Vec<&SetEntry> = db
                    .set_entries(set)
                    .filter(|e| in_range(e.score, from, to))
                    .collect();
                hits.sort_by(|a, b| by_score(a, b));
                hits.into_iter().take(limit).map(|e| e.member.clone()).collect()
            })
            .map_err(|e| StorageError::from(e).context("range_by_score", set))
    }

    pub fn score(&self, set: &str, member: &str) -> StorageResult<Option<f64>> {
        require_non_empty("set", set)?;

        self.store
            .read(|db| {
                db.sets
                    .find(&(set.to_string(), member.to_string()))
                    .map(|e| e.score)
            })
            .map_err(|e| StorageError::from(e).context("set_score", set))
    }

    pub fn count(&self, set: &str) -> StorageResult<usize> {
        require_non_empty("set", set)?;
        self.store
            .read(|db| db.set_entries(set).count())
            .map_err(|e| StorageError::from(e).context("set_count", set))
    }

    /// All members in member order.
    pub fn members(&self, set: &str) -> StorageResult<Vec<String>> {
        require_non_empty("set", set)?;
        self.store
            .read(|db| db.set_entries(set).map(|e| e.member.clone()).collect())
            .map_err(|e| StorageError::from(e).context("set_members", set))
    }

    /// Expire every entry of `set` after `expire_in`.
    pub fn expire(&self, set: &str, expire_in: Duration) -> StorageResult<()> {
        require_non_empty("set", set)?;
        let expire_at = time::add(Utc::now(), expire_in);

        self.store
            .write(|db| {
                set_expiry(db, set, Some(expire_at));
                Ok::<_, StorageError>(())
            })
            .map_err(|e| e.context("expire_set", set))
    }

    pub fn persist(&self, set: &str) -> StorageResult<()> {
        require_non_empty("set", set)?;

        self.store
            .write(|db| {
                set_expiry(db, set, None);
                Ok::<_, StorageError>(())
            })
            .map_err(|e| e.context("persist_set", set))
    }

    /// Time left before the earliest-expiring entry goes, or `None` when the
    /// set is empty or never expires.
    pub fn ttl(&self, set: &str) -> StorageResult<Option<Duration>> {
        require_non_empty("set", set)?;
        let now = Utc::now();

        self.store
            .read(|db| {
                db.set_entries(set)
                    .filter_map(|e| e.expire_at)
                    .min()
                    .map(|at| time::until(at, now))
            })
            .map_err(|e| StorageError::from(e).context("set_ttl", set))
    }
}

pub(crate) fn upsert(db: &mut Database, set: &str, member: &str, score: f64) {
    let key = (set.to_string(), member.to_string());
    match db.sets.find_mut(&key) {
        Some(entry) => entry.score = score,
        None => {
            db.sets.insert(SetEntry {
                set: key.0,
                member: key.1,
                score,
                expire_at: None,
            });
        }
    }
}

pub(crate) fn set_expiry(db: &mut Database, set: &str, expire_at: Option<DateTime<Utc>>) {
    let keys: Vec<_> = db
        .set_entries(set)
        .map(|e| (e.set.clone(), e.member.clone()))
        .collect();
    for key in keys {
        if let Some(entry) = db.sets.find_mut(&key) {
            entry.expire_at = expire_at;
        }
    }
}

fn in_range(score: f64, from: f64, to: f64) -> bool {
    from <= score && score <= to
}

fn by_score(a: &SetEntry, b: &SetEntry) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| a.member.cmp(&b.member))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jobvault_store::{InMemoryStore, StoreError};
    use proptest::prelude::*;

    fn sets() -> SortedSetStore<Arc<InMemoryStore<Database>>> {
        SortedSetStore::new(Arc::new(InMemoryStore::new(Database::default())))
    }

    /// A store whose every access fails with an i/o error.
    struct BrokenStore;

    impl RecordStore for BrokenStore {
        type State = Database;

        fn read<R>(&self, _: impl FnOnce(&Database) -> R) -> Result<R, StoreError> {
            Err(StoreError::Io("disk gone".into()))
        }

        fn write<R, E>(&self, _: impl FnOnce(&mut Database) -> Result<R, E>) -> Result<R, E>
        where
            E: From<StoreError>,
        {
            Err(StoreError::Io("disk gone".into()).into())
        }
    }

    #[test]
    fn read_failures_name_operation_and_set() {
        let sets = SortedSetStore::new(BrokenStore);

        let err = sets.first_by_score("schedule", 0.0, 1.0).unwrap_err();
        assert_eq!(err.to_string(), "first_by_score failed for 'schedule': store i/o failed: disk gone");

        let err = sets.count("retries").unwrap_err();
        assert!(matches!(
            err,
            StorageError::Store { operation: "set_count", ref key, source: StoreError::Io(_) } if key == "retries"
        ));
    }

    #[test]
    fn first_by_score_picks_lowest_in_range() {
        let sets = sets();
        sets.add("key", "1.0", 1.0).unwrap();
        sets.add("key", "-5.0", -5.0).unwrap();
        sets.add("key", "-1.0", -1.0).unwrap();
        sets.add("key", "-2.0", -2.0).unwrap();

        assert_eq!(sets.first_by_score("key", -1.0, 3.0).unwrap().as_deref(), Some("-1.0"));
        assert_eq!(sets.first_by_score("key", -10.0, 10.0).unwrap().as_deref(), Some("-5.0"));
        assert_eq!(sets.first_by_score("key", 2.0, 3.0).unwrap(), None);
        assert_eq!(sets.first_by_score("missing", -10.0, 10.0).unwrap(), None);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let sets = sets();
        sets.add("key", "a", 1.0).unwrap();
        sets.add("key", "b", 2.0).unwrap();

        assert_eq!(sets.first_by_score("key", 2.0, 2.0).unwrap().as_deref(), Some("b"));
        assert_eq!(sets.range_by_score("key", 1.0, 2.0, 10).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn equal_scores_resolve_by_member() {
        let sets = sets();
        sets.add("key", "zeta", 0.0).unwrap();
        sets.add("key", "alpha", 0.0).unwrap();

        assert_eq!(sets.first_by_score("key", 0.0, 0.0).unwrap().as_deref(), Some("alpha"));
    }

    #[test]
    fn add_updates_score_of_existing_member() {
        let sets = sets();
        sets.add("schedule", "job-1", 10.0).unwrap();
        sets.add("schedule", "job-1", 3.0).unwrap();

        assert_eq!(sets.count("schedule").unwrap(), 1);
        assert_eq!(sets.score("schedule", "job-1").unwrap(), Some(3.0));
    }

    #[test]
    fn sets_are_isolated() {
        let sets = sets();
        sets.add("a", "x", 1.0).unwrap();
        sets.add("ab", "y", 0.0).unwrap();

        assert_eq!(sets.members("a").unwrap(), vec!["x"]);
        assert_eq!(sets.first_by_score("a", -1.0, 1.0).unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn range_by_score_orders_and_limits() {
        let sets = sets();
        for (member, score) in [("c", 3.0), ("a", 1.0), ("d", 4.0), ("b", 2.0)] {
            sets.add("key", member, score).unwrap();
        }

        assert_eq!(sets.range_by_score("key", 2.0, 10.0, 2).unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn remove_member() {
        let sets = sets();
        sets.add("key", "a", 1.0).unwrap();

        assert!(sets.remove("key", "a").unwrap());
        assert!(!sets.remove("key", "a").unwrap());
        assert_eq!(sets.count("key").unwrap(), 0);
    }

    #[test]
    fn expire_and_persist_cover_the_whole_set() {
        let sets = sets();
        sets.add("key", "a", 1.0).unwrap();
        sets.add("key", "b", 2.0).unwrap();
        assert_eq!(sets.ttl("key").unwrap(), None);

        sets.expire("key", Duration::from_secs(3600)).unwrap();
        let ttl = sets.ttl("key").unwrap().unwrap();
        assert!(ttl > Duration::from_secs(3500) && ttl <= Duration::from_secs(3600));

        sets.persist("key").unwrap();
        assert_eq!(sets.ttl("key").unwrap(), None);
    }

    #[test]
    fn blank_set_name_is_rejected() {
        let sets = sets();
        assert!(sets.add("", "a", 1.0).unwrap_err().is_validation());
        assert!(sets.first_by_score("", 0.0, 1.0).unwrap_err().is_validation());
        assert!(sets.add("key", "a", f64::NAN).unwrap_err().is_validation());
    }

    proptest! {
        #[test]
        fn first_by_score_matches_brute_force(
            entries in prop::collection::btree_map("[a-f]{1,3}", -100i32..100, 0..20),
            from in -120i32..120,
            span in 0i32..120,
        ) {
            let sets = sets();
            for (member, score) in &entries {
                sets.add("key", member, f64::from(*score)).unwrap();
            }
            let (from, to) = (f64::from(from), f64::from(from + span));

            let expected = entries
                .iter()
                .filter(|(_, s)| from <= f64::from(**s) && f64::from(**s) <= to)
                .min_by_key(|(m, s)| (**s, (*m).clone()))
                .map(|(m, _)| m.clone());

            prop_assert_eq!(sets.first_by_score("key", from, to).unwrap(), expected);
        }
    }
}
