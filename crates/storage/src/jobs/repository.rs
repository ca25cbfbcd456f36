//! Job persistence.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use jobvault_core::{JobId, require_non_empty};
use jobvault_store::RecordStore;

use super::types::{Invocation, JobData, NewState, StateData};
use crate::error::{StorageError, StorageResult};
use crate::schema::{Database, JobRecord, ParameterRecord, StateRecord};
use crate::time;

/// Job repository over a record store.
///
/// Every mutation is a single transaction scoped to one job and the records
/// it owns, so readers never observe a job without its parameters or a state
/// name that disagrees with the history.
#[derive(Debug, Clone)]
pub struct JobRepository<S> {
    store: S,
}

impl<S> JobRepository<S>
where
    S: RecordStore<State = Database>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Store a new job with its initial parameters.
    ///
    /// The job starts without a state; `expire_in` (if any) is measured from
    /// `created_at`.
    #[instrument(skip(self, invocation, parameters), fields(job_type = %invocation.type_name), err)]
    pub fn create_job<K, V>(
        &self,
        invocation: &Invocation,
        parameters: impl IntoIterator<Item = (K, V)>,
        created_at: DateTime<Utc>,
        expire_in: Option<Duration>,
    ) -> StorageResult<JobId>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let payload = invocation.encode()?;
        let parameters: BTreeMap<String, String> = parameters
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        for key in parameters.keys() {
            require_non_empty("parameter name", key)?;
        }

        let id = JobId::new();
        let record = JobRecord {
            id: id.clone(),
            invocation: payload,
            created_at,
            expire_at: expire_in.map(|ttl| time::add(created_at, ttl)),
            state_name: None,
            state_count: 0,
        };

        self.store
            .write(|db| {
                db.jobs.insert(record);
                for (key, value) in parameters {
                    db.job_parameters.insert(ParameterRecord {
                        job_id: id.clone(),
                        key,
                        value,
                    });
                }
                Ok::<_, StorageError>(())
            })
            .map_err(|e| e.context("create_job", id.as_str()))?;

        debug!(job_id = %id, "job created");
        Ok(id)
    }

    /// Read a job. A payload that no longer decodes is reported through
    /// `JobData::load_error` rather than as an error.
    pub fn job_data(&self, id: &JobId) -> StorageResult<Option<JobData>> {
        let record = self
            .store
            .read(|db| db.jobs.find(id).cloned())
            .map_err(|e| StorageError::from(e).context("job_data", id.as_str()))?;

        Ok(record.map(to_job_data))
    }

    /// Most recent state of a job, or `None` if it has no history (or does not
    /// exist).
    pub fn state_data(&self, id: &JobId) -> StorageResult<Option<StateData>> {
        self.store
            .read(|db| db.states_of(id).last().map(StateData::from))
            .map_err(|e| StorageError::from(e).context("state_data", id.as_str()))
    }

    /// Full state history, oldest first.
    pub fn state_history(&self, id: &JobId) -> StorageResult<Vec<StateData>> {
        self.store
            .read(|db| db.states_of(id).map(StateData::from).collect())
            .map_err(|e| StorageError::from(e).context("state_history", id.as_str()))
    }

    /// Append a state and make it the job's current state.
    #[instrument(skip(self, state), fields(state = %state.name), err)]
    pub fn add_state(&self, id: &JobId, state: NewState) -> StorageResult<()> {
        require_non_empty("state name", &state.name)?;

        self.store
            .write(|db| append_state(db, id, state, Utc::now()))
            .map_err(|e| e.context("add_state", id.as_str()))
    }

    pub fn parameter(&self, id: &JobId, key: &str) -> StorageResult<Option<String>> {
        require_non_empty("parameter name", key)?;

        self.store
            .read(|db| {
                db.job_parameters
                    .find(&(id.clone(), key.to_string()))
                    .map(|p| p.value.clone())
            })
            .map_err(|e| StorageError::from(e).context("parameter", id.as_str()))
    }

    /// All parameters of a job.
    pub fn parameters(&self, id: &JobId) -> StorageResult<BTreeMap<String, String>> {
        self.store
            .read(|db| {
                db.parameters_of(id)
                    .map(|p| (p.key.clone(), p.value.clone()))
                    .collect()
            })
            .map_err(|e| StorageError::from(e).context("parameters", id.as_str()))
    }

    /// Insert or overwrite one parameter.
    pub fn set_parameter(&self, id: &JobId, key: &str, value: impl Into<String>) -> StorageResult<()> {
        require_non_empty("parameter name", key)?;
        let value = value.into();

        self.store
            .write(|db| {
                if !db.jobs.contains(id) {
                    return Err(StorageError::JobNotFound(id.clone()));
                }
                db.job_parameters.insert(ParameterRecord {
                    job_id: id.clone(),
                    key: key.to_string(),
                    value,
                });
                Ok(())
            })
            .map_err(|e| e.context("set_parameter", id.as_str()))
    }

    /// Expire the job `expire_in` from now. Missing jobs are ignored.
    pub fn expire_job(&self, id: &JobId, expire_in: Duration) -> StorageResult<()> {
        self.store
            .write(|db| {
                set_job_expiry(db, id, Some(time::add(Utc::now(), expire_in)));
                Ok::<_, StorageError>(())
            })
            .map_err(|e| e.context("expire_job", id.as_str()))
    }

    /// Clear the job's expiration. Missing jobs are ignored.
    pub fn persist_job(&self, id: &JobId) -> StorageResult<()> {
        self.store
            .write(|db| {
                set_job_expiry(db, id, None);
                Ok::<_, StorageError>(())
            })
            .map_err(|e| e.context("persist_job", id.as_str()))
    }

    /// Delete a job with its history and parameters. Returns whether it
    /// existed.
    pub fn delete_job(&self, id: &JobId) -> StorageResult<bool> {
        self.store
            .write(|db| Ok::<_, StorageError>(db.delete_job(id)))
            .map_err(|e| e.context("delete_job", id.as_str()))
    }
}

/// Decode a stored job. A payload that no longer decodes is captured in
/// `load_error`.
pub(crate) fn to_job_data(job: JobRecord) -> JobData {
    let (invocation, load_error) = match Invocation::decode(&job.invocation) {
        Ok(inv) => (Some(inv), None),
        Err(err) => {
            debug!(job_id = %job.id, error = %err, "job payload could not be loaded");
            (None, Some(err))
        }
    };

    JobData {
        id: job.id,
        invocation,
        load_error,
        state: job.state_name,
        created_at: job.created_at,
        expire_at: job.expire_at,
    }
}

/// Append `state` to the job's history and update its current state name.
pub(crate) fn append_state(
    db: &mut Database,
    id: &JobId,
    state: NewState,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    let job = db
        .jobs
        .find_mut(id)
        .ok_or_else(|| StorageError::JobNotFound(id.clone()))?;

    let seq = job.state_count;
    job.state_count += 1;
    job.state_name = Some(state.name.clone());

    db.job_states.insert(StateRecord {
        job_id: id.clone(),
        seq,
        name: state.name,
        reason: state.reason,
        created_at: now,
        data: state.data,
    });
    Ok(())
}

pub(crate) fn set_job_expiry(db: &mut Database, id: &JobId, expire_at: Option<DateTime<Utc>>) {
    if let Some(job) = db.jobs.find_mut(id) {
        job.expire_at = expire_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jobvault_store::InMemoryStore;
    use proptest::prelude::*;

    fn repo() -> JobRepository<Arc<InMemoryStore<Database>>> {
        JobRepository::new(Arc::new(InMemoryStore::new(Database::default())))
    }

    fn sample_invocation() -> Invocation {
        Invocation::new("SampleJobs", "sample_method").with_arg("string", "Hello")
    }

    #[test]
    fn create_job_stores_payload_parameters_and_expiry() {
        let repo = repo();
        let created_at = DateTime::parse_from_rfc3339("2012-12-12T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let id = repo
            .create_job(
                &sample_invocation(),
                [("Key1", "Value1"), ("Key2", "Value2")],
                created_at,
                Some(Duration::from_secs(24 * 3600)),
            )
            .unwrap();

        let data = repo.job_data(&id).unwrap().unwrap();
        assert_eq!(data.created_at, created_at);
        assert_eq!(data.state, None);
        assert!(data.load_error.is_none());

        let invocation = data.invocation.unwrap();
        assert_eq!(invocation.type_name, "SampleJobs");
        assert_eq!(invocation.method, "sample_method");
        assert_eq!(invocation.argument::<String>(0).unwrap(), "Hello");

        let expire_at = data.expire_at.unwrap();
        let expected = created_at + chrono::Duration::days(1);
        assert!(expected - chrono::Duration::minutes(1) < expire_at);
        assert!(expire_at < expected + chrono::Duration::minutes(1));

        assert_eq!(repo.parameter(&id, "Key1").unwrap().as_deref(), Some("Value1"));
        assert_eq!(repo.parameter(&id, "Key2").unwrap().as_deref(), Some("Value2"));
    }

    #[test]
    fn create_job_without_ttl_never_expires() {
        let repo = repo();
        let id = repo
            .create_job(&sample_invocation(), Vec::<(String, String)>::new(), Utc::now(), None)
            .unwrap();

        assert_eq!(repo.job_data(&id).unwrap().unwrap().expire_at, None);
    }

    #[test]
    fn job_data_is_none_for_unknown_job() {
        let repo = repo();
        assert!(repo.job_data(&JobId::new()).unwrap().is_none());
        assert!(repo.state_data(&JobId::new()).unwrap().is_none());
    }

    #[test]
    fn undecodable_payload_is_captured_not_raised() {
        let repo = repo();
        let id = JobId::new();
        repo.store
            .write(|db| {
                db.jobs.insert(JobRecord {
                    id: id.clone(),
                    invocation: "{\"type_name\":\"Gone\"".into(),
                    created_at: Utc::now(),
                    expire_at: None,
                    state_name: Some("Succeeded".into()),
                    state_count: 0,
                });
                Ok::<_, StorageError>(())
            })
            .unwrap();

        let data = repo.job_data(&id).unwrap().unwrap();
        assert!(data.invocation.is_none());
        assert!(data.load_error.is_some());
        assert_eq!(data.state.as_deref(), Some("Succeeded"));
    }

    #[test]
    fn latest_state_wins_and_history_keeps_order() {
        let repo = repo();
        let id = repo
            .create_job(&sample_invocation(), Vec::<(String, String)>::new(), Utc::now(), None)
            .unwrap();

        repo.add_state(&id, NewState::new("old-state")).unwrap();
        repo.add_state(
            &id,
            NewState::new("Name").with_reason("Reason").with_data("Key", "Value"),
        )
        .unwrap();

        let state = repo.state_data(&id).unwrap().unwrap();
        assert_eq!(state.name, "Name");
        assert_eq!(state.reason.as_deref(), Some("Reason"));
        assert_eq!(state.data["Key"], "Value");

        let history: Vec<_> = repo
            .state_history(&id)
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(history, vec!["old-state", "Name"]);
        assert_eq!(repo.job_data(&id).unwrap().unwrap().state.as_deref(), Some("Name"));
    }

    #[test]
    fn add_state_to_missing_job_fails() {
        let repo = repo();
        let err = repo.add_state(&JobId::new(), NewState::new("Enqueued")).unwrap_err();
        assert!(matches!(err, StorageError::JobNotFound(_)));
    }

    #[test]
    fn add_state_rejects_blank_name() {
        let repo = repo();
        let err = repo.add_state(&JobId::new(), NewState::new(" ")).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn set_parameter_upserts_by_key() {
        let repo = repo();
        let id = repo
            .create_job(&sample_invocation(), [("Retry", "0")], Utc::now(), None)
            .unwrap();

        repo.set_parameter(&id, "Retry", "1").unwrap();
        repo.set_parameter(&id, "Culture", "en-US").unwrap();

        let params = repo.parameters(&id).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params["Retry"], "1");
        assert_eq!(repo.parameter(&id, "Missing").unwrap(), None);
    }

    #[test]
    fn set_parameter_on_missing_job_fails() {
        let repo = repo();
        let err = repo.set_parameter(&JobId::new(), "k", "v").unwrap_err();
        assert!(matches!(err, StorageError::JobNotFound(_)));
    }

    #[test]
    fn expire_and_persist_toggle_expiration() {
        let repo = repo();
        let id = repo
            .create_job(&sample_invocation(), Vec::<(String, String)>::new(), Utc::now(), None)
            .unwrap();

        repo.expire_job(&id, Duration::from_secs(60)).unwrap();
        assert!(repo.job_data(&id).unwrap().unwrap().expire_at.is_some());

        repo.persist_job(&id).unwrap();
        assert!(repo.job_data(&id).unwrap().unwrap().expire_at.is_none());
    }

    #[test]
    fn delete_job_removes_history_and_parameters() {
        let repo = repo();
        let id = repo
            .create_job(&sample_invocation(), [("k", "v")], Utc::now(), None)
            .unwrap();
        repo.add_state(&id, NewState::new("Enqueued")).unwrap();

        assert!(repo.delete_job(&id).unwrap());
        assert!(repo.job_data(&id).unwrap().is_none());
        assert!(repo.state_history(&id).unwrap().is_empty());
        assert!(repo.parameters(&id).unwrap().is_empty());
        assert!(!repo.delete_job(&id).unwrap());
    }

    proptest! {
        #[test]
        fn history_preserves_append_order(names in prop::collection::vec("[A-Z][a-z]{0,8}", 1..12)) {
            let repo = repo();
            let id = repo
                .create_job(&sample_invocation(), Vec::<(String, String)>::new(), Utc::now(), None)
                .unwrap();

            for name in &names {
                repo.add_state(&id, NewState::new(name.clone())).unwrap();
            }

            let history: Vec<_> = repo.state_history(&id).unwrap().into_iter().map(|s| s.name).collect();
            prop_assert_eq!(&history, &names);
            prop_assert_eq!(repo.job_data(&id).unwrap().unwrap().state, names.last().cloned());
        }
    }
}
