use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::types_jobs::{JobKind, JobRecord, JobState};

/// Selects jobs of one kind. Results are always in creation order.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Empty means any state.
    pub states: Vec<JobState>,
    /// Every pair must be present on the job.
    pub labels: BTreeMap<String, String>,
    pub limit: Option<usize>,
}

impl ListFilter {
    pub fn in_states(states: &[JobState]) -> Self {
        Self {
            states: states.to_vec(),
            ..Self::default()
        }
    }

    pub fn matches(&self, rec: &JobRecord) -> bool {
        (self.states.is_empty() || self.states.contains(&rec.status.state))
            && self
                .labels
                .iter()
                .all(|(k, v)| rec.metadata.labels.get(k) == Some(v))
    }
}

/// Parses `key=value,key2=value2`.
pub fn parse_label_selector(raw: &str) -> Result<BTreeMap<String, String>, String> {
    let mut out = BTreeMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = part
            .split_once('=')
            .ok_or_else(|| format!("labelSelector: expected key=value, got {part:?}"))?;
        let k = k.trim();
        if k.is_empty() {
            return Err(format!("labelSelector: empty key in {part:?}"));
        }
        out.insert(k.to_string(), v.trim().to_string());
    }
    Ok(out)
}

/// Outcome of [`JobStore::update`].
#[derive(Debug, Clone)]
pub enum Update {
    Missing,
    /// The mutator declined; carries the record as it is.
    Unchanged(JobRecord),
    Applied { previous: JobState, record: JobRecord },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(JobRecord),
    /// Active jobs hold an admission slot and are never removed.
    Active(JobState),
    Missing,
}

pub type Mutator<'a> = &'a mut (dyn FnMut(&mut JobRecord) -> bool + Send);

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, record: JobRecord) -> StoreResult<()>;
    async fn get(&self, kind: JobKind, name: &str) -> StoreResult<Option<JobRecord>>;
    async fn list(&self, kind: JobKind, filter: &ListFilter) -> StoreResult<Vec<JobRecord>>;
    async fn count(&self, kind: JobKind, state: JobState) -> StoreResult<usize>;

    /// Atomic read-modify-write. The mutator runs against the stored record
    /// and its result is written back only when it returns `true`.
    async fn update(&self, kind: JobKind, name: &str, mutate: Mutator<'_>) -> StoreResult<Update>;

    async fn delete(&self, kind: JobKind, name: &str) -> StoreResult<DeleteOutcome>;

    async fn save_logs(&self, kind: JobKind, name: &str, logs: &str) -> StoreResult<()>;
    async fn get_logs(&self, kind: JobKind, name: &str) -> StoreResult<Option<String>>;
}

struct Entry {
    seq: u64,
    record: JobRecord,
    logs: Option<String>,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    entries: HashMap<(JobKind, String), Entry>,
}

/// Process-local store used when no database is configured, and in tests.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, record: JobRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let key = (record.kind(), record.metadata.name.clone());
        if inner.entries.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: record.kind().as_str(),
                name: record.metadata.name,
            });
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.entries.insert(key, Entry { seq, record, logs: None });
        Ok(())
    }

    async fn get(&self, kind: JobKind, name: &str) -> StoreResult<Option<JobRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .get(&(kind, name.to_string()))
            .map(|e| e.record.clone()))
    }

    async fn list(&self, kind: JobKind, filter: &ListFilter) -> StoreResult<Vec<JobRecord>> {
        let inner = self.inner.read().await;
        let mut hits: Vec<&Entry> = inner
            .entries
            .iter()
            .filter(|((k, _), e)| *k == kind && filter.matches(&e.record))
            .map(|(_, e)| e)
            .collect();
        hits.sort_by_key(|e| (e.record.metadata.creation_timestamp, e.seq));
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(hits.into_iter().take(limit).map(|e| e.record.clone()).collect())
    }

    async fn count(&self, kind: JobKind, state: JobState) -> StoreResult<usize> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .iter()
            .filter(|((k, _), e)| *k == kind && e.record.status.state == state)
            .count())
    }

    async fn update(&self, kind: JobKind, name: &str, mutate: Mutator<'_>) -> StoreResult<Update> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.get_mut(&(kind, name.to_string())) else {
            return Ok(Update::Missing);
        };
        let previous = entry.record.status.state;
        let mut candidate = entry.record.clone();
        if !mutate(&mut candidate) {
            return Ok(Update::Unchanged(candidate));
        }
        entry.record = candidate.clone();
        Ok(Update::Applied { previous, record: candidate })
    }

    async fn delete(&self, kind: JobKind, name: &str) -> StoreResult<DeleteOutcome> {
        let mut inner = self.inner.write().await;
        let key = (kind, name.to_string());
        match inner.entries.get(&key).map(|e| e.record.status.state) {
            None => Ok(DeleteOutcome::Missing),
            Some(state) if state.is_active() => Ok(DeleteOutcome::Active(state)),
            Some(_) => {
                let entry = inner.entries.remove(&key);
                Ok(entry.map_or(DeleteOutcome::Missing, |e| DeleteOutcome::Deleted(e.record)))
            }
        }
    }

    async fn save_logs(&self, kind: JobKind, name: &str, logs: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(e) = inner.entries.get_mut(&(kind, name.to_string())) {
            e.logs = Some(logs.to_string());
        }
        Ok(())
    }

    async fn get_logs(&self, kind: JobKind, name: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .get(&(kind, name.to_string()))
            .and_then(|e| e.logs.clone()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types_jobs::{BuildSpec, JobEvent, JobOrigin, JobSpec};

    fn rec(name: &str, labels: &[(&str, &str)]) -> JobRecord {
        JobRecord::new(
            name.to_string(),
            labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            JobOrigin::User,
            JobSpec::Build(BuildSpec::default()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_names() {
        let store = MemoryJobStore::new();
        store.insert(rec("a", &[])).await.unwrap();
        let err = store.insert(rec("a", &[])).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn list_is_in_creation_order_and_filters() {
        let store = MemoryJobStore::new();
        for name in ["c", "a", "b"] {
            store.insert(rec(name, &[("env", "prod")])).await.unwrap();
        }
        store.insert(rec("d", &[("env", "dev")])).await.unwrap();

        let all = store.list(JobKind::Build, &ListFilter::default()).await.unwrap();
        let names: Vec<_> = all.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["c", "a", "b", "d"]);

        let filter = ListFilter {
            labels: parse_label_selector("env=prod").unwrap(),
            limit: Some(2),
            ..ListFilter::default()
        };
        let prod = store.list(JobKind::Build, &filter).await.unwrap();
        let names: Vec<_> = prod.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["c", "a"]);

        assert!(store.list(JobKind::Export, &ListFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_is_compare_and_set() {
        let store = MemoryJobStore::new();
        store.insert(rec("a", &[])).await.unwrap();

        let now = Utc::now();
        let first = store
            .update(JobKind::Build, "a", &mut |r| r.apply(&JobEvent::Admitted, now))
            .await
            .unwrap();
        assert!(matches!(first, Update::Applied { previous: JobState::Pending, .. }));

        let second = store
            .update(JobKind::Build, "a", &mut |r| r.apply(&JobEvent::Admitted, now))
            .await
            .unwrap();
        assert!(matches!(second, Update::Unchanged(_)));

        let missing = store
            .update(JobKind::Build, "nope", &mut |_| true)
            .await
            .unwrap();
        assert!(matches!(missing, Update::Missing));
    }

    #[tokio::test]
    async fn delete_refuses_active_jobs() {
        let store = MemoryJobStore::new();
        store.insert(rec("a", &[])).await.unwrap();
        store
            .update(JobKind::Build, "a", &mut |r| r.apply(&JobEvent::Admitted, Utc::now()))
            .await
            .unwrap();
        assert_eq!(
            store.delete(JobKind::Build, "a").await.unwrap(),
            DeleteOutcome::Active(JobState::Building)
        );
        store
            .update(JobKind::Build, "a", &mut |r| {
                r.apply(&JobEvent::Failed { message: "x".into() }, Utc::now())
            })
            .await
            .unwrap();
        assert!(matches!(
            store.delete(JobKind::Build, "a").await.unwrap(),
            DeleteOutcome::Deleted(_)
        ));
        assert_eq!(store.delete(JobKind::Build, "a").await.unwrap(), DeleteOutcome::Missing);
    }

    #[test]
    fn label_selector_parsing() {
        let sel = parse_label_selector("a=1, b = 2").unwrap();
        assert_eq!(sel.get("a").map(String::as_str), Some("1"));
        assert_eq!(sel.get("b").map(String::as_str), Some("2"));
        assert!(parse_label_selector("novalue").is_err());
        assert!(parse_label_selector("=x").is_err());
        assert!(parse_label_selector("").unwrap().is_empty());
    }
}
