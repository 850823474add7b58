//! Job storage implementations.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{JobId, JobRecord};

/// Job store abstraction.
///
/// `Q` is the host's "next jobs" query: the store decides eligibility and
/// ordering from it.
#[async_trait]
pub trait JobStore<T, Q>: Send + Sync
where
    T: Send + Sync + 'static,
    Q: Send + 'static,
{
    /// Clear `active` on every record (crash recovery at start).
    async fn mark_all_inactive(&self) -> Result<(), JobStoreError>;

    /// Insert records. An existing id keeps its attempts, `active` flag and
    /// backoff; only the payload is refreshed.
    async fn insert(&self, records: Vec<JobRecord<T>>) -> Result<(), JobStoreError>;

    /// Overwrite an existing record.
    async fn update(&self, record: &JobRecord<T>) -> Result<(), JobStoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord<T>>, JobStoreError>;

    /// Delete a record. Deleting a missing id is not an error.
    async fn remove(&self, id: &JobId) -> Result<(), JobStoreError>;

    /// Every stored record.
    async fn jobs(&self) -> Result<Vec<JobRecord<T>>, JobStoreError>;

    /// Inactive, eligible records matching `query`, in priority order.
    async fn next_jobs(&self, query: Q) -> Result<Vec<JobRecord<T>>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// How an in-memory store answers a "next jobs" query.
pub trait JobSelector<T>: Send + 'static {
    fn limit(&self) -> usize;

    /// Reference time for `retry_after`.
    fn now(&self) -> DateTime<Utc>;

    /// Host-specific filter applied on top of eligibility.
    fn matches(&self, _record: &JobRecord<T>) -> bool {
        true
    }

    /// Priority order; `Less` runs first.
    fn compare(&self, _a: &JobRecord<T>, _b: &JobRecord<T>) -> Ordering {
        Ordering::Equal
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore<T> {
    jobs: RwLock<HashMap<JobId, JobRecord<T>>>,
}

impl<T> InMemoryJobStore<T> {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> InMemoryJobStore<T> {
    /// Synchronous lookup, for inspection.
    pub fn snapshot(&self, id: &JobId) -> Option<JobRecord<T>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

impl<T> Default for InMemoryJobStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T, Q> JobStore<T, Q> for InMemoryJobStore<T>
where
    T: Clone + Send + Sync + 'static,
    Q: JobSelector<T>,
{
    async fn mark_all_inactive(&self) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        for record in jobs.values_mut() {
            record.active = false;
        }
        Ok(())
    }

    async fn insert(&self, records: Vec<JobRecord<T>>) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            match jobs.get_mut(&record.id) {
                Some(existing) => existing.data = record.data,
                None => {
                    jobs.insert(record.id.clone(), record);
                }
            }
        }
        Ok(())
    }

    async fn update(&self, record: &JobRecord<T>) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        match jobs.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(record.id.clone())),
        }
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord<T>>, JobStoreError> {
        Ok(self.snapshot(id))
    }

    async fn remove(&self, id: &JobId) -> Result<(), JobStoreError> {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }

    async fn jobs(&self) -> Result<Vec<JobRecord<T>>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.values().cloned().collect())
    }

    async fn next_jobs(&self, query: Q) -> Result<Vec<JobRecord<T>>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let now = query.now();

        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|record| record.is_eligible(now) && query.matches(record))
            .collect();

        candidates.sort_by(|a, b| query.compare(a, b).then_with(|| a.id.cmp(&b.id)));
        candidates.truncate(query.limit());

        Ok(candidates.into_iter().cloned().collect())
    }
}

#[async_trait]
impl<T, Q, S> JobStore<T, Q> for Arc<S>
where
    T: Send + Sync + 'static,
    Q: Send + 'static,
    S: JobStore<T, Q> + ?Sized,
{
    async fn mark_all_inactive(&self) -> Result<(), JobStoreError> {
        (**self).mark_all_inactive().await
    }

    async fn insert(&self, records: Vec<JobRecord<T>>) -> Result<(), JobStoreError> {
        (**self).insert(records).await
    }

    async fn update(&self, record: &JobRecord<T>) -> Result<(), JobStoreError> {
        (**self).update(record).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord<T>>, JobStoreError> {
        (**self).get(id).await
    }

    async fn remove(&self, id: &JobId) -> Result<(), JobStoreError> {
        (**self).remove(id).await
    }

    async fn jobs(&self) -> Result<Vec<JobRecord<T>>, JobStoreError> {
        (**self).jobs().await
    }

    async fn next_jobs(&self, query: Q) -> Result<Vec<JobRecord<T>>, JobStoreError> {
        (**self).next_jobs(query).await
    }
}
