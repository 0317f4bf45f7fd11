//! Same-process job status snapshots.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use jobrelay_core::{Job, JobId};

/// Last known snapshot of every job this process has touched.
///
/// Concurrent readers, exclusive writers. This is never a durability
/// authority: a fresh process starts with an empty cache.
#[derive(Debug, Default)]
pub struct StatusCache {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Store `job` as the latest snapshot for its id.
    pub fn insert(&self, job: Job) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.insert(job.id, job);
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.get(&id).cloned()
    }

    /// Forget a snapshot, e.g. when the submission it belonged to failed.
    pub fn remove(&self, id: JobId) -> Option<Job> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_core::JobStatus;

    #[test]
    fn insert_overwrites_previous_snapshot() {
        let cache = StatusCache::new();
        let mut job = Job::new("t", Vec::new());
        let id = job.mark_queued(chrono::Utc::now());
        cache.insert(job.clone());

        job.mark_running(chrono::Utc::now());
        cache.insert(job);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(id).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn remove_forgets_snapshot() {
        let cache = StatusCache::new();
        let mut job = Job::new("t", Vec::new());
        let id = job.mark_queued(chrono::Utc::now());
        cache.insert(job);

        assert!(cache.remove(id).is_some());
        assert!(cache.get(id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn unknown_id_is_none() {
        let cache = StatusCache::new();
        assert!(cache.get(JobId::new()).is_none());
        assert!(cache.is_empty());
    }
}
