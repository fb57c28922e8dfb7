use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{error::JobError, job::Job};

/// In-memory keyed storage for job records. Every write replaces the whole
/// record under the write lock, so readers only ever see fully applied
/// updates.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, mut job: Job) -> Result<(), JobError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(JobError::DuplicateJob(job.id));
        }
        stamp(&mut job);
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Replaces the stored record for `id` with `job`.
    pub async fn update(&self, id: &str, job: Job) -> Result<Job, JobError> {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get(id)
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))?;
        current.validate_successor(&job)?;
        Ok(replace(&mut jobs, id, job))
    }

    /// Applies `change` to the stored record if it is still active.
    ///
    /// Returns `Ok(None)` without touching anything when the job already
    /// reached a terminal state, so late results of in-flight work are
    /// dropped instead of overwriting a cancellation or timeout.
    pub async fn update_active<F>(&self, id: &str, change: F) -> Result<Option<Job>, JobError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobError>,
    {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get(id)
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))?;
        if current.is_terminal() {
            return Ok(None);
        }

        let mut next = current.clone();
        change(&mut next)?;
        current.validate_successor(&next)?;
        Ok(Some(replace(&mut jobs, id, next)))
    }

    /// Removes terminal jobs whose age since completion strictly exceeds
    /// `retention` and returns their ids. Active jobs are never evicted.
    pub async fn remove_expired(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Vec<String> {
        let mut jobs = self.jobs.write().await;
        let expired: Vec<String> = jobs
            .values()
            .filter(|job| job.is_terminal())
            .filter(|job| {
                let finished_at = job.completed_at.unwrap_or(job.created_at);
                now.signed_duration_since(finished_at) > retention
            })
            .map(|job| job.id.clone())
            .collect();

        for id in &expired {
            jobs.remove(id);
        }

        expired
    }
}

fn stamp(job: &mut Job) {
    job.progress.last_updated = Utc::now();
    job.progress.background_job_status = job.status;
}

fn replace(jobs: &mut HashMap<String, Job>, id: &str, mut job: Job) -> Job {
    stamp(&mut job);
    jobs.insert(id.to_string(), job.clone());
    job
}
