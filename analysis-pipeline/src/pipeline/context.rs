use tracing::{debug, error};

use crate::{error::JobError, job::Job, queue::QueueInner};

use super::PhaseOutcome;

pub(crate) struct PhaseContext<'a> {
    pub inner: &'a QueueInner,
    pub job: Job,
    pub job_id: String,
    pub analysis_id: String,
}

impl<'a> PhaseContext<'a> {
    pub fn new(inner: &'a QueueInner, job: Job) -> Self {
        let job_id = job.id.clone();
        let analysis_id = job.analysis_id.clone();
        Self {
            inner,
            job,
            job_id,
            analysis_id,
        }
    }

    /// Applies `change` to the stored job and refreshes the local snapshot.
    ///
    /// Returns `Ok(false)` once the job has gone terminal underneath the
    /// phase; callers must then drop whatever they were about to record.
    pub async fn apply<F>(&mut self, change: F) -> Result<bool, JobError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobError>,
    {
        match self.inner.store.update_active(&self.job_id, change).await? {
            Some(job) => {
                self.job = job;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn discarded(&self) -> PhaseOutcome {
        debug!(
            job_id = %self.job_id,
            analysis_id = %self.analysis_id,
            "job finished while phase was running, discarding result"
        );
        PhaseOutcome::Finished
    }

    pub fn abort(&self, err: &JobError) {
        error!(
            job_id = %self.job_id,
            analysis_id = %self.analysis_id,
            phase = self.job.phase.as_str(),
            error = %err,
            "analysis phase aborted"
        );
    }
}
