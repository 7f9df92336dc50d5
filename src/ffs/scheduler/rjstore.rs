//! Retrieval-job registry under `/rjstore/job/<jobID>`.
//!
//! Retrieval jobs don't share the per-user ordering of storage jobs, so the
//! store is a plain keyed registry with status transitions checked on write.

use tokio::sync::Mutex;

use crate::datastore::{Key, SharedDatastore};
use crate::error::{Error, Result};
use crate::ffs::types::{JobId, JobStatus, RetrievalJob};

pub fn job_key() -> Key {
    Key::new("/rjstore/job")
}

pub struct RjStore {
    ds: SharedDatastore,
    write: Mutex<()>,
}

impl RjStore {
    pub fn new(ds: SharedDatastore) -> Self {
        Self {
            ds,
            write: Mutex::new(()),
        }
    }

    async fn put(&self, job: &RetrievalJob) -> Result<()> {
        self.ds
            .put(&job_key().child(job.id.as_str()), serde_json::to_vec(job)?)
            .await?;
        Ok(())
    }

    pub async fn create(&self, mut job: RetrievalJob) -> Result<RetrievalJob> {
        job.status = JobStatus::Queued;
        let _guard = self.write.lock().await;
        self.put(&job).await?;
        Ok(job)
    }

    pub async fn get(&self, id: &JobId) -> Result<RetrievalJob> {
        match self.ds.get(&job_key().child(id.as_str())).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Err(Error::NotFound(format!("retrieval job {id}"))),
        }
    }

    pub async fn start(&self, id: &JobId) -> Result<RetrievalJob> {
        let _guard = self.write.lock().await;
        let mut job = self.get(id).await?;
        if job.status != JobStatus::Queued {
            return Err(Error::Internal(format!(
                "retrieval job {id} is {} and can't start",
                job.status
            )));
        }
        job.status = JobStatus::Executing;
        self.put(&job).await?;
        Ok(job)
    }

    /// Applies `update` and moves the job to a terminal `status`.
    pub async fn finalize(
        &self,
        id: &JobId,
        status: JobStatus,
        update: impl FnOnce(&mut RetrievalJob),
    ) -> Result<RetrievalJob> {
        if !status.is_final() {
            return Err(Error::Internal(format!("{status} isn't a final status")));
        }
        let _guard = self.write.lock().await;
        let mut job = self.get(id).await?;
        if job.status.is_final() {
            return Err(Error::Internal(format!(
                "retrieval job {id} is already {}",
                job.status
            )));
        }
        update(&mut job);
        job.status = status;
        self.put(&job).await?;
        Ok(job)
    }

    pub async fn with_status(&self, status: JobStatus) -> Result<Vec<RetrievalJob>> {
        let mut jobs = Vec::new();
        for entry in self.ds.query(&job_key()).await? {
            let job: RetrievalJob = serde_json::from_slice(&entry.value)?;
            if job.status == status {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(jobs)
    }
}
