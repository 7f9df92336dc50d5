//! v3: builds the `(user, cid)` secondary indices of storage jobs.

use async_trait::async_trait;
use tracing::info;

use super::{DatastoreMigration, MigrationStore};
use crate::error::Result;
use crate::ffs::scheduler::sjstore::{apiid_key, cid_key, job_key};
use crate::ffs::types::StorageJob;

pub struct Migration;

#[async_trait]
impl DatastoreMigration for Migration {
    fn version(&self) -> u64 {
        3
    }

    fn use_txn(&self) -> bool {
        true
    }

    async fn up(&self, store: &mut MigrationStore) -> Result<()> {
        let mut indexed = 0;
        for entry in store.query(&job_key()).await? {
            let job: StorageJob = serde_json::from_slice(&entry.value)?;
            let ts = job.created_at.to_string();
            let id = job.id.as_str().as_bytes().to_vec();
            store
                .put(
                    apiid_key()
                        .child(job.user_id.as_str())
                        .child(job.cid.as_str())
                        .child(&ts),
                    id.clone(),
                )
                .await?;
            store
                .put(
                    cid_key()
                        .child(job.cid.as_str())
                        .child(job.user_id.as_str())
                        .child(&ts),
                    id,
                )
                .await?;
            indexed += 1;
        }
        info!(jobs = indexed, "Storage job indices built");
        Ok(())
    }
}
