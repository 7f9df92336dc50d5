//! v4: gives retrieval records their id and builds the updated-at index of
//! every deal record.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tracing::info;

use super::{DatastoreMigration, MigrationStore};
use crate::datastore::Key;
use crate::deals::{
    RecordKind, RetrievalDealRecord, StorageDealRecord, retrieval_key, storage_final_key,
    storage_pending_key, updated_at_key,
};
use crate::error::{Error, Result};

pub struct Migration;

#[async_trait]
impl DatastoreMigration for Migration {
    fn version(&self) -> u64 {
        4
    }

    async fn up(&self, store: &mut MigrationStore) -> Result<()> {
        let mut retrievals = 0;
        for entry in store.query(&retrieval_key()).await? {
            let mut record: RetrievalDealRecord = serde_json::from_slice(&entry.value)?;
            record.id = record.compute_id();
            store.put(entry.key, serde_json::to_vec(&record)?).await?;
            retrievals += 1;
        }
        info!(records = retrievals, "Retrieval record ids populated");

        for prefix in [storage_pending_key(), storage_final_key()] {
            index_records::<StorageDealRecord>(store, &prefix, RecordKind::Storage, |r| {
                (r.date_nanos, &mut r.updated_at)
            })
            .await?;
        }
        index_records::<RetrievalDealRecord>(store, &retrieval_key(), RecordKind::Retrieval, |r| {
            (r.date_nanos, &mut r.updated_at)
        })
        .await?;
        Ok(())
    }
}

/// Indexes each record under its creation time, bumping collisions.
async fn index_records<R>(
    store: &mut MigrationStore,
    prefix: &Key,
    kind: RecordKind,
    times: impl Fn(&mut R) -> (i64, &mut i64) + Send + Sync,
) -> Result<()>
where
    R: Serialize + DeserializeOwned + Send,
{
    let base = updated_at_key(kind);
    let mut count = 0;
    for entry in store.query(prefix).await? {
        let mut record: R = serde_json::from_slice(&entry.value)?;
        let (created, updated_at) = times(&mut record);
        if created == 0 {
            return Err(Error::Migration(format!("record {} has no time", entry.key)));
        }
        let mut ts = created;
        while store.has(&base.child(ts.to_string())).await? {
            ts += 1;
        }
        *updated_at = ts;
        store
            .put(base.child(ts.to_string()), entry.key.as_str().as_bytes().to_vec())
            .await?;
        store.put(entry.key, serde_json::to_vec(&record)?).await?;
        count += 1;
    }
    info!(records = count, prefix = %prefix, "Updated-at index populated");
    Ok(())
}
