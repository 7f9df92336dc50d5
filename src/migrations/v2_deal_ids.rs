//! v2: backfills deal ids into stored cid info.
//!
//! Proposals recorded before deal ids were tracked carry a zero id. The id is
//! looked up in the storage deal records by proposal cid. Proposals without a
//! record keep their zero id.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::info;

use super::{DatastoreMigration, MigrationStore};
use crate::deals::{StorageDealRecord, storage_final_key, storage_pending_key};
use crate::error::Result;
use crate::ffs::scheduler::cistore;
use crate::ffs::types::StorageInfo;
use crate::lotus::Cid;

pub struct Migration;

#[async_trait]
impl DatastoreMigration for Migration {
    fn version(&self) -> u64 {
        2
    }

    async fn up(&self, store: &mut MigrationStore) -> Result<()> {
        let mut deal_ids: HashMap<Cid, u64> = HashMap::new();
        for prefix in [storage_pending_key(), storage_final_key()] {
            for entry in store.query(&prefix).await? {
                let record: StorageDealRecord = serde_json::from_slice(&entry.value)?;
                if record.deal_info.deal_id != 0 {
                    deal_ids.insert(record.deal_info.proposal_cid, record.deal_info.deal_id);
                }
            }
        }
        info!(records = deal_ids.len(), "Collected deal ids from deal records");

        let (mut mapped, mut unmapped) = (0usize, 0usize);
        for entry in store.query(&cistore::base_key()).await? {
            let mut info: StorageInfo = serde_json::from_slice(&entry.value)?;
            let mut changed = false;
            for proposal in &mut info.cold.filecoin.proposals {
                if proposal.deal_id != 0 {
                    continue;
                }
                match deal_ids.get(&proposal.proposal_cid) {
                    Some(id) => {
                        proposal.deal_id = *id;
                        changed = true;
                        mapped += 1;
                    }
                    None => unmapped += 1,
                }
            }
            if changed {
                store.put(entry.key, serde_json::to_vec(&info)?).await?;
            }
        }
        info!(mapped, unmapped, "Deal ids backfilled");
        Ok(())
    }
}
