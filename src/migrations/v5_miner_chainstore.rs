//! v5: deletes the chainstore checkpoints of the miner index, which no
//! longer tracks the chain.

use async_trait::async_trait;
use tracing::info;

use super::{DatastoreMigration, MigrationStore};
use crate::datastore::Key;
use crate::error::Result;

pub struct Migration;

#[async_trait]
impl DatastoreMigration for Migration {
    fn version(&self) -> u64 {
        5
    }

    fn use_txn(&self) -> bool {
        true
    }

    async fn up(&self, store: &mut MigrationStore) -> Result<()> {
        let obsolete = store.query(&Key::new("/chainstore/miner")).await?;
        let count = obsolete.len();
        for entry in obsolete {
            store.delete(entry.key).await?;
        }
        info!(keys = count, "Deleted obsolete miner chainstore keys");
        Ok(())
    }
}
