use std::collections::BTreeMap;

use crate::datastore::{Key, SharedDatastore, Txn};
use crate::error::Result;

use super::{ChainIndex, Meta, MetaIndex, MinerIndex, OnChainMinerData};

fn meta_prefix() -> Key {
    Key::new("/meta")
}

fn onchain_miner_prefix() -> Key {
    Key::new("/onchain/miner")
}

fn onchain_height_key() -> Key {
    Key::new("/onchain/height")
}

/// Persists both sub-indices, one entry per miner.
pub struct MinerStore {
    ds: SharedDatastore,
    flush_batch_size: usize,
}

impl MinerStore {
    pub fn new(ds: SharedDatastore, flush_batch_size: usize) -> Self {
        Self {
            ds,
            flush_batch_size: flush_batch_size.max(1),
        }
    }

    pub async fn save_meta(&self, index: &MetaIndex) -> Result<()> {
        let mut txn = Txn::new(self.ds.clone(), false);
        for (addr, meta) in &index.info {
            txn.put(meta_prefix().child(addr), serde_json::to_vec(meta)?)?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Writes miners in batches, then the height watermark.
    pub async fn save_on_chain(&self, index: &ChainIndex) -> Result<()> {
        let mut txn = Txn::new(self.ds.clone(), false);
        let mut pending = 0usize;
        for (addr, data) in &index.miners {
            txn.put(onchain_miner_prefix().child(addr), serde_json::to_vec(data)?)?;
            pending += 1;
            if pending == self.flush_batch_size {
                txn.commit().await?;
                txn = Txn::new(self.ds.clone(), false);
                pending = 0;
            }
        }
        txn.commit().await?;
        self.ds
            .put(&onchain_height_key(), index.last_updated.to_le_bytes().to_vec())
            .await?;
        Ok(())
    }

    pub async fn get_index(&self) -> Result<MinerIndex> {
        let mut info = BTreeMap::new();
        for entry in self.ds.query(&meta_prefix()).await? {
            let meta: Meta = serde_json::from_slice(&entry.value)?;
            info.insert(entry.key.name().to_string(), meta);
        }

        let mut miners = BTreeMap::new();
        for entry in self.ds.query(&onchain_miner_prefix()).await? {
            let data: OnChainMinerData = serde_json::from_slice(&entry.value)?;
            miners.insert(entry.key.name().to_string(), data);
        }
        let last_updated = match self.ds.get(&onchain_height_key()).await? {
            Some(raw) if raw.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&raw);
                i64::from_le_bytes(buf)
            }
            _ => 0,
        };

        Ok(MinerIndex {
            meta: MetaIndex { info },
            on_chain: ChainIndex {
                last_updated,
                miners,
            },
        })
    }
}
