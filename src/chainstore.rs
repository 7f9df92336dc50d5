//! # Chainstore
//!
//! Fork-safe checkpoint store used by the chain indices. Each checkpoint is an
//! opaque JSON payload tied to the tipset it was computed at:
//!
//! - `/data/<hex tipset key>` holds the payload
//! - `/id/<seq>` holds the tipset key bytes, in save order
//!
//! On restart an index calls [`Chainstore::load_and_prune`] with the current
//! head; checkpoints taken on an orphaned fork are dropped and the newest one
//! still on the canonical chain is restored.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::chainsync::TipsetOrderer;
use crate::datastore::{DatastoreError, Key, SharedDatastore, Txn};
use crate::lotus::{LotusError, TipSetKey};

/// Number of checkpoints retained per store.
pub const MAX_CHECKPOINTS: usize = 10;

#[derive(Debug, Error)]
pub enum ChainstoreError {
    #[error("chainstore datastore error: {0}")]
    Datastore(#[from] DatastoreError),
    #[error("chainstore ordering check failed: {0}")]
    Lotus(#[from] LotusError),
    #[error("chainstore payload error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("checkpoint {next} does not follow last checkpoint {last}")]
    NotPreceding { last: String, next: String },
    #[error("checkpoint {0} has no payload")]
    MissingPayload(String),
}

impl ChainstoreError {
    /// An ordering violation means the orderer disagrees with saved history.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainstoreError::NotPreceding { .. })
    }
}

struct Checkpoint {
    id_key: Key,
    seq: u64,
    tipset: TipSetKey,
}

pub struct Chainstore {
    ds: SharedDatastore,
    orderer: Arc<dyn TipsetOrderer>,
    lock: Mutex<()>,
}

fn data_key(ts: &TipSetKey) -> Key {
    Key::new("/data").child(ts.to_hex())
}

fn id_key(seq: u64) -> Key {
    Key::new("/id").child(format!("{seq:020}"))
}

impl Chainstore {
    pub fn new(ds: SharedDatastore, orderer: Arc<dyn TipsetOrderer>) -> Self {
        Self {
            ds,
            orderer,
            lock: Mutex::new(()),
        }
    }

    async fn checkpoints(&self) -> Result<Vec<Checkpoint>, ChainstoreError> {
        let entries = self.ds.query(&Key::new("/id")).await?;
        let mut checkpoints = Vec::with_capacity(entries.len());
        for entry in entries {
            let seq = entry.key.name().parse::<u64>().unwrap_or_default();
            checkpoints.push(Checkpoint {
                tipset: TipSetKey::from_bytes(&entry.value)?,
                id_key: entry.key,
                seq,
            });
        }
        Ok(checkpoints)
    }

    /// Saves `state` as the checkpoint for `ts`, which must follow the last
    /// saved checkpoint.
    pub async fn save<T: Serialize>(&self, ts: &TipSetKey, state: &T) -> Result<(), ChainstoreError> {
        let _guard = self.lock.lock().await;
        let checkpoints = self.checkpoints().await?;
        let payload = serde_json::to_vec(state)?;

        let mut txn = Txn::new(self.ds.clone(), false);
        if let Some(last) = checkpoints.last() {
            if !self.orderer.precedes(&last.tipset, ts).await? {
                return Err(ChainstoreError::NotPreceding {
                    last: last.tipset.to_string(),
                    next: ts.to_string(),
                });
            }
            if &last.tipset == ts {
                txn.put(data_key(ts), payload)?;
                txn.commit().await?;
                return Ok(());
            }
        }

        let next_seq = checkpoints.last().map(|c| c.seq + 1).unwrap_or_default();
        txn.put(data_key(ts), payload)?;
        txn.put(id_key(next_seq), ts.to_bytes())?;

        let overflow = (checkpoints.len() + 1).saturating_sub(MAX_CHECKPOINTS);
        for old in checkpoints.iter().take(overflow) {
            txn.delete(old.id_key.clone())?;
            txn.delete(data_key(&old.tipset))?;
        }
        txn.commit().await?;
        debug!(tipset = %ts, seq = next_seq, "Checkpoint saved");
        Ok(())
    }

    /// Restores the newest checkpoint preceding `head` into `out`, deleting
    /// every newer checkpoint. Returns `None` and leaves `out` untouched when
    /// no checkpoint qualifies.
    pub async fn load_and_prune<T: DeserializeOwned>(
        &self,
        head: &TipSetKey,
        out: &mut T,
    ) -> Result<Option<TipSetKey>, ChainstoreError> {
        let _guard = self.lock.lock().await;
        let checkpoints = self.checkpoints().await?;

        let mut txn = Txn::new(self.ds.clone(), false);
        let mut base = None;
        for checkpoint in checkpoints.iter().rev() {
            if self.orderer.precedes(&checkpoint.tipset, head).await? {
                base = Some(checkpoint.tipset.clone());
                break;
            }
            txn.delete(checkpoint.id_key.clone())?;
            txn.delete(data_key(&checkpoint.tipset))?;
        }

        if let Some(ts) = &base {
            let payload = self
                .ds
                .get(&data_key(ts))
                .await?
                .ok_or_else(|| ChainstoreError::MissingPayload(ts.to_string()))?;
            *out = serde_json::from_slice(&payload)?;
        }
        let pruned = !txn.is_empty();
        txn.commit().await?;
        if pruned {
            info!(head = %head, "Pruned checkpoints from orphaned fork");
        }
        Ok(base)
    }

    /// Loads the most recent checkpoint without any fork check.
    pub async fn get_last_checkpoint<T: DeserializeOwned>(
        &self,
        out: &mut T,
    ) -> Result<Option<TipSetKey>, ChainstoreError> {
        let checkpoints = self.checkpoints().await?;
        let Some(last) = checkpoints.last() else {
            return Ok(None);
        };
        let payload = self
            .ds
            .get(&data_key(&last.tipset))
            .await?
            .ok_or_else(|| ChainstoreError::MissingPayload(last.tipset.to_string()))?;
        *out = serde_json::from_slice(&payload)?;
        Ok(Some(last.tipset.clone()))
    }

    /// Tipsets of all retained checkpoints, oldest first.
    pub async fn tipsets(&self) -> Result<Vec<TipSetKey>, ChainstoreError> {
        Ok(self
            .checkpoints()
            .await?
            .into_iter()
            .map(|c| c.tipset)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;

    use super::*;
    use crate::datastore::{MemoryDatastore, NamespacedDatastore};
    use crate::lotus::Cid;

    /// Orders tipsets `a<n>` linearly; `fork<n>` tipsets are preceded by the
    /// listed subset of `a<n>`.
    struct LinearOrderer {
        fork_ancestors: HashSet<String>,
    }

    fn ts(name: &str) -> TipSetKey {
        TipSetKey::new(vec![Cid::from(name)])
    }

    fn height(key: &TipSetKey) -> Option<u32> {
        key.0[0].as_str().strip_prefix('a')?.parse().ok()
    }

    #[async_trait]
    impl TipsetOrderer for LinearOrderer {
        async fn precedes(&self, from: &TipSetKey, to: &TipSetKey) -> Result<bool, LotusError> {
            if from == to {
                return Ok(true);
            }
            if to.0[0].as_str().starts_with("fork") {
                return Ok(self.fork_ancestors.contains(from.0[0].as_str()));
            }
            Ok(match (height(from), height(to)) {
                (Some(f), Some(t)) => f <= t,
                _ => false,
            })
        }
    }

    fn store(fork_ancestors: &[&str]) -> Chainstore {
        let root: SharedDatastore = Arc::new(MemoryDatastore::new());
        let ds = Arc::new(NamespacedDatastore::new(root, Key::new("/chainstore/test")));
        Chainstore::new(
            ds,
            Arc::new(LinearOrderer {
                fork_ancestors: fork_ancestors.iter().map(|s| s.to_string()).collect(),
            }),
        )
    }

    #[tokio::test]
    async fn empty_history_leaves_output_untouched() {
        let cs = store(&[]);
        let mut out = 7u32;
        assert_eq!(cs.load_and_prune(&ts("a1"), &mut out).await.unwrap(), None);
        assert_eq!(out, 7);
        assert_eq!(cs.get_last_checkpoint(&mut out).await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_rejects_non_preceding_tipset() {
        let cs = store(&[]);
        cs.save(&ts("a5"), &5u32).await.unwrap();
        let err = cs.save(&ts("a3"), &3u32).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn retains_only_most_recent_checkpoints() {
        let cs = store(&[]);
        for i in 0..15u32 {
            cs.save(&ts(&format!("a{i}")), &i).await.unwrap();
        }
        let kept = cs.tipsets().await.unwrap();
        assert_eq!(kept.len(), MAX_CHECKPOINTS);
        assert_eq!(kept.first(), Some(&ts("a5")));
        assert_eq!(kept.last(), Some(&ts("a14")));

        let mut out = 0u32;
        assert_eq!(
            cs.get_last_checkpoint(&mut out).await.unwrap(),
            Some(ts("a14"))
        );
        assert_eq!(out, 14);
    }

    #[tokio::test]
    async fn fork_prunes_orphaned_checkpoints() {
        let cs = store(&["a0", "a1", "a2", "a3", "a4", "a5"]);
        for i in 0..10u32 {
            cs.save(&ts(&format!("a{i}")), &format!("state-{i}")).await.unwrap();
        }

        let mut out = String::new();
        let base = cs.load_and_prune(&ts("fork5"), &mut out).await.unwrap();
        assert_eq!(base, Some(ts("a5")));
        assert_eq!(out, "state-5");

        let kept = cs.tipsets().await.unwrap();
        assert_eq!(kept.len(), 6);
        assert_eq!(kept.last(), Some(&ts("a5")));
    }

    #[tokio::test]
    async fn saving_same_tipset_overwrites_payload() {
        let cs = store(&[]);
        cs.save(&ts("a1"), &1u32).await.unwrap();
        cs.save(&ts("a1"), &2u32).await.unwrap();
        assert_eq!(cs.tipsets().await.unwrap().len(), 1);
        let mut out = 0u32;
        cs.get_last_checkpoint(&mut out).await.unwrap();
        assert_eq!(out, 2);
    }
}
