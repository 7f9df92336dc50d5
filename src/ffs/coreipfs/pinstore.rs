//! Reference-counted registry of IPFS pins shared by every user.
//!
//! Each cid keeps one entry per user; an entry is either *staged* (data
//! uploaded ahead of a storage job) or permanent. Entries live under
//! `/ffs/coreipfs/pinstore/pins/<cid>` and are mirrored in memory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::datastore::{DatastoreError, Key, SharedDatastore};
use crate::ffs::types::{UserId, now_nanos};
use crate::lotus::Cid;

#[derive(Debug, Error)]
pub enum PinstoreError {
    #[error("cid {0} has non-staged pins")]
    NotOnlyStaged(Cid),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
    #[error("pinstore encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    pub user_id: UserId,
    pub staged: bool,
    /// Unix nanoseconds of the last (re)stage or upgrade.
    pub created_at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedCid {
    pub cid: Cid,
    pub pins: Vec<Pin>,
}

impl PinnedCid {
    pub fn only_staged(&self) -> bool {
        !self.pins.is_empty() && self.pins.iter().all(|p| p.staged)
    }
}

pub fn pins_key() -> Key {
    Key::new("/ffs/coreipfs/pinstore/pins")
}

pub struct Pinstore {
    ds: SharedDatastore,
    cache: Mutex<BTreeMap<Cid, PinnedCid>>,
}

impl Pinstore {
    pub async fn new(ds: SharedDatastore) -> Result<Self, PinstoreError> {
        let mut cache = BTreeMap::new();
        for entry in ds.query(&pins_key()).await? {
            let pinned: PinnedCid = serde_json::from_slice(&entry.value)?;
            cache.insert(pinned.cid.clone(), pinned);
        }
        Ok(Self {
            ds,
            cache: Mutex::new(cache),
        })
    }

    /// Registers a staged pin. A permanent pin of the same user wins; an
    /// existing staged pin gets its timestamp refreshed.
    pub async fn add_staged(&self, user: &UserId, cid: &Cid) -> Result<(), PinstoreError> {
        let mut cache = self.cache.lock().await;
        let mut pinned = cache.get(cid).cloned().unwrap_or_else(|| PinnedCid {
            cid: cid.clone(),
            pins: Vec::new(),
        });
        match pinned.pins.iter_mut().find(|p| &p.user_id == user) {
            Some(pin) if !pin.staged => return Ok(()),
            Some(pin) => pin.created_at = now_nanos(),
            None => pinned.pins.push(Pin {
                user_id: user.clone(),
                staged: true,
                created_at: now_nanos(),
            }),
        }
        self.persist(&mut cache, pinned).await
    }

    /// Registers a permanent pin, upgrading a staged one if present.
    pub async fn add(&self, user: &UserId, cid: &Cid) -> Result<(), PinstoreError> {
        let mut cache = self.cache.lock().await;
        let mut pinned = cache.get(cid).cloned().unwrap_or_else(|| PinnedCid {
            cid: cid.clone(),
            pins: Vec::new(),
        });
        match pinned.pins.iter_mut().find(|p| &p.user_id == user) {
            Some(pin) => {
                pin.staged = false;
                pin.created_at = now_nanos();
            }
            None => pinned.pins.push(Pin {
                user_id: user.clone(),
                staged: false,
                created_at: now_nanos(),
            }),
        }
        self.persist(&mut cache, pinned).await
    }

    /// Total pins and how many of them are staged.
    pub async fn ref_count(&self, cid: &Cid) -> (usize, usize) {
        let cache = self.cache.lock().await;
        cache
            .get(cid)
            .map(|p| (p.pins.len(), p.pins.iter().filter(|p| p.staged).count()))
            .unwrap_or((0, 0))
    }

    pub async fn is_pinned_by(&self, user: &UserId, cid: &Cid) -> bool {
        let cache = self.cache.lock().await;
        cache
            .get(cid)
            .is_some_and(|p| p.pins.iter().any(|pin| &pin.user_id == user))
    }

    pub async fn is_pinned(&self, cid: &Cid) -> bool {
        self.cache.lock().await.contains_key(cid)
    }

    /// Turns the user's pin back into a staged one so garbage collection
    /// can reclaim it once no job references the cid.
    pub async fn demote(&self, user: &UserId, cid: &Cid) -> Result<(), PinstoreError> {
        let mut cache = self.cache.lock().await;
        let Some(mut pinned) = cache.get(cid).cloned() else {
            return Ok(());
        };
        let Some(pin) = pinned.pins.iter_mut().find(|p| &p.user_id == user) else {
            return Ok(());
        };
        pin.staged = true;
        pin.created_at = now_nanos();
        self.persist(&mut cache, pinned).await
    }

    pub async fn remove(&self, user: &UserId, cid: &Cid) -> Result<(), PinstoreError> {
        let mut cache = self.cache.lock().await;
        let Some(mut pinned) = cache.get(cid).cloned() else {
            return Ok(());
        };
        let before = pinned.pins.len();
        pinned.pins.retain(|p| &p.user_id != user);
        if pinned.pins.len() == before {
            return Ok(());
        }
        self.persist(&mut cache, pinned).await
    }

    /// Drops a cid whose pins are all staged.
    pub async fn remove_staged(&self, cid: &Cid) -> Result<(), PinstoreError> {
        let mut cache = self.cache.lock().await;
        let Some(pinned) = cache.get(cid).cloned() else {
            return Ok(());
        };
        if !pinned.only_staged() {
            return Err(PinstoreError::NotOnlyStaged(cid.clone()));
        }
        self.persist(
            &mut cache,
            PinnedCid {
                cid: cid.clone(),
                pins: Vec::new(),
            },
        )
        .await
    }

    pub async fn get_all(&self) -> Vec<PinnedCid> {
        self.cache.lock().await.values().cloned().collect()
    }

    pub async fn get_all_only_staged(&self) -> Vec<PinnedCid> {
        self.cache
            .lock()
            .await
            .values()
            .filter(|p| p.only_staged())
            .cloned()
            .collect()
    }

    async fn persist(
        &self,
        cache: &mut BTreeMap<Cid, PinnedCid>,
        pinned: PinnedCid,
    ) -> Result<(), PinstoreError> {
        let key = pins_key().child(pinned.cid.as_str());
        if pinned.pins.is_empty() {
            self.ds.delete(&key).await?;
            cache.remove(&pinned.cid);
            return Ok(());
        }
        self.ds.put(&key, serde_json::to_vec(&pinned)?).await?;
        cache.insert(pinned.cid.clone(), pinned);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::datastore::MemoryDatastore;

    fn cid() -> Cid {
        Cid::from("bafypinned")
    }

    #[tokio::test]
    async fn staged_pins_upgrade_and_persist() {
        let ds: SharedDatastore = Arc::new(MemoryDatastore::new());
        let store = Pinstore::new(ds.clone()).await.unwrap();
        let (u1, u2) = (UserId::from("u1"), UserId::from("u2"));

        store.add_staged(&u1, &cid()).await.unwrap();
        store.add_staged(&u2, &cid()).await.unwrap();
        assert_eq!(store.ref_count(&cid()).await, (2, 2));
        assert_eq!(store.get_all_only_staged().await.len(), 1);

        store.add(&u1, &cid()).await.unwrap();
        assert_eq!(store.ref_count(&cid()).await, (2, 1));
        store.add_staged(&u1, &cid()).await.unwrap();
        assert_eq!(store.ref_count(&cid()).await, (2, 1));
        assert!(store.get_all_only_staged().await.is_empty());

        let reopened = Pinstore::new(ds).await.unwrap();
        assert_eq!(reopened.get_all().await, store.get_all().await);
        assert!(reopened.is_pinned_by(&u2, &cid()).await);
    }

    #[tokio::test]
    async fn removing_last_pin_deletes_entry() {
        let ds: SharedDatastore = Arc::new(MemoryDatastore::new());
        let store = Pinstore::new(ds.clone()).await.unwrap();
        let u1 = UserId::from("u1");
        store.add(&u1, &cid()).await.unwrap();
        assert!(matches!(
            store.remove_staged(&cid()).await,
            Err(PinstoreError::NotOnlyStaged(_))
        ));
        store.remove(&u1, &cid()).await.unwrap();
        assert!(!store.is_pinned(&cid()).await);
        assert!(ds.query(&pins_key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn demoted_pin_becomes_collectable() {
        let store = Pinstore::new(Arc::new(MemoryDatastore::new())).await.unwrap();
        let u1 = UserId::from("u1");
        store.add(&u1, &cid()).await.unwrap();
        assert!(store.get_all_only_staged().await.is_empty());

        store.demote(&u1, &cid()).await.unwrap();
        assert_eq!(store.ref_count(&cid()).await, (1, 1));
        assert_eq!(store.get_all_only_staged().await.len(), 1);
        store.demote(&UserId::from("u2"), &cid()).await.unwrap();
        assert_eq!(store.ref_count(&cid()).await, (1, 1));
    }

    #[tokio::test]
    async fn remove_staged_clears_all_staged_holders() {
        let store = Pinstore::new(Arc::new(MemoryDatastore::new())).await.unwrap();
        store.add_staged(&UserId::from("u1"), &cid()).await.unwrap();
        store.add_staged(&UserId::from("u2"), &cid()).await.unwrap();
        store.remove_staged(&cid()).await.unwrap();
        assert_eq!(store.ref_count(&cid()).await, (0, 0));
    }
}
