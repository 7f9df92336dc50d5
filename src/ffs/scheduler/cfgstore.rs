//! Declared storage config of each `(user, cid)`, kept under
//! `/ffs/manager/api/<uid>/istore/cidstorageconfig/<cid>`.

use crate::datastore::{Key, SharedDatastore};
use crate::error::Result;
use crate::ffs::types::{StorageConfig, UserId};
use crate::lotus::Cid;

pub fn user_key(user: &UserId) -> Key {
    Key::new("/ffs/manager/api").child(user.as_str())
}

pub fn configs_key(user: &UserId) -> Key {
    user_key(user).child("istore/cidstorageconfig")
}

fn config_key(user: &UserId, cid: &Cid) -> Key {
    configs_key(user).child(cid.as_str())
}

pub struct ConfigStore {
    ds: SharedDatastore,
}

impl ConfigStore {
    pub fn new(ds: SharedDatastore) -> Self {
        Self { ds }
    }

    pub async fn put(&self, user: &UserId, cid: &Cid, cfg: &StorageConfig) -> Result<()> {
        self.ds
            .put(&config_key(user, cid), serde_json::to_vec(cfg)?)
            .await?;
        Ok(())
    }

    pub async fn get(&self, user: &UserId, cid: &Cid) -> Result<Option<StorageConfig>> {
        match self.ds.get(&config_key(user, cid)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, user: &UserId, cid: &Cid) -> Result<()> {
        self.ds.delete(&config_key(user, cid)).await?;
        Ok(())
    }

    /// Cids with a declared config for the user.
    pub async fn cids(&self, user: &UserId) -> Result<Vec<Cid>> {
        Ok(self
            .ds
            .query(&configs_key(user))
            .await?
            .into_iter()
            .map(|e| Cid::from(e.key.name()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::datastore::MemoryDatastore;

    #[tokio::test]
    async fn configs_roundtrip_per_user() {
        let store = ConfigStore::new(Arc::new(MemoryDatastore::new()));
        let (user, cid) = (UserId::from("u1"), Cid::from("bafycfg"));
        let cfg = StorageConfig::default().with_rep_factor(2);

        assert!(store.get(&user, &cid).await.unwrap().is_none());
        store.put(&user, &cid, &cfg).await.unwrap();
        assert_eq!(store.get(&user, &cid).await.unwrap(), Some(cfg));
        assert_eq!(store.cids(&user).await.unwrap(), vec![cid.clone()]);
        assert!(store.cids(&UserId::from("u2")).await.unwrap().is_empty());

        store.delete(&user, &cid).await.unwrap();
        assert!(store.get(&user, &cid).await.unwrap().is_none());
    }
}
