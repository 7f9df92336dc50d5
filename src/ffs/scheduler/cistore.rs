//! Last-known placement of each `(user, cid)` under
//! `/ffs/scheduler/cistore_v2/<uid>/<cid>`.

use crate::datastore::{Key, SharedDatastore};
use crate::error::Result;
use crate::ffs::types::{StorageInfo, UserId};
use crate::lotus::Cid;

pub fn base_key() -> Key {
    Key::new("/ffs/scheduler/cistore_v2")
}

fn info_key(user: &UserId, cid: &Cid) -> Key {
    base_key().child(user.as_str()).child(cid.as_str())
}

pub struct CiStore {
    ds: SharedDatastore,
}

impl CiStore {
    pub fn new(ds: SharedDatastore) -> Self {
        Self { ds }
    }

    pub async fn put(&self, info: &StorageInfo) -> Result<()> {
        self.ds
            .put(&info_key(&info.user_id, &info.cid), serde_json::to_vec(info)?)
            .await?;
        Ok(())
    }

    pub async fn get(&self, user: &UserId, cid: &Cid) -> Result<Option<StorageInfo>> {
        match self.ds.get(&info_key(user, cid)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, user: &UserId, cid: &Cid) -> Result<()> {
        self.ds.delete(&info_key(user, cid)).await?;
        Ok(())
    }

    /// Every placement known for the user, ordered by cid.
    pub async fn list(&self, user: &UserId) -> Result<Vec<StorageInfo>> {
        self.ds
            .query(&base_key().child(user.as_str()))
            .await?
            .into_iter()
            .map(|e| Ok(serde_json::from_slice(&e.value)?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::datastore::MemoryDatastore;

    #[tokio::test]
    async fn info_is_scoped_per_user() {
        let store = CiStore::new(Arc::new(MemoryDatastore::new()));
        let info = StorageInfo {
            user_id: UserId::from("u1"),
            cid: Cid::from("bafyinfo"),
            ..StorageInfo::default()
        };
        store.put(&info).await.unwrap();

        assert_eq!(
            store.get(&UserId::from("u1"), &info.cid).await.unwrap(),
            Some(info.clone())
        );
        assert_eq!(store.get(&UserId::from("u2"), &info.cid).await.unwrap(), None);
        assert_eq!(store.list(&UserId::from("u1")).await.unwrap(), vec![info.clone()]);

        store.delete(&info.user_id, &info.cid).await.unwrap();
        assert!(store.list(&UserId::from("u1")).await.unwrap().is_empty());
    }
}
