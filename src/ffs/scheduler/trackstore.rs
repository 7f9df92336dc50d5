//! Storage configs that need periodic repair or renewal evaluation, kept
//! per cid under `/ffs/scheduler/tstore/<cid>` as `[{user_id, storage_config}]`.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::datastore::{Key, SharedDatastore};
use crate::error::Result;
use crate::ffs::types::{StorageConfig, UserId};
use crate::lotus::Cid;

pub fn base_key() -> Key {
    Key::new("/ffs/scheduler/tstore")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedConfig {
    pub user_id: UserId,
    pub storage_config: StorageConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedCid {
    pub cid: Cid,
    pub tracked: Vec<TrackedConfig>,
}

pub struct TrackStore {
    ds: SharedDatastore,
    write: Mutex<()>,
}

impl TrackStore {
    pub fn new(ds: SharedDatastore) -> Self {
        Self {
            ds,
            write: Mutex::new(()),
        }
    }

    async fn load(&self, cid: &Cid) -> Result<Vec<TrackedConfig>> {
        match self.ds.get(&base_key().child(cid.as_str())).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, cid: &Cid, tracked: &[TrackedConfig]) -> Result<()> {
        let key = base_key().child(cid.as_str());
        if tracked.is_empty() {
            self.ds.delete(&key).await?;
        } else {
            self.ds.put(&key, serde_json::to_vec(tracked)?).await?;
        }
        Ok(())
    }

    /// Tracks the user's config when it's repairable or renewable, and
    /// untracks it otherwise.
    pub async fn put(&self, user: &UserId, cid: &Cid, cfg: &StorageConfig) -> Result<()> {
        let _guard = self.write.lock().await;
        let mut tracked = self.load(cid).await?;
        tracked.retain(|t| &t.user_id != user);
        if cfg.needs_tracking() {
            tracked.push(TrackedConfig {
                user_id: user.clone(),
                storage_config: cfg.clone(),
            });
        }
        self.save(cid, &tracked).await
    }

    pub async fn remove(&self, user: &UserId, cid: &Cid) -> Result<()> {
        let _guard = self.write.lock().await;
        let mut tracked = self.load(cid).await?;
        tracked.retain(|t| &t.user_id != user);
        self.save(cid, &tracked).await
    }

    pub async fn get(&self, cid: &Cid) -> Result<Vec<TrackedConfig>> {
        self.load(cid).await
    }

    pub async fn get_all(&self) -> Result<Vec<TrackedCid>> {
        let mut all = Vec::new();
        for entry in self.ds.query(&base_key()).await? {
            all.push(TrackedCid {
                cid: Cid::from(entry.key.name()),
                tracked: serde_json::from_slice(&entry.value)?,
            });
        }
        Ok(all)
    }
}
