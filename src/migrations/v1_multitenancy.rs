//! v1: partitions per-cid data by user.
//!
//! Before v1 job logs, storage info, tracked configs and started deals were
//! keyed by cid alone. Owners of a cid are the users with a declared storage
//! config for it. Pins of owners with hot storage enabled are written to the
//! pinstore, which didn't exist before.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{DatastoreMigration, MigrationStore};
use crate::datastore::Key;
use crate::error::{Error, Result};
use crate::ffs::coreipfs::pinstore::{Pin, PinnedCid, pins_key};
use crate::ffs::scheduler::cistore;
use crate::ffs::scheduler::sjstore::{self, started_deals_key};
use crate::ffs::scheduler::trackstore::{self, TrackedConfig};
use crate::ffs::types::{JobStatus, StorageConfig, StorageJob, UserId};
use crate::lotus::Cid;

type Owners = BTreeMap<Cid, Vec<(UserId, StorageConfig)>>;

pub struct Migration;

#[async_trait]
impl DatastoreMigration for Migration {
    fn version(&self) -> u64 {
        1
    }

    async fn up(&self, store: &mut MigrationStore) -> Result<()> {
        let owners = cid_owners(store).await?;
        info!(cids = owners.len(), "Discovered cid owners");

        migrate_job_logger(store, &owners).await?;
        migrate_storage_info(store, &owners).await?;
        migrate_trackstore(store, &owners).await?;
        fill_pinstore(store, &owners).await?;
        migrate_started_deals(store).await?;
        Ok(())
    }
}

/// Declared configs grouped by cid, from `/ffs/manager/api/<uid>/istore/cidstorageconfig/<cid>`.
async fn cid_owners(store: &MigrationStore) -> Result<Owners> {
    let base = Key::new("/ffs/manager/api");
    let mut owners = Owners::new();
    for entry in store.query(&base).await? {
        let Some(rel) = entry.key.strip_prefix(&base) else {
            continue;
        };
        let segments = rel.segments();
        let [user, "istore", "cidstorageconfig", cid] = segments.as_slice() else {
            continue;
        };
        let cfg: StorageConfig = serde_json::from_slice(&entry.value)?;
        owners
            .entry(Cid::from(*cid))
            .or_default()
            .push((UserId::from(*user), cfg));
    }
    Ok(owners)
}

/// `/ffs/joblogger/<cid>/<ts>` → `/ffs/joblogger/<uid>/<cid>/<ts>` per owner.
async fn migrate_job_logger(store: &mut MigrationStore, owners: &Owners) -> Result<()> {
    let base = Key::new("/ffs/joblogger");
    let mut moved = 0;
    for entry in store.query(&base).await? {
        let Some(rel) = entry.key.strip_prefix(&base) else {
            continue;
        };
        let segments = rel.segments();
        let [cid, ts] = segments.as_slice() else {
            continue;
        };
        let cid = Cid::from(*cid);
        for (user, _) in owners.get(&cid).map(Vec::as_slice).unwrap_or_default() {
            let key = base.child(user.as_str()).child(cid.as_str()).child(*ts);
            store.put(key, entry.value.clone()).await?;
        }
        store.delete(entry.key.clone()).await?;
        moved += 1;
    }
    info!(entries = moved, "Job logger partitioned by user");
    Ok(())
}

/// `/ffs/scheduler/cistore/<cid>` → `/ffs/scheduler/cistore_v2/<uid>/<cid>`.
async fn migrate_storage_info(store: &mut MigrationStore, owners: &Owners) -> Result<()> {
    let base = Key::new("/ffs/scheduler/cistore");
    for entry in store.query(&base).await? {
        let Some(rel) = entry.key.strip_prefix(&base) else {
            continue;
        };
        let segments = rel.segments();
        let [cid] = segments.as_slice() else {
            continue;
        };
        let cid = Cid::from(*cid);
        let mut info: Value = serde_json::from_slice(&entry.value)?;
        for (user, _) in owners.get(&cid).map(Vec::as_slice).unwrap_or_default() {
            let Some(fields) = info.as_object_mut() else {
                return Err(Error::Migration(format!("storage info of {cid} isn't an object")));
            };
            fields.insert("user_id".to_string(), Value::String(user.to_string()));
            let key = cistore::base_key().child(user.as_str()).child(cid.as_str());
            store.put(key, serde_json::to_vec(&info)?).await?;
        }
        store.delete(entry.key.clone()).await?;
    }
    Ok(())
}

/// Rebuilds `/ffs/scheduler/tstore/<cid>` as per-user entries.
async fn migrate_trackstore(store: &mut MigrationStore, owners: &Owners) -> Result<()> {
    for entry in store.query(&trackstore::base_key()).await? {
        let cid = Cid::from(entry.key.name());
        let tracked: Vec<TrackedConfig> = owners
            .get(&cid)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter(|(_, cfg)| cfg.needs_tracking())
            .map(|(user, cfg)| TrackedConfig {
                user_id: user.clone(),
                storage_config: cfg.clone(),
            })
            .collect();
        if tracked.is_empty() {
            store.delete(entry.key.clone()).await?;
        } else {
            store.put(entry.key.clone(), serde_json::to_vec(&tracked)?).await?;
        }
    }
    Ok(())
}

/// One permanent pin per owner with hot storage enabled.
async fn fill_pinstore(store: &mut MigrationStore, owners: &Owners) -> Result<()> {
    for (cid, configs) in owners {
        let pins: Vec<Pin> = configs
            .iter()
            .filter(|(_, cfg)| cfg.hot.enabled)
            .map(|(user, _)| Pin {
                user_id: user.clone(),
                staged: false,
                created_at: 0,
            })
            .collect();
        if pins.is_empty() {
            continue;
        }
        let pinned = PinnedCid {
            cid: cid.clone(),
            pins,
        };
        store
            .put(pins_key().child(cid.as_str()), serde_json::to_vec(&pinned)?)
            .await?;
    }
    Ok(())
}

/// `/sjstore/starteddeals/<cid>` → `/sjstore/starteddeals_v2/<uid>/<cid>`,
/// owned by the user of the executing job of the cid.
async fn migrate_started_deals(store: &mut MigrationStore) -> Result<()> {
    let mut executing = BTreeMap::new();
    for entry in store.query(&sjstore::job_key()).await? {
        let job: StorageJob = serde_json::from_slice(&entry.value)?;
        if job.status == JobStatus::Executing {
            executing.insert(job.cid, job.user_id);
        }
    }

    let base = Key::new("/sjstore/starteddeals");
    for entry in store.query(&base).await? {
        let Some(rel) = entry.key.strip_prefix(&base) else {
            continue;
        };
        let segments = rel.segments();
        let [cid] = segments.as_slice() else {
            continue;
        };
        let cid = Cid::from(*cid);
        match executing.get(&cid) {
            Some(user) => {
                let key = started_deals_key().child(user.as_str()).child(cid.as_str());
                store.put(key, entry.value.clone()).await?;
            }
            None => warn!(cid = %cid, "Dropping started deals without an executing job"),
        }
        store.delete(entry.key.clone()).await?;
    }
    Ok(())
}
