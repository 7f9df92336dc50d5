//! # Datastore migrations
//!
//! Versioned upgrades of the data kept in the datastore. The current version
//! lives under `/version` as `{"version": n}`. On startup [`Migrator::ensure`]
//! runs every registered migration between the current and the target
//! version, persisting the new version after each one. An empty datastore is
//! stamped with the target version directly.
//!
//! Migrations flagged with [`DatastoreMigration::use_txn`] buffer their writes
//! and commit them together with the version bump; the others write through.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::datastore::{Entry, Key, SharedDatastore, Txn};
use crate::error::{Error, Result};

mod v1_multitenancy;
mod v2_deal_ids;
mod v3_job_indices;
mod v4_records;
mod v5_miner_chainstore;

pub fn version_key() -> Key {
    Key::new("/version")
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredVersion {
    version: u64,
}

/// Read/write access handed to a migration.
pub struct MigrationStore {
    ds: SharedDatastore,
    txn: Option<Txn>,
}

impl MigrationStore {
    fn new(ds: SharedDatastore, use_txn: bool) -> Self {
        let txn = use_txn.then(|| Txn::new(ds.clone(), false));
        Self { ds, txn }
    }

    pub async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        Ok(match &self.txn {
            Some(txn) => txn.get(key).await?,
            None => self.ds.get(key).await?,
        })
    }

    pub async fn has(&self, key: &Key) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn query(&self, prefix: &Key) -> Result<Vec<Entry>> {
        Ok(match &self.txn {
            Some(txn) => txn.query(prefix).await?,
            None => self.ds.query(prefix).await?,
        })
    }

    pub async fn put(&mut self, key: Key, value: Vec<u8>) -> Result<()> {
        match &mut self.txn {
            Some(txn) => txn.put(key, value)?,
            None => self.ds.put(&key, value).await?,
        }
        Ok(())
    }

    pub async fn delete(&mut self, key: Key) -> Result<()> {
        match &mut self.txn {
            Some(txn) => txn.delete(key)?,
            None => self.ds.delete(&key).await?,
        }
        Ok(())
    }

    async fn finish(self) -> Result<()> {
        if let Some(txn) = self.txn {
            txn.commit().await?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait DatastoreMigration: Send + Sync {
    fn version(&self) -> u64;

    fn use_txn(&self) -> bool {
        false
    }

    async fn up(&self, store: &mut MigrationStore) -> Result<()>;
}

/// Every known migration, in version order.
pub fn migrations() -> Vec<Box<dyn DatastoreMigration>> {
    vec![
        Box::new(v1_multitenancy::Migration),
        Box::new(v2_deal_ids::Migration),
        Box::new(v3_job_indices::Migration),
        Box::new(v4_records::Migration),
        Box::new(v5_miner_chainstore::Migration),
    ]
}

pub struct Migrator {
    ds: SharedDatastore,
    migrations: BTreeMap<u64, Box<dyn DatastoreMigration>>,
}

impl Migrator {
    pub fn new(ds: SharedDatastore) -> Self {
        Self::with_migrations(ds, migrations())
    }

    pub fn with_migrations(ds: SharedDatastore, migrations: Vec<Box<dyn DatastoreMigration>>) -> Self {
        Self {
            ds,
            migrations: migrations.into_iter().map(|m| (m.version(), m)).collect(),
        }
    }

    pub fn target_version(&self) -> u64 {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    /// Persisted version, or `None` for an empty datastore.
    pub async fn current_version(&self) -> Result<Option<u64>> {
        if let Some(raw) = self.ds.get(&version_key()).await? {
            let stored: StoredVersion = serde_json::from_slice(&raw)?;
            return Ok(Some(stored.version));
        }
        if self.ds.query(&Key::root()).await?.is_empty() {
            return Ok(None);
        }
        Ok(Some(0))
    }

    /// Brings the datastore to the target version.
    pub async fn ensure(&self) -> Result<u64> {
        self.ensure_version(self.target_version()).await
    }

    #[instrument(skip(self))]
    pub async fn ensure_version(&self, target: u64) -> Result<u64> {
        let Some(current) = self.current_version().await? else {
            self.ds.put(&version_key(), encode_version(target)?).await?;
            info!(version = target, "Empty datastore stamped with target version");
            return Ok(target);
        };
        info!(current, target, "Checking datastore version");
        if current > target {
            return Err(Error::Migration(format!(
                "migrations are forward only, current version {current}, target version {target}"
            )));
        }

        for version in current + 1..=target {
            let migration = self
                .migrations
                .get(&version)
                .ok_or_else(|| Error::Migration(format!("migration {version} isn't registered")))?;
            info!(version, "Running datastore migration...");
            let mut store = MigrationStore::new(self.ds.clone(), migration.use_txn());
            migration
                .up(&mut store)
                .await
                .map_err(|err| Error::Migration(format!("running migration {version}: {err}")))?;
            store.put(version_key(), encode_version(version)?).await?;
            store.finish().await?;
            info!(version, "Datastore migration ran successfully");
        }
        Ok(target)
    }
}

fn encode_version(version: u64) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&StoredVersion { version })?)
}
