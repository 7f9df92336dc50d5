//! # Deal records
//!
//! Durable history of storage and retrieval deals made by the daemon.
//!
//! - `/deals/storage-pending/<proposalCid>`: proposed, not yet terminal
//! - `/deals/storage-final/<proposalCid>`: terminal storage deals
//! - `/deals/retrieval/<id>`: completed retrievals
//! - `/deals/updatedatidx/{storage|retrieval}/<nanos>`: change index
//!
//! The change index is advisory: timestamps colliding on the same
//! nanosecond are bumped by one, which isn't stable across restarts.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::datastore::{Key, SharedDatastore, Txn};
use crate::error::Result;
use crate::ffs::types::{RetrievalId, now_nanos};
use crate::lotus::{Cid, DealInfo};

pub fn storage_pending_key() -> Key {
    Key::new("/deals/storage-pending")
}

pub fn storage_final_key() -> Key {
    Key::new("/deals/storage-final")
}

pub fn retrieval_key() -> Key {
    Key::new("/deals/retrieval")
}

pub fn updated_at_key(kind: RecordKind) -> Key {
    Key::new("/deals/updatedatidx").child(kind.as_str())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Storage,
    Retrieval,
}

impl RecordKind {
    fn as_str(self) -> &'static str {
        match self {
            RecordKind::Storage => "storage",
            RecordKind::Retrieval => "retrieval",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDealRecord {
    pub root_cid: Cid,
    /// Wallet address that paid for the deal.
    pub addr: String,
    pub date_nanos: i64,
    pub pending: bool,
    pub deal_info: DealInfo,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalDealInfo {
    pub root_cid: Cid,
    pub size: u64,
    pub min_price: u64,
    pub miner: String,
    pub miner_peer_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalDealRecord {
    #[serde(default)]
    pub id: String,
    pub addr: String,
    pub date_nanos: i64,
    pub deal_info: RetrievalDealInfo,
    #[serde(default)]
    pub error_msg: String,
    #[serde(default)]
    pub updated_at: i64,
}

impl RetrievalDealRecord {
    pub fn compute_id(&self) -> String {
        RetrievalId::from_parts(
            self.date_nanos,
            &self.addr,
            &self.deal_info.miner,
            &self.deal_info.root_cid,
        )
        .to_string()
    }
}

pub struct DealRecordStore {
    ds: SharedDatastore,
    write: Mutex<()>,
}

impl DealRecordStore {
    pub fn new(ds: SharedDatastore) -> Self {
        Self {
            ds,
            write: Mutex::new(()),
        }
    }

    /// Finds a free slot in the updated-at index starting at `now`.
    pub async fn reserve_updated_at(txn: &Txn, kind: RecordKind, now: i64) -> Result<(i64, Key)> {
        let base = updated_at_key(kind);
        let mut ts = now;
        loop {
            let key = base.child(ts.to_string());
            if !txn.has(&key).await? {
                return Ok((ts, key));
            }
            ts += 1;
        }
    }

    pub async fn put_pending_storage(&self, mut record: StorageDealRecord) -> Result<()> {
        record.pending = true;
        let _guard = self.write.lock().await;
        let mut txn = Txn::new(self.ds.clone(), false);
        let (ts, idx) = Self::reserve_updated_at(&txn, RecordKind::Storage, now_nanos()).await?;
        record.updated_at = ts;
        let id = record.deal_info.proposal_cid.to_string();
        txn.put(storage_pending_key().child(&id), serde_json::to_vec(&record)?)?;
        txn.put(idx, id.into_bytes())?;
        txn.commit().await?;
        Ok(())
    }

    /// Moves a storage record from pending to final.
    pub async fn put_final_storage(&self, mut record: StorageDealRecord) -> Result<()> {
        record.pending = false;
        let _guard = self.write.lock().await;
        let mut txn = Txn::new(self.ds.clone(), false);
        let (ts, idx) = Self::reserve_updated_at(&txn, RecordKind::Storage, now_nanos()).await?;
        record.updated_at = ts;
        let id = record.deal_info.proposal_cid.to_string();
        txn.delete(storage_pending_key().child(&id))?;
        txn.put(storage_final_key().child(&id), serde_json::to_vec(&record)?)?;
        txn.put(idx, id.into_bytes())?;
        txn.commit().await?;
        debug!(proposal = %record.deal_info.proposal_cid, "Recorded final storage deal");
        Ok(())
    }

    pub async fn put_retrieval(&self, mut record: RetrievalDealRecord) -> Result<String> {
        record.id = record.compute_id();
        let _guard = self.write.lock().await;
        let mut txn = Txn::new(self.ds.clone(), false);
        let (ts, idx) = Self::reserve_updated_at(&txn, RecordKind::Retrieval, now_nanos()).await?;
        record.updated_at = ts;
        txn.put(retrieval_key().child(&record.id), serde_json::to_vec(&record)?)?;
        txn.put(idx, record.id.clone().into_bytes())?;
        txn.commit().await?;
        Ok(record.id)
    }

    pub async fn pending_storage(&self) -> Result<Vec<StorageDealRecord>> {
        self.query(&storage_pending_key()).await
    }

    pub async fn final_storage(&self) -> Result<Vec<StorageDealRecord>> {
        self.query(&storage_final_key()).await
    }

    pub async fn retrievals(&self) -> Result<Vec<RetrievalDealRecord>> {
        self.query(&retrieval_key()).await
    }

    pub async fn storage_by_proposal(&self, proposal: &Cid) -> Result<Option<StorageDealRecord>> {
        for base in [storage_final_key(), storage_pending_key()] {
            if let Some(raw) = self.ds.get(&base.child(proposal.as_str())).await? {
                return Ok(Some(serde_json::from_slice(&raw)?));
            }
        }
        Ok(None)
    }

    /// Record ids changed strictly after `since` (unix nanos), oldest first.
    pub async fn updated_since(&self, kind: RecordKind, since: i64) -> Result<Vec<String>> {
        let mut changed: Vec<(i64, String)> = self
            .ds
            .query(&updated_at_key(kind))
            .await?
            .into_iter()
            .filter_map(|entry| {
                let ts: i64 = entry.key.name().parse().ok()?;
                (ts > since).then(|| (ts, String::from_utf8_lossy(&entry.value).into_owned()))
            })
            .collect();
        changed.sort();
        Ok(changed.into_iter().map(|(_, id)| id).collect())
    }

    async fn query<T: serde::de::DeserializeOwned>(&self, prefix: &Key) -> Result<Vec<T>> {
        self.ds
            .query(prefix)
            .await?
            .into_iter()
            .map(|entry| serde_json::from_slice(&entry.value).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::datastore::MemoryDatastore;

    fn record(proposal: &str) -> StorageDealRecord {
        StorageDealRecord {
            root_cid: Cid::from("bafyroot"),
            addr: "f3wallet".into(),
            date_nanos: 1,
            pending: false,
            deal_info: DealInfo {
                proposal_cid: Cid::from(proposal),
                deal_id: 42,
                ..DealInfo::default()
            },
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn storage_records_move_from_pending_to_final() {
        let store = DealRecordStore::new(Arc::new(MemoryDatastore::new()));
        store.put_pending_storage(record("bafyprop")).await.unwrap();
        assert_eq!(store.pending_storage().await.unwrap().len(), 1);

        store.put_final_storage(record("bafyprop")).await.unwrap();
        assert!(store.pending_storage().await.unwrap().is_empty());
        let finals = store.final_storage().await.unwrap();
        assert_eq!(finals.len(), 1);
        assert!(!finals[0].pending);
        assert_eq!(
            store
                .storage_by_proposal(&Cid::from("bafyprop"))
                .await
                .unwrap()
                .map(|r| r.deal_info.deal_id),
            Some(42)
        );
    }

    #[tokio::test]
    async fn updated_at_index_bumps_collisions() {
        let ds: SharedDatastore = Arc::new(MemoryDatastore::new());
        let mut txn = Txn::new(ds.clone(), false);
        let (first, key) = DealRecordStore::reserve_updated_at(&txn, RecordKind::Retrieval, 100)
            .await
            .unwrap();
        txn.put(key, b"a".to_vec()).unwrap();
        let (second, _) = DealRecordStore::reserve_updated_at(&txn, RecordKind::Retrieval, 100)
            .await
            .unwrap();
        assert_eq!((first, second), (100, 101));
    }

    #[tokio::test]
    async fn retrieval_ids_are_derived_from_parameters() {
        let store = DealRecordStore::new(Arc::new(MemoryDatastore::new()));
        let rec = RetrievalDealRecord {
            addr: "f3wallet".into(),
            date_nanos: 7,
            deal_info: RetrievalDealInfo {
                root_cid: Cid::from("bafyroot"),
                miner: "f01".into(),
                ..RetrievalDealInfo::default()
            },
            ..RetrievalDealRecord::default()
        };
        let id = store.put_retrieval(rec.clone()).await.unwrap();
        assert_eq!(id, rec.compute_id());
        assert_eq!(
            store.updated_since(RecordKind::Retrieval, 0).await.unwrap(),
            vec![id]
        );
    }
}
