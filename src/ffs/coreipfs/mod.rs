//! # IPFS hot storage
//!
//! [`CoreIpfs`] implements [`HotStorage`] on top of an IPFS node. Every
//! reference-count change goes through the [`Pinstore`], and the node only
//! sees a `pin/add` when a cid gains its first holder and a `pin/rm` when
//! the last holder goes away.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::interfaces::HotStorage;
use super::types::UserId;
use crate::error::{Error, Result};
use crate::lotus::Cid;

pub mod client;
pub mod pinstore;

pub use client::{IpfsApi, IpfsHttpClient, SharedIpfs};
pub use pinstore::{Pin, PinnedCid, Pinstore, PinstoreError};

#[derive(Debug, Error)]
pub enum IpfsError {
    #[error("invalid ipfs api url: {0}")]
    InvalidUrl(String),
    #[error("ipfs {command} failed: {message}")]
    Api { command: String, message: String },
    #[error("ipfs transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cid {0} isn't pinned by the user")]
    NotPinned(Cid),
    #[error(transparent)]
    Pinstore(#[from] PinstoreError),
}

pub struct CoreIpfs {
    ipfs: SharedIpfs,
    pinstore: Pinstore,
    // Held from the ref-count decision until the pinstore write, so the
    // node's pin set never drifts from the recorded holders.
    ops: Mutex<()>,
}

impl CoreIpfs {
    pub fn new(ipfs: SharedIpfs, pinstore: Pinstore) -> Self {
        Self {
            ipfs,
            pinstore,
            ops: Mutex::new(()),
        }
    }

    pub fn pinstore(&self) -> &Pinstore {
        &self.pinstore
    }

    async fn ensure_node_pin(&self, cid: &Cid) -> Result<(), IpfsError> {
        if !self.pinstore.is_pinned(cid).await {
            self.ipfs.pin_add(cid).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl HotStorage for CoreIpfs {
    #[instrument(skip_all, fields(user_id = %user))]
    async fn stage(&self, user: &UserId, data: Vec<u8>) -> Result<Cid> {
        let cid = self.ipfs.add(data).await?;
        let _ops = self.ops.lock().await;
        self.ensure_node_pin(&cid).await?;
        self.pinstore
            .add_staged(user, &cid)
            .await
            .map_err(IpfsError::from)?;
        debug!(cid = %cid, "Staged data");
        Ok(cid)
    }

    async fn stage_cid(&self, user: &UserId, cid: &Cid) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.ensure_node_pin(cid).await?;
        self.pinstore
            .add_staged(user, cid)
            .await
            .map_err(IpfsError::from)?;
        Ok(())
    }

    #[instrument(skip_all, fields(user_id = %user, cid = %cid))]
    async fn pin(&self, user: &UserId, cid: &Cid) -> Result<u64> {
        let _ops = self.ops.lock().await;
        self.ensure_node_pin(cid).await?;
        let size = self.ipfs.dag_size(cid).await?;
        self.pinstore.add(user, cid).await.map_err(IpfsError::from)?;
        Ok(size)
    }

    #[instrument(skip_all, fields(user_id = %user, cid = %cid, referenced = referenced))]
    async fn unpin(&self, user: &UserId, cid: &Cid, referenced: bool) -> Result<()> {
        let _ops = self.ops.lock().await;
        if !self.pinstore.is_pinned_by(user, cid).await {
            return Err(IpfsError::NotPinned(cid.clone()).into());
        }
        let (total, _) = self.pinstore.ref_count(cid).await;
        if total == 1 && referenced {
            debug!("Cid still referenced by a job, demoting pin to staged");
            self.pinstore
                .demote(user, cid)
                .await
                .map_err(IpfsError::from)?;
            return Ok(());
        }
        if total == 1 {
            self.ipfs.pin_rm(cid).await?;
        }
        self.pinstore
            .remove(user, cid)
            .await
            .map_err(IpfsError::from)?;
        Ok(())
    }

    async fn replace(&self, user: &UserId, from: &Cid, to: &Cid) -> Result<u64> {
        let _ops = self.ops.lock().await;
        if !self.pinstore.is_pinned_by(user, from).await {
            return Err(IpfsError::NotPinned(from.clone()).into());
        }
        let (from_total, _) = self.pinstore.ref_count(from).await;
        let to_pinned = self.pinstore.is_pinned(to).await;
        match (from_total == 1, to_pinned) {
            (true, false) => self.ipfs.pin_update(from, to).await?,
            (true, true) => self.ipfs.pin_rm(from).await?,
            (false, false) => self.ipfs.pin_add(to).await?,
            (false, true) => {}
        }
        let size = self.ipfs.dag_size(to).await?;
        self.pinstore
            .remove(user, from)
            .await
            .map_err(IpfsError::from)?;
        self.pinstore.add(user, to).await.map_err(IpfsError::from)?;
        Ok(size)
    }

    async fn is_pinned(&self, user: &UserId, cid: &Cid) -> Result<bool> {
        Ok(self.pinstore.is_pinned_by(user, cid).await)
    }

    #[instrument(skip_all)]
    async fn gc_staged(&self, exclude: &[Cid], older_than: DateTime<Utc>) -> Result<Vec<Cid>> {
        let exclude: HashSet<&Cid> = exclude.iter().collect();
        let threshold = older_than.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let _ops = self.ops.lock().await;
        let mut unpinned = Vec::new();
        for pinned in self.pinstore.get_all_only_staged().await {
            if exclude.contains(&pinned.cid) {
                continue;
            }
            let newest = pinned.pins.iter().map(|p| p.created_at).max().unwrap_or_default();
            if newest >= threshold {
                continue;
            }
            self.ipfs.pin_rm(&pinned.cid).await?;
            self.pinstore
                .remove_staged(&pinned.cid)
                .await
                .map_err(IpfsError::from)?;
            unpinned.push(pinned.cid);
        }
        if !unpinned.is_empty() {
            info!(count = unpinned.len(), "Garbage collected staged pins");
        }
        Ok(unpinned)
    }

    async fn pinned_cids(&self) -> Result<Vec<PinnedCid>> {
        Ok(self.pinstore.get_all().await)
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        self.ipfs.cat(cid).await.map_err(Error::from)
    }
}
