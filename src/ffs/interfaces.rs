//! Capability seams between the scheduler and its storage backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::coreipfs::PinnedCid;
use super::types::{DealError, FilConfig, FilInfo, FilStorage, UserId};
use crate::error::Result;
use crate::lotus::{ChainEpoch, Cid, DealInfo, MarketDeal};

/// Restrictions applied when picking miners for new deals.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MinerSelectorFilter {
    pub excluded_miners: Vec<String>,
    /// Miners tried before any ranked candidate.
    pub trusted_miners: Vec<String>,
    pub country_codes: Vec<String>,
    /// Maximum epoch price; zero means unbounded.
    pub max_price: u64,
    pub piece_size: u64,
    pub verified_deal: bool,
}

impl MinerSelectorFilter {
    pub fn from_config(cfg: &FilConfig, piece_size: u64) -> Self {
        Self {
            excluded_miners: cfg.excluded_miners.clone(),
            trusted_miners: cfg.trusted_miners.clone(),
            country_codes: cfg.country_codes.clone(),
            max_price: cfg.max_price,
            piece_size,
            verified_deal: cfg.verified_deal,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MinerProposal {
    pub addr: String,
    pub epoch_price: u64,
}

#[async_trait]
pub trait MinerSelector: Send + Sync {
    /// Returns exactly `n` miners satisfying `filter`, or fails with
    /// [`crate::error::Error::NotEnoughMiners`].
    async fn get_miners(&self, n: usize, filter: &MinerSelectorFilter)
    -> Result<Vec<MinerProposal>>;

    /// Replication factor dictated by the selector's source, if any.
    async fn get_replication_factor(&self) -> Result<Option<usize>> {
        Ok(None)
    }
}

pub type SharedMinerSelector = Arc<dyn MinerSelector>;

/// Fast storage layer backed by IPFS pins.
#[async_trait]
pub trait HotStorage: Send + Sync {
    /// Adds data and registers a staged pin for `user`.
    async fn stage(&self, user: &UserId, data: Vec<u8>) -> Result<Cid>;
    async fn stage_cid(&self, user: &UserId, cid: &Cid) -> Result<()>;
    /// Pins `cid` for `user`, returning its size in bytes.
    async fn pin(&self, user: &UserId, cid: &Cid) -> Result<u64>;
    /// Drops the user's pin. When the user is the last holder the node pin
    /// goes away, unless `referenced` says another active job still needs
    /// the cid; the pin is then left staged for garbage collection.
    async fn unpin(&self, user: &UserId, cid: &Cid, referenced: bool) -> Result<()>;
    /// Moves the user's pin from `from` to `to`, returning the new size.
    async fn replace(&self, user: &UserId, from: &Cid, to: &Cid) -> Result<u64>;
    async fn is_pinned(&self, user: &UserId, cid: &Cid) -> Result<bool>;
    /// Unpins staged-only cids older than `older_than` not in `exclude`.
    async fn gc_staged(&self, exclude: &[Cid], older_than: DateTime<Utc>) -> Result<Vec<Cid>>;
    async fn pinned_cids(&self) -> Result<Vec<PinnedCid>>;
    async fn get(&self, cid: &Cid) -> Result<Vec<u8>>;
}

pub type SharedHotStorage = Arc<dyn HotStorage>;

/// Outcome of proposing deals for a cid.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreResult {
    pub accepted: Vec<Cid>,
    pub rejected: Vec<DealError>,
    pub piece_size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchInfo {
    pub retrieved_miner: String,
    pub funds_spent: u64,
    pub size: u64,
}

/// Parameters of a retrieval from the Filecoin market.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub data_cid: Cid,
    pub piece_cid: Option<Cid>,
    pub wallet: String,
    pub miners: Vec<String>,
    pub max_price: u64,
    pub selector: String,
}

/// Slow storage layer backed by Filecoin deals.
#[async_trait]
pub trait ColdStorage: Send + Sync {
    /// Proposes `cfg.rep_factor` deals for `cid`.
    async fn store(&self, cid: &Cid, cfg: &FilConfig, cancel: &CancellationToken)
    -> Result<StoreResult>;

    /// Waits until the proposal reaches a terminal state. The outer error is
    /// an operational failure; the inner one a deal that did not activate.
    async fn wait_for_deal(
        &self,
        cid: &Cid,
        proposal: &Cid,
        timeout: Duration,
        updates: Option<mpsc::Sender<DealInfo>>,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<FilStorage, DealError>>;

    /// Retrieves data into the local IPFS node.
    async fn fetch(&self, request: &FetchRequest, cancel: &CancellationToken) -> Result<FetchInfo>;

    /// Proposes replacement deals for proposals close to expiration.
    async fn ensure_renewals(
        &self,
        cid: &Cid,
        info: FilInfo,
        cfg: &FilConfig,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(FilInfo, Vec<DealError>)>;

    async fn is_deal_active(&self, proposal: &Cid) -> Result<bool>;

    async fn get_deal_info(&self, deal_id: u64) -> Result<MarketDeal>;

    async fn get_current_epoch(&self) -> Result<ChainEpoch>;
}

pub type SharedColdStorage = Arc<dyn ColdStorage>;
