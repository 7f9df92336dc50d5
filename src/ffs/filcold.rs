//! # Filecoin cold storage
//!
//! [`FilCold`] implements [`ColdStorage`] with the Lotus deal client:
//! proposals are sent to miners picked by the configured
//! [`MinerSelector`](super::interfaces::MinerSelector), watched by polling
//! `ClientGetDealInfo` and recorded in the [`DealRecordStore`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::coreipfs::SharedIpfs;
use super::interfaces::{
    ColdStorage, FetchInfo, FetchRequest, MinerProposal, MinerSelectorFilter,
    SharedMinerSelector, StoreResult,
};
use super::types::{DealError, FilConfig, FilInfo, FilStorage, now_nanos};
use crate::deals::{DealRecordStore, RetrievalDealInfo, RetrievalDealRecord, StorageDealRecord};
use crate::error::{Error, Result};
use crate::lotus::{
    ChainEpoch, Cid, DealInfo, DealState, LotusError, MarketDeal, RetrievalOrder, SharedLotus,
    StartDealParams, TipSetKey,
};

/// Size of the padded piece the deal client builds from `raw` bytes:
/// fr32 expansion (127 to 128) rounded up to a power of two.
pub fn padded_piece_size(raw: u64) -> u64 {
    let expanded = raw + raw.div_ceil(127);
    expanded.max(128).next_power_of_two()
}

pub struct FilCold {
    api: SharedLotus,
    selector: SharedMinerSelector,
    ipfs: SharedIpfs,
    records: Arc<DealRecordStore>,
    poll_interval: Duration,
}

impl FilCold {
    pub fn new(
        api: SharedLotus,
        selector: SharedMinerSelector,
        ipfs: SharedIpfs,
        records: Arc<DealRecordStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            api,
            selector,
            ipfs,
            records,
            poll_interval,
        }
    }

    async fn piece_size(&self, cid: &Cid) -> Result<u64> {
        let raw = self.ipfs.dag_size(cid).await?;
        Ok(padded_piece_size(raw))
    }

    /// Sends one proposal per selected miner. Proposal failures are
    /// recorded and the remaining miners are still tried.
    async fn propose(
        &self,
        cid: &Cid,
        piece_size: u64,
        cfg: &FilConfig,
        miners: &[MinerProposal],
        cancel: &CancellationToken,
    ) -> Result<(Vec<Cid>, Vec<DealError>)> {
        let deal_start_epoch = if cfg.deal_start_offset > 0 {
            self.api.chain_head().await?.height + cfg.deal_start_offset
        } else {
            0
        };

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for miner in miners {
            if cancel.is_cancelled() {
                rejected.push(DealError {
                    proposal_cid: None,
                    miner: miner.addr.clone(),
                    message: "job canceled before proposing".to_string(),
                });
                continue;
            }
            let params = StartDealParams {
                data_root: cid.clone(),
                piece_cid: None,
                piece_size,
                wallet: cfg.addr.clone(),
                miner: miner.addr.clone(),
                epoch_price: miner.epoch_price,
                min_blocks_duration: cfg.deal_min_duration.max(0) as u64,
                deal_start_epoch,
                fast_retrieval: cfg.fast_retrieval,
                verified_deal: cfg.verified_deal,
            };
            info!(miner = %miner.addr, price = miner.epoch_price, "Proposing deal");
            match self.api.client_start_deal(&params).await {
                Ok(proposal) => {
                    let record = StorageDealRecord {
                        root_cid: cid.clone(),
                        addr: cfg.addr.clone(),
                        date_nanos: now_nanos(),
                        pending: true,
                        deal_info: DealInfo {
                            proposal_cid: proposal.clone(),
                            provider: miner.addr.clone(),
                            data_root: cid.clone(),
                            size: piece_size,
                            price_per_epoch: miner.epoch_price,
                            duration: params.min_blocks_duration,
                            ..DealInfo::default()
                        },
                        updated_at: 0,
                    };
                    if let Err(err) = self.records.put_pending_storage(record).await {
                        warn!(error = ?err, proposal = %proposal, "Recording pending deal failed");
                    }
                    accepted.push(proposal);
                }
                Err(err) => {
                    warn!(miner = %miner.addr, error = %err, "Deal proposal failed");
                    rejected.push(DealError {
                        proposal_cid: None,
                        miner: miner.addr.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok((accepted, rejected))
    }

    async fn record_final(&self, cid: &Cid, info: &DealInfo) {
        let record = StorageDealRecord {
            root_cid: cid.clone(),
            addr: String::new(),
            date_nanos: now_nanos(),
            pending: false,
            deal_info: info.clone(),
            updated_at: 0,
        };
        let record = match self.records.storage_by_proposal(&info.proposal_cid).await {
            Ok(Some(previous)) => StorageDealRecord {
                addr: previous.addr,
                date_nanos: previous.date_nanos,
                ..record
            },
            _ => record,
        };
        if let Err(err) = self.records.put_final_storage(record).await {
            warn!(error = ?err, proposal = %info.proposal_cid, "Recording final deal failed");
        }
    }

    async fn activated(&self, info: &DealInfo) -> FilStorage {
        let start_epoch = match self.get_deal_info(info.deal_id).await {
            Ok(deal) => deal.proposal.start_epoch,
            Err(err) => {
                warn!(deal_id = info.deal_id, error = %err, "Fetching on-chain deal failed");
                info.activation_epoch
            }
        };
        FilStorage {
            proposal_cid: info.proposal_cid.clone(),
            piece_cid: info.piece_cid.clone(),
            deal_id: info.deal_id,
            renewed: false,
            duration: info.duration as i64,
            activation_epoch: info.activation_epoch,
            start_epoch,
            miner: info.provider.clone(),
            epoch_price: info.price_per_epoch,
        }
    }

    async fn renew(
        &self,
        cid: &Cid,
        piece_size: u64,
        expiring: &FilStorage,
        cfg: &FilConfig,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<FilStorage, DealError>> {
        let filter = MinerSelectorFilter {
            trusted_miners: vec![expiring.miner.clone()],
            ..MinerSelectorFilter::from_config(cfg, piece_size)
        };
        let miners = match self.selector.get_miners(1, &filter).await {
            Ok(miners) => miners,
            Err(err) => {
                return Ok(Err(DealError {
                    proposal_cid: Some(expiring.proposal_cid.clone()),
                    miner: expiring.miner.clone(),
                    message: format!("selecting renewal miner: {err}"),
                }));
            }
        };
        let (accepted, mut rejected) = self.propose(cid, piece_size, cfg, &miners, cancel).await?;
        let Some(proposal) = accepted.first() else {
            return Ok(Err(rejected.pop().unwrap_or_else(|| DealError {
                proposal_cid: None,
                miner: expiring.miner.clone(),
                message: "renewal proposal wasn't sent".to_string(),
            })));
        };
        self.wait_for_deal(cid, proposal, timeout, None, cancel).await
    }
}

fn is_not_found(err: &LotusError) -> bool {
    matches!(err, LotusError::Rpc { message, .. } if message.to_lowercase().contains("not found"))
}

#[async_trait]
impl ColdStorage for FilCold {
    #[instrument(skip_all, fields(cid = %cid, rep_factor = cfg.rep_factor))]
    async fn store(
        &self,
        cid: &Cid,
        cfg: &FilConfig,
        cancel: &CancellationToken,
    ) -> Result<StoreResult> {
        let piece_size = self.piece_size(cid).await?;
        debug!(piece_size, "Estimated piece size");
        let filter = MinerSelectorFilter::from_config(cfg, piece_size);
        let miners = self.selector.get_miners(cfg.rep_factor, &filter).await?;
        let (accepted, rejected) = self.propose(cid, piece_size, cfg, &miners, cancel).await?;
        Ok(StoreResult {
            accepted,
            rejected,
            piece_size,
        })
    }

    #[instrument(skip_all, fields(cid = %cid, proposal = %proposal))]
    async fn wait_for_deal(
        &self,
        cid: &Cid,
        proposal: &Cid,
        timeout: Duration,
        updates: Option<mpsc::Sender<DealInfo>>,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<FilStorage, DealError>> {
        let deadline = Instant::now() + timeout;
        let mut last_state = None;
        loop {
            match self.api.client_get_deal_info(proposal).await {
                Ok(info) => {
                    if last_state != Some(info.state) {
                        debug!(state = %info.state.name(), miner = %info.provider, "Deal changed state");
                        last_state = Some(info.state);
                        if let Some(updates) = &updates {
                            let _ = updates.try_send(info.clone());
                        }
                    }
                    if info.state == DealState::Active {
                        self.record_final(cid, &info).await;
                        return Ok(Ok(self.activated(&info).await));
                    }
                    if info.state.is_failure() {
                        self.record_final(cid, &info).await;
                        let message = if info.message.is_empty() {
                            info.state.name()
                        } else {
                            info.message.clone()
                        };
                        return Ok(Err(DealError {
                            proposal_cid: Some(proposal.clone()),
                            miner: info.provider,
                            message,
                        }));
                    }
                }
                Err(err) => warn!(error = %err, "Polling deal state failed"),
            }

            if Instant::now() >= deadline {
                return Ok(Err(DealError {
                    proposal_cid: Some(proposal.clone()),
                    miner: String::new(),
                    message: "deal didn't reach a final state in time".to_string(),
                }));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = sleep(self.poll_interval) => {}
            }
        }
    }

    #[instrument(skip_all, fields(cid = %request.data_cid))]
    async fn fetch(&self, request: &FetchRequest, cancel: &CancellationToken) -> Result<FetchInfo> {
        let mut offers: Vec<_> = self
            .api
            .client_find_data(&request.data_cid, request.piece_cid.as_ref())
            .await?
            .into_iter()
            .filter(|o| o.err.is_empty())
            .filter(|o| request.miners.is_empty() || request.miners.contains(&o.miner))
            .filter(|o| request.max_price == 0 || o.min_price <= request.max_price)
            .collect();
        offers.sort_by_key(|o| o.min_price);
        if offers.is_empty() {
            return Err(Error::NotFound(format!(
                "retrieval offers for {}",
                request.data_cid
            )));
        }

        let mut failures = Vec::new();
        for offer in offers {
            let order = RetrievalOrder {
                root: request.data_cid.clone(),
                piece_cid: offer.piece_cid.clone().or_else(|| request.piece_cid.clone()),
                size: offer.size,
                total: offer.min_price,
                unseal_price: offer.unseal_price,
                client: request.wallet.clone(),
                miner: offer.miner.clone(),
                miner_peer_id: offer.miner_peer_id.clone(),
            };
            let started = now_nanos();
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                result = self.api.client_retrieve(&order) => result,
            };
            match result {
                Ok(()) => {
                    let record = RetrievalDealRecord {
                        id: String::new(),
                        addr: request.wallet.clone(),
                        date_nanos: started,
                        deal_info: RetrievalDealInfo {
                            root_cid: request.data_cid.clone(),
                            size: offer.size,
                            min_price: offer.min_price,
                            miner: offer.miner.clone(),
                            miner_peer_id: offer.miner_peer_id.clone(),
                        },
                        error_msg: String::new(),
                        updated_at: 0,
                    };
                    if let Err(err) = self.records.put_retrieval(record).await {
                        warn!(error = ?err, "Recording retrieval failed");
                    }
                    info!(miner = %offer.miner, paid = offer.min_price, "Retrieved data");
                    return Ok(FetchInfo {
                        retrieved_miner: offer.miner,
                        funds_spent: offer.min_price + offer.unseal_price,
                        size: offer.size,
                    });
                }
                Err(err) => {
                    warn!(miner = %offer.miner, error = %err, "Retrieval attempt failed");
                    failures.push(format!("{}: {err}", offer.miner));
                }
            }
        }
        Err(Error::Internal(format!(
            "retrieval failed with every miner: {}",
            failures.join("; ")
        )))
    }

    #[instrument(skip_all, fields(cid = %cid))]
    async fn ensure_renewals(
        &self,
        cid: &Cid,
        info: FilInfo,
        cfg: &FilConfig,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(FilInfo, Vec<DealError>)> {
        let height = self.get_current_epoch().await?;
        let renewable: Vec<FilStorage> = info
            .proposals
            .iter()
            .filter(|p| !p.renewed && p.start_epoch > 0 && p.duration > 0)
            .filter(|p| p.expiration_epoch() - cfg.renew.threshold <= height)
            .cloned()
            .collect();

        let young = info.proposals.len() - renewable.len();
        let wanted = cfg.rep_factor.saturating_sub(young).min(renewable.len());
        if wanted == 0 {
            return Ok((info, Vec::new()));
        }

        let piece_size = if info.size == 0 {
            self.piece_size(&info.data_cid).await?
        } else {
            info.size
        };

        let mut updated = FilInfo {
            size: piece_size,
            ..info
        };
        let mut errors = Vec::new();
        for expiring in renewable.iter().take(wanted) {
            match self.renew(cid, piece_size, expiring, cfg, timeout, cancel).await? {
                Ok(renewed) => {
                    info!(miner = %renewed.miner, deal_id = renewed.deal_id, "Renewed deal");
                    if let Some(old) = updated
                        .proposals
                        .iter_mut()
                        .find(|p| p.proposal_cid == expiring.proposal_cid)
                    {
                        old.renewed = true;
                    }
                    updated.proposals.push(renewed);
                }
                Err(err) => errors.push(err),
            }
        }
        Ok((updated, errors))
    }

    async fn is_deal_active(&self, proposal: &Cid) -> Result<bool> {
        match self.api.client_get_deal_info(proposal).await {
            Ok(info) => Ok(info.state == DealState::Active),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_deal_info(&self, deal_id: u64) -> Result<MarketDeal> {
        self.api
            .state_market_storage_deal(deal_id, &TipSetKey::default())
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    Error::NotFound(format!("deal {deal_id}"))
                } else {
                    err.into()
                }
            })
    }

    async fn get_current_epoch(&self) -> Result<ChainEpoch> {
        Ok(self.api.chain_head().await?.height)
    }
}
