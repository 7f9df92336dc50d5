//! Shared fakes and harness helpers for integration tests.
//!
//! The fakes stand in for the Lotus node and the IPFS node so the real
//! scheduler, executor, hot storage and cold storage run end to end in
//! process.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use parking_lot::Mutex;
use powergate::config::{NotifierConfig, SchedulerConfig};
use powergate::datastore::{MemoryDatastore, SharedDatastore, SqlDatastore};
use powergate::deals::DealRecordStore;
use powergate::error::Error;
use powergate::ffs::coreipfs::{CoreIpfs, IpfsApi, IpfsError, Pinstore};
use powergate::ffs::filcold::FilCold;
use powergate::ffs::scheduler::{Scheduler, SchedulerDeps};
use powergate::ffs::{
    JobId, JobStatus, MinerProposal, MinerSelector, MinerSelectorFilter, StorageJob,
};
use powergate::lotus::{
    ChainEpoch, Cid, DealInfo, DealProposal, DealState, Fault, HeadChange, LotusApi, LotusError,
    MarketDeal, MinerInfo, MinerPower, PowerClaim, QueryAsk, QueryOffer, RetrievalOrder,
    SectorCount, StartDealParams, TipSet, TipSetKey,
};
use powergate::notifications::Notifier;
use sea_orm::Database;
use sha2::{Digest, Sha256};

pub const WALLET: &str = "t3testwallet";

/// Sets up an in-memory SQLite database with the kv table and wraps it as a
/// datastore.
pub async fn setup_sql_datastore() -> Result<SharedDatastore> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(Arc::new(SqlDatastore::new(db)))
}

pub fn memory_datastore() -> SharedDatastore {
    Arc::new(MemoryDatastore::new())
}

/// How a miner treats deals proposed to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DealBehavior {
    /// The deal turns active on the first poll.
    Activate,
    /// `ClientStartDeal` fails.
    RejectProposal,
    /// The deal is accepted and later fails on-chain.
    FailOnChain,
    /// The deal stays sealing until the test gives up on it.
    Hang,
}

#[derive(Clone, Debug)]
pub struct FakeMiner {
    pub power: u128,
    pub peer_id: String,
    pub ask: Option<QueryAsk>,
    pub behavior: DealBehavior,
}

#[derive(Default)]
struct LotusState {
    height: ChainEpoch,
    miners: BTreeMap<String, FakeMiner>,
    deals: HashMap<Cid, DealInfo>,
    started: Vec<StartDealParams>,
    offers: Vec<QueryOffer>,
    faults: Vec<Fault>,
    retrieved: Vec<RetrievalOrder>,
}

/// In-process Lotus node driven by the test.
#[derive(Default)]
pub struct FakeLotus {
    state: Mutex<LotusState>,
    next_deal: AtomicU64,
}

fn tipset_at(height: ChainEpoch) -> TipSet {
    TipSet {
        key: TipSetKey::new(vec![Cid::from(format!("bafyts{height}").as_str())]),
        height,
        parents: TipSetKey::new(vec![Cid::from(
            format!("bafyts{}", height.saturating_sub(1)).as_str(),
        )]),
    }
}

fn rpc_error(message: impl Into<String>) -> LotusError {
    LotusError::Rpc {
        code: 1,
        message: message.into(),
    }
}

impl FakeLotus {
    pub fn new(height: ChainEpoch) -> Arc<Self> {
        let lotus = Self::default();
        lotus.state.lock().height = height;
        Arc::new(lotus)
    }

    pub fn set_height(&self, height: ChainEpoch) {
        self.state.lock().height = height;
    }

    pub fn add_miner(&self, addr: &str, power: u128, price: Option<u64>, behavior: DealBehavior) {
        let ask = price.map(|price| QueryAsk {
            miner: addr.to_string(),
            price,
            verified_price: price / 2,
            min_piece_size: 0,
            max_piece_size: 1 << 36,
            timestamp: 0,
            expiry: 1_000_000,
        });
        self.state.lock().miners.insert(
            addr.to_string(),
            FakeMiner {
                power,
                peer_id: format!("peer-{addr}"),
                ask,
                behavior,
            },
        );
    }

    pub fn set_ask(&self, addr: &str, ask: QueryAsk) {
        if let Some(miner) = self.state.lock().miners.get_mut(addr) {
            miner.ask = Some(ask);
        }
    }

    pub fn add_offer(&self, offer: QueryOffer) {
        self.state.lock().offers.push(offer);
    }

    pub fn add_fault(&self, miner: &str, epoch: ChainEpoch) {
        self.state.lock().faults.push(Fault {
            miner: miner.to_string(),
            epoch,
        });
    }

    pub fn started_deals(&self) -> Vec<StartDealParams> {
        self.state.lock().started.clone()
    }

    pub fn retrievals(&self) -> Vec<RetrievalOrder> {
        self.state.lock().retrieved.clone()
    }

    /// Moves a hanging deal to a final state.
    pub fn settle_deal(&self, proposal: &Cid, state: DealState) {
        let mut guard = self.state.lock();
        let height = guard.height;
        if let Some(deal) = guard.deals.get_mut(proposal) {
            deal.state = state;
            if state == DealState::Active {
                deal.activation_epoch = height;
            }
        }
    }
}

#[async_trait]
impl LotusApi for FakeLotus {
    async fn chain_head(&self) -> Result<TipSet, LotusError> {
        Ok(tipset_at(self.state.lock().height))
    }

    async fn chain_get_tipset(&self, key: &TipSetKey) -> Result<TipSet, LotusError> {
        let head = self.state.lock().height;
        (0..=head)
            .map(tipset_at)
            .find(|ts| &ts.key == key)
            .ok_or_else(|| rpc_error("tipset not found"))
    }

    async fn chain_get_tipset_by_height(
        &self,
        height: ChainEpoch,
        _key: &TipSetKey,
    ) -> Result<TipSet, LotusError> {
        Ok(tipset_at(height))
    }

    async fn chain_get_path(
        &self,
        _from: &TipSetKey,
        _to: &TipSetKey,
    ) -> Result<Vec<HeadChange>, LotusError> {
        Ok(Vec::new())
    }

    async fn chain_get_genesis(&self) -> Result<TipSet, LotusError> {
        Ok(tipset_at(0))
    }

    async fn state_list_miners(&self, _key: &TipSetKey) -> Result<Vec<String>, LotusError> {
        Ok(self.state.lock().miners.keys().cloned().collect())
    }

    async fn state_miner_power(
        &self,
        miner: &str,
        _key: &TipSetKey,
    ) -> Result<MinerPower, LotusError> {
        let guard = self.state.lock();
        let total: u128 = guard.miners.values().map(|m| m.power).sum();
        let power = guard
            .miners
            .get(miner)
            .map(|m| m.power)
            .ok_or_else(|| rpc_error("miner not found"))?;
        Ok(MinerPower {
            miner_power: PowerClaim {
                raw_byte_power: power,
                quality_adj_power: power,
            },
            total_power: PowerClaim {
                raw_byte_power: total,
                quality_adj_power: total,
            },
            has_min_power: power > 0,
        })
    }

    async fn state_miner_info(&self, miner: &str, _key: &TipSetKey) -> Result<MinerInfo, LotusError> {
        let guard = self.state.lock();
        let found = guard
            .miners
            .get(miner)
            .ok_or_else(|| rpc_error("miner not found"))?;
        Ok(MinerInfo {
            owner: miner.to_string(),
            worker: miner.to_string(),
            peer_id: Some(found.peer_id.clone()),
            multiaddrs: Vec::new(),
            sector_size: 34_359_738_368,
        })
    }

    async fn state_miner_sector_count(
        &self,
        _miner: &str,
        _key: &TipSetKey,
    ) -> Result<SectorCount, LotusError> {
        Ok(SectorCount {
            live: 10,
            active: 10,
            faulty: 0,
        })
    }

    async fn state_all_miner_faults(
        &self,
        _lookback: ChainEpoch,
        _key: &TipSetKey,
    ) -> Result<Vec<Fault>, LotusError> {
        Ok(self.state.lock().faults.clone())
    }

    async fn state_market_storage_deal(
        &self,
        deal_id: u64,
        _key: &TipSetKey,
    ) -> Result<MarketDeal, LotusError> {
        let guard = self.state.lock();
        let deal = guard
            .deals
            .values()
            .find(|d| d.deal_id == deal_id && d.state == DealState::Active)
            .ok_or_else(|| rpc_error("deal not found"))?;
        Ok(MarketDeal {
            proposal: DealProposal {
                piece_cid: deal.piece_cid.clone(),
                piece_size: deal.size,
                client: WALLET.to_string(),
                provider: deal.provider.clone(),
                start_epoch: deal.activation_epoch,
                end_epoch: deal.activation_epoch + deal.duration as ChainEpoch,
                storage_price_per_epoch: deal.price_per_epoch,
                verified_deal: deal.verified,
            },
            ..MarketDeal::default()
        })
    }

    async fn client_query_ask(&self, _peer_id: &str, miner: &str) -> Result<QueryAsk, LotusError> {
        self.state
            .lock()
            .miners
            .get(miner)
            .and_then(|m| m.ask.clone())
            .ok_or_else(|| rpc_error("miner doesn't answer asks"))
    }

    async fn client_start_deal(&self, params: &StartDealParams) -> Result<Cid, LotusError> {
        let mut guard = self.state.lock();
        let behavior = guard
            .miners
            .get(&params.miner)
            .map(|m| m.behavior)
            .ok_or_else(|| rpc_error("miner not found"))?;
        guard.started.push(params.clone());
        if behavior == DealBehavior::RejectProposal {
            return Err(rpc_error(format!("deal rejected by {}", params.miner)));
        }

        let deal_id = self.next_deal.fetch_add(1, Ordering::SeqCst) + 1;
        let proposal = Cid::from(format!("bafyproposal{deal_id}").as_str());
        let state = match behavior {
            DealBehavior::Activate => DealState::Active,
            DealBehavior::FailOnChain => DealState::Failing,
            _ => DealState::Sealing,
        };
        let height = guard.height;
        guard.deals.insert(
            proposal.clone(),
            DealInfo {
                proposal_cid: proposal.clone(),
                state,
                message: String::new(),
                provider: params.miner.clone(),
                data_root: params.data_root.clone(),
                piece_cid: Cid::from(format!("bafypiece{deal_id}").as_str()),
                size: params.piece_size,
                price_per_epoch: params.epoch_price,
                duration: params.min_blocks_duration,
                deal_id,
                activation_epoch: height,
                verified: params.verified_deal,
            },
        );
        Ok(proposal)
    }

    async fn client_get_deal_info(&self, proposal: &Cid) -> Result<DealInfo, LotusError> {
        self.state
            .lock()
            .deals
            .get(proposal)
            .cloned()
            .ok_or_else(|| rpc_error("deal not found"))
    }

    async fn client_find_data(
        &self,
        root: &Cid,
        _piece_cid: Option<&Cid>,
    ) -> Result<Vec<QueryOffer>, LotusError> {
        Ok(self
            .state
            .lock()
            .offers
            .iter()
            .filter(|o| &o.root == root)
            .cloned()
            .collect())
    }

    async fn client_retrieve(&self, order: &RetrievalOrder) -> Result<(), LotusError> {
        self.state.lock().retrieved.push(order.clone());
        Ok(())
    }

    async fn wallet_default_address(&self) -> Result<String, LotusError> {
        Ok(WALLET.to_string())
    }

    async fn net_agent_version(&self, _peer_id: &str) -> Result<String, LotusError> {
        Ok("lotus-1.0.0+test".to_string())
    }
}

/// IPFS node keeping blocks and recursive pins in memory.
#[derive(Default)]
pub struct FakeIpfs {
    blobs: Mutex<HashMap<Cid, Vec<u8>>>,
    pins: Mutex<HashSet<Cid>>,
    calls: Mutex<Vec<String>>,
}

impl FakeIpfs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Content address of `data`, as the fake computes it.
    pub fn cid_of(data: &[u8]) -> Cid {
        Cid::from(format!("bafy{}", &hex::encode(Sha256::digest(data))[..32]).as_str())
    }

    pub fn put_block(&self, data: &[u8]) -> Cid {
        let cid = Self::cid_of(data);
        self.blobs.lock().insert(cid.clone(), data.to_vec());
        cid
    }

    pub fn is_node_pinned(&self, cid: &Cid) -> bool {
        self.pins.lock().contains(cid)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl IpfsApi for FakeIpfs {
    async fn add(&self, data: Vec<u8>) -> Result<Cid, IpfsError> {
        Ok(self.put_block(&data))
    }

    async fn pin_add(&self, cid: &Cid) -> Result<(), IpfsError> {
        if !self.blobs.lock().contains_key(cid) {
            return Err(IpfsError::Api {
                command: "pin/add".to_string(),
                message: format!("block {cid} not found"),
            });
        }
        self.calls.lock().push(format!("pin {cid}"));
        self.pins.lock().insert(cid.clone());
        Ok(())
    }

    async fn pin_rm(&self, cid: &Cid) -> Result<(), IpfsError> {
        self.calls.lock().push(format!("unpin {cid}"));
        self.pins.lock().remove(cid);
        Ok(())
    }

    async fn pin_update(&self, from: &Cid, to: &Cid) -> Result<(), IpfsError> {
        self.calls.lock().push(format!("update {from} {to}"));
        let mut pins = self.pins.lock();
        pins.remove(from);
        pins.insert(to.clone());
        Ok(())
    }

    async fn dag_size(&self, cid: &Cid) -> Result<u64, IpfsError> {
        self.blobs
            .lock()
            .get(cid)
            .map(|b| b.len() as u64)
            .ok_or_else(|| IpfsError::Api {
                command: "dag/stat".to_string(),
                message: format!("block {cid} not found"),
            })
    }

    async fn cat(&self, cid: &Cid) -> Result<Vec<u8>, IpfsError> {
        self.blobs.lock().get(cid).cloned().ok_or_else(|| IpfsError::Api {
            command: "cat".to_string(),
            message: format!("block {cid} not found"),
        })
    }
}

/// Selector returning a fixed list of miners.
pub struct FixedSelector {
    miners: Vec<MinerProposal>,
    filters: Mutex<Vec<MinerSelectorFilter>>,
}

impl FixedSelector {
    pub fn new(miners: &[(&str, u64)]) -> Arc<Self> {
        Arc::new(Self {
            miners: miners
                .iter()
                .map(|(addr, epoch_price)| MinerProposal {
                    addr: addr.to_string(),
                    epoch_price: *epoch_price,
                })
                .collect(),
            filters: Mutex::new(Vec::new()),
        })
    }

    pub fn filters(&self) -> Vec<MinerSelectorFilter> {
        self.filters.lock().clone()
    }
}

#[async_trait]
impl MinerSelector for FixedSelector {
    async fn get_miners(
        &self,
        n: usize,
        filter: &MinerSelectorFilter,
    ) -> powergate::error::Result<Vec<MinerProposal>> {
        self.filters.lock().push(filter.clone());
        let miners: Vec<_> = self
            .miners
            .iter()
            .filter(|m| !filter.excluded_miners.contains(&m.addr))
            .filter(|m| filter.max_price == 0 || m.epoch_price <= filter.max_price)
            .take(n)
            .cloned()
            .collect();
        if miners.len() < n {
            return Err(Error::NotEnoughMiners {
                wanted: n,
                found: miners.len(),
            });
        }
        Ok(miners)
    }
}

pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        max_parallel_storage: 2,
        max_parallel_retrieval: 1,
        deal_watch_poll_ms: 10,
        deal_finality_timeout_seconds: 30,
        ..SchedulerConfig::default()
    }
}

/// A started scheduler wired to in-process fakes.
pub struct Harness {
    pub ds: SharedDatastore,
    pub lotus: Arc<FakeLotus>,
    pub ipfs: Arc<FakeIpfs>,
    pub hot: Arc<CoreIpfs>,
    pub selector: Arc<FixedSelector>,
    pub notifier: Arc<Notifier>,
    pub scheduler: Arc<Scheduler>,
}

impl Harness {
    pub async fn start(
        ds: SharedDatastore,
        lotus: Arc<FakeLotus>,
        selector: Arc<FixedSelector>,
    ) -> Result<Self> {
        Self::start_with_ipfs(ds, lotus, FakeIpfs::new(), selector).await
    }

    /// Closes this daemon and boots a new one over the same datastore and
    /// nodes, as a process restart would.
    pub async fn restart(self) -> Result<Self> {
        self.close().await;
        Self::start_with_ipfs(self.ds, self.lotus, self.ipfs, self.selector).await
    }

    async fn start_with_ipfs(
        ds: SharedDatastore,
        lotus: Arc<FakeLotus>,
        ipfs: Arc<FakeIpfs>,
        selector: Arc<FixedSelector>,
    ) -> Result<Self> {
        let hot = Arc::new(CoreIpfs::new(ipfs.clone(), Pinstore::new(ds.clone()).await?));
        let cold = Arc::new(FilCold::new(
            lotus.clone(),
            selector.clone(),
            ipfs.clone(),
            Arc::new(DealRecordStore::new(ds.clone())),
            Duration::from_millis(10),
        ));
        let notifier = Notifier::new(&NotifierConfig::default(), std::env::temp_dir())?;
        let scheduler = Scheduler::new(
            scheduler_config(),
            Some(WALLET.to_string()),
            SchedulerDeps {
                ds: ds.clone(),
                hot: hot.clone(),
                cold,
                selector: selector.clone(),
                notifier: notifier.clone(),
                faults: None,
            },
        )
        .await?;
        scheduler.start().await?;
        Ok(Self {
            ds,
            lotus,
            ipfs,
            hot,
            selector,
            notifier,
            scheduler,
        })
    }

    pub async fn close(&self) {
        self.scheduler.close().await;
        self.notifier.close().await;
    }
}

/// Polls the job until it reaches `status` or the timeout elapses.
pub async fn wait_for_status(
    scheduler: &Scheduler,
    job_id: &JobId,
    status: JobStatus,
    timeout: Duration,
) -> Result<StorageJob> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = scheduler.get_storage_job(job_id).await?;
        if job.status == status {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "job {job_id} stayed {} instead of reaching {status}",
                job.status
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_final(scheduler: &Scheduler, job_id: &JobId) -> Result<StorageJob> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = scheduler.get_storage_job(job_id).await?;
        if job.status.is_final() {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("job {job_id} didn't finish, still {}", job.status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
