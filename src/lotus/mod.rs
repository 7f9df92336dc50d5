//! # Lotus
//!
//! Typed view of the Lotus full-node API subset consumed by the indices,
//! the cold storage and the chain synchronisation helpers. [`LotusApi`] is the
//! seam tests replace with in-process fakes; [`rpc::LotusRpcClient`] speaks
//! the node's JSON-RPC dialect.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod rpc;

pub use rpc::LotusRpcClient;

pub type ChainEpoch = i64;

/// Nominal Filecoin block time.
pub const EPOCH_DURATION: Duration = Duration::from_secs(30);

/// Epochs per day at the nominal block time.
pub const EPOCHS_PER_DAY: i64 = 2_880;

#[derive(Debug, Error)]
pub enum LotusError {
    #[error("lotus rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("lotus transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode lotus response for {method}: {source}")]
    Decode {
        method: &'static str,
        source: serde_json::Error,
    },
    #[error("lotus call {method} timed out")]
    Timeout { method: &'static str },
    #[error("lotus returned an empty result for {method}")]
    EmptyResult { method: &'static str },
    #[error("invalid value from lotus: {0}")]
    InvalidValue(String),
}

/// Content identifier, kept in its canonical string encoding.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_undef(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Ordered set of block cids identifying a tipset.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct TipSetKey(pub Vec<Cid>);

impl TipSetKey {
    pub fn new(cids: Vec<Cid>) -> Self {
        Self(cids)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable byte encoding used as a storage key component.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0
            .iter()
            .map(Cid::as_str)
            .collect::<Vec<_>>()
            .join(",")
            .into_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, LotusError> {
        let text = std::str::from_utf8(raw)
            .map_err(|err| LotusError::InvalidValue(format!("tipset key is not utf-8: {err}")))?;
        if text.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self(text.split(',').map(Cid::from).collect()))
    }
}

impl fmt::Display for TipSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, cid) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{cid}")?;
        }
        write!(f, "}}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipSet {
    pub key: TipSetKey,
    pub height: ChainEpoch,
    pub parents: TipSetKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadChangeKind {
    Apply,
    Revert,
    Current,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadChange {
    pub kind: HeadChangeKind,
    pub tipset: TipSet,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerClaim {
    pub raw_byte_power: u128,
    pub quality_adj_power: u128,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerPower {
    pub miner_power: PowerClaim,
    pub total_power: PowerClaim,
    pub has_min_power: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerInfo {
    pub owner: String,
    pub worker: String,
    pub peer_id: Option<String>,
    pub multiaddrs: Vec<String>,
    pub sector_size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorCount {
    pub live: u64,
    pub active: u64,
    pub faulty: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub miner: String,
    pub epoch: ChainEpoch,
}

/// Storage ask as returned by a miner.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAsk {
    pub miner: String,
    pub price: u64,
    pub verified_price: u64,
    pub min_piece_size: u64,
    pub max_piece_size: u64,
    pub timestamp: ChainEpoch,
    pub expiry: ChainEpoch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartDealParams {
    pub data_root: Cid,
    pub piece_cid: Option<Cid>,
    pub piece_size: u64,
    pub wallet: String,
    pub miner: String,
    pub epoch_price: u64,
    pub min_blocks_duration: u64,
    pub deal_start_epoch: ChainEpoch,
    pub fast_retrieval: bool,
    pub verified_deal: bool,
}

/// Storage market deal states as reported by the deal client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DealState {
    #[default]
    Unknown,
    ProposalNotFound,
    ProposalRejected,
    ProposalAccepted,
    Staged,
    Sealing,
    Finalizing,
    Active,
    Expired,
    Slashed,
    Rejecting,
    Failing,
    FundsReserved,
    CheckForAcceptance,
    Validating,
    AcceptWait,
    StartDataTransfer,
    Transferring,
    WaitingForData,
    VerifyData,
    ReserveProviderFunds,
    ReserveClientFunds,
    ProviderFunding,
    ClientFunding,
    Publish,
    Publishing,
    Error,
    ProviderTransferAwaitRestart,
    ClientTransferRestart,
    AwaitingPreCommit,
}

impl DealState {
    const TABLE: [DealState; 30] = [
        DealState::Unknown,
        DealState::ProposalNotFound,
        DealState::ProposalRejected,
        DealState::ProposalAccepted,
        DealState::Staged,
        DealState::Sealing,
        DealState::Finalizing,
        DealState::Active,
        DealState::Expired,
        DealState::Slashed,
        DealState::Rejecting,
        DealState::Failing,
        DealState::FundsReserved,
        DealState::CheckForAcceptance,
        DealState::Validating,
        DealState::AcceptWait,
        DealState::StartDataTransfer,
        DealState::Transferring,
        DealState::WaitingForData,
        DealState::VerifyData,
        DealState::ReserveProviderFunds,
        DealState::ReserveClientFunds,
        DealState::ProviderFunding,
        DealState::ClientFunding,
        DealState::Publish,
        DealState::Publishing,
        DealState::Error,
        DealState::ProviderTransferAwaitRestart,
        DealState::ClientTransferRestart,
        DealState::AwaitingPreCommit,
    ];

    pub fn from_code(code: u64) -> Self {
        Self::TABLE
            .get(code as usize)
            .copied()
            .unwrap_or(DealState::Unknown)
    }

    pub fn code(self) -> u64 {
        Self::TABLE
            .iter()
            .position(|state| *state == self)
            .unwrap_or_default() as u64
    }

    /// States after which the deal will never make further progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DealState::Active
                | DealState::Expired
                | DealState::Slashed
                | DealState::Error
                | DealState::Failing
                | DealState::ProposalRejected
                | DealState::ProposalNotFound
        )
    }

    pub fn is_failure(self) -> bool {
        self.is_terminal() && self != DealState::Active
    }

    pub fn name(self) -> String {
        format!("StorageDeal{self:?}")
    }
}

/// Client-side view of a proposed deal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealInfo {
    pub proposal_cid: Cid,
    pub state: DealState,
    pub message: String,
    pub provider: String,
    pub data_root: Cid,
    pub piece_cid: Cid,
    pub size: u64,
    pub price_per_epoch: u64,
    pub duration: u64,
    pub deal_id: u64,
    pub activation_epoch: ChainEpoch,
    pub verified: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealProposal {
    pub piece_cid: Cid,
    pub piece_size: u64,
    pub client: String,
    pub provider: String,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub storage_price_per_epoch: u64,
    pub verified_deal: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDealState {
    pub sector_start_epoch: ChainEpoch,
    pub last_updated_epoch: ChainEpoch,
    pub slash_epoch: ChainEpoch,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDeal {
    pub proposal: DealProposal,
    pub state: MarketDealState,
}

/// Retrieval offer from `ClientFindData`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOffer {
    pub err: String,
    pub root: Cid,
    pub piece_cid: Option<Cid>,
    pub size: u64,
    pub min_price: u64,
    pub unseal_price: u64,
    pub miner: String,
    pub miner_peer_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalOrder {
    pub root: Cid,
    pub piece_cid: Option<Cid>,
    pub size: u64,
    pub total: u64,
    pub unseal_price: u64,
    pub client: String,
    pub miner: String,
    pub miner_peer_id: String,
}

/// Lotus API surface consumed by the daemon.
#[async_trait]
pub trait LotusApi: Send + Sync {
    async fn chain_head(&self) -> Result<TipSet, LotusError>;
    async fn chain_get_tipset(&self, key: &TipSetKey) -> Result<TipSet, LotusError>;
    async fn chain_get_tipset_by_height(
        &self,
        height: ChainEpoch,
        key: &TipSetKey,
    ) -> Result<TipSet, LotusError>;
    async fn chain_get_path(
        &self,
        from: &TipSetKey,
        to: &TipSetKey,
    ) -> Result<Vec<HeadChange>, LotusError>;
    async fn chain_get_genesis(&self) -> Result<TipSet, LotusError>;

    async fn state_list_miners(&self, key: &TipSetKey) -> Result<Vec<String>, LotusError>;
    async fn state_miner_power(&self, miner: &str, key: &TipSetKey)
    -> Result<MinerPower, LotusError>;
    async fn state_miner_info(&self, miner: &str, key: &TipSetKey) -> Result<MinerInfo, LotusError>;
    async fn state_miner_sector_count(
        &self,
        miner: &str,
        key: &TipSetKey,
    ) -> Result<SectorCount, LotusError>;
    async fn state_all_miner_faults(
        &self,
        lookback: ChainEpoch,
        key: &TipSetKey,
    ) -> Result<Vec<Fault>, LotusError>;
    async fn state_market_storage_deal(
        &self,
        deal_id: u64,
        key: &TipSetKey,
    ) -> Result<MarketDeal, LotusError>;

    async fn client_query_ask(&self, peer_id: &str, miner: &str) -> Result<QueryAsk, LotusError>;
    async fn client_start_deal(&self, params: &StartDealParams) -> Result<Cid, LotusError>;
    async fn client_get_deal_info(&self, proposal: &Cid) -> Result<DealInfo, LotusError>;
    async fn client_find_data(
        &self,
        root: &Cid,
        piece_cid: Option<&Cid>,
    ) -> Result<Vec<QueryOffer>, LotusError>;
    async fn client_retrieve(&self, order: &RetrievalOrder) -> Result<(), LotusError>;

    async fn wallet_default_address(&self) -> Result<String, LotusError>;

    /// Agent string announced by a connected peer.
    async fn net_agent_version(&self, peer_id: &str) -> Result<String, LotusError>;
}

pub type SharedLotus = Arc<dyn LotusApi>;
