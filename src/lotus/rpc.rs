//! JSON-RPC client for the Lotus full node.
//!
//! Every method is a `Filecoin.<Name>` call posted to the node's RPC endpoint
//! with an optional bearer token. Wire structs mirror the node's PascalCase
//! JSON and are converted into the domain types of [`super`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};
use url::Url;

use super::{
    ChainEpoch, Cid, DealInfo, DealProposal, DealState, Fault, HeadChange, HeadChangeKind,
    LotusApi, LotusError, MarketDeal, MarketDealState, MinerInfo, MinerPower, PowerClaim,
    QueryAsk, QueryOffer, RetrievalOrder, SectorCount, StartDealParams, TipSet, TipSetKey,
};
use crate::config::LotusConfig;

pub struct LotusRpcClient {
    http: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: String,
    params: &'a Value,
    id: u64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct CidJson {
    #[serde(rename = "/")]
    cid: String,
}

impl From<&Cid> for CidJson {
    fn from(value: &Cid) -> Self {
        Self {
            cid: value.as_str().to_string(),
        }
    }
}

fn key_json(key: &TipSetKey) -> Value {
    json!(key.0.iter().map(CidJson::from).collect::<Vec<_>>())
}

fn parse_big(raw: &str) -> Result<u128, LotusError> {
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse::<u128>()
        .map_err(|_| LotusError::InvalidValue(format!("invalid big integer '{raw}'")))
}

fn parse_price(raw: &str) -> Result<u64, LotusError> {
    let value = parse_big(raw)?;
    u64::try_from(value).map_err(|_| LotusError::InvalidValue(format!("price {raw} overflows")))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlockHeaderJson {
    #[serde(default)]
    parents: Vec<CidJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TipSetJson {
    cids: Vec<CidJson>,
    #[serde(default)]
    blocks: Vec<BlockHeaderJson>,
    height: ChainEpoch,
}

impl From<TipSetJson> for TipSet {
    fn from(value: TipSetJson) -> Self {
        let parents: Vec<Cid> = value
            .blocks
            .first()
            .map(|block| block.parents.iter().map(|c| Cid::new(&c.cid)).collect())
            .unwrap_or_default();
        TipSet {
            key: TipSetKey::new(value.cids.into_iter().map(|c| Cid::new(c.cid)).collect()),
            height: value.height,
            parents: TipSetKey::new(parents),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HeadChangeJson {
    #[serde(rename = "Type")]
    kind: String,
    val: TipSetJson,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ClaimJson {
    raw_byte_power: String,
    quality_adj_power: String,
}

impl TryFrom<ClaimJson> for PowerClaim {
    type Error = LotusError;

    fn try_from(value: ClaimJson) -> Result<Self, Self::Error> {
        Ok(PowerClaim {
            raw_byte_power: parse_big(&value.raw_byte_power)?,
            quality_adj_power: parse_big(&value.quality_adj_power)?,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MinerPowerJson {
    miner_power: ClaimJson,
    total_power: ClaimJson,
    #[serde(default)]
    has_min_power: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MinerInfoJson {
    #[serde(default)]
    owner: String,
    #[serde(default)]
    worker: String,
    #[serde(default)]
    peer_id: Option<String>,
    #[serde(default)]
    multiaddrs: Option<Vec<String>>,
    #[serde(default)]
    sector_size: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SectorCountJson {
    live: u64,
    active: u64,
    faulty: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FaultJson {
    miner: String,
    epoch: ChainEpoch,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StorageAskJson {
    price: String,
    #[serde(default)]
    verified_price: String,
    min_piece_size: u64,
    max_piece_size: u64,
    miner: String,
    timestamp: ChainEpoch,
    expiry: ChainEpoch,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DealDataRefJson {
    root: CidJson,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DealInfoJson {
    proposal_cid: CidJson,
    state: u64,
    #[serde(default)]
    message: String,
    provider: String,
    data_ref: Option<DealDataRefJson>,
    #[serde(rename = "PieceCID")]
    piece_cid: Option<CidJson>,
    size: u64,
    price_per_epoch: String,
    duration: u64,
    #[serde(rename = "DealID", default)]
    deal_id: u64,
    #[serde(default)]
    verified: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DealProposalJson {
    #[serde(rename = "PieceCID")]
    piece_cid: CidJson,
    piece_size: u64,
    #[serde(default)]
    verified_deal: bool,
    client: String,
    provider: String,
    start_epoch: ChainEpoch,
    end_epoch: ChainEpoch,
    storage_price_per_epoch: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DealStateJson {
    sector_start_epoch: ChainEpoch,
    last_updated_epoch: ChainEpoch,
    slash_epoch: ChainEpoch,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MarketDealJson {
    proposal: DealProposalJson,
    state: DealStateJson,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MinerPeerJson {
    #[serde(rename = "ID", default)]
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryOfferJson {
    #[serde(default)]
    err: String,
    root: CidJson,
    piece: Option<CidJson>,
    size: u64,
    min_price: String,
    #[serde(default)]
    unseal_price: String,
    miner: String,
    miner_peer: MinerPeerJson,
}

impl LotusRpcClient {
    pub fn new(config: &LotusConfig) -> Result<Self, LotusError> {
        let endpoint = Url::parse(&config.api_url)
            .map_err(|err| LotusError::InvalidValue(format!("invalid lotus url: {err}")))?;
        let http = reqwest::Client::builder()
            .timeout(config.call_timeout())
            .build()?;
        Ok(Self {
            http,
            endpoint,
            token: config.token.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn with_timeout(endpoint: Url, token: Option<String>, timeout: Duration) -> Result<Self, LotusError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint,
            token,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, LotusError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method: format!("Filecoin.{method}"),
            params: &params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let mut builder = self.http.post(self.endpoint.clone()).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                LotusError::Timeout { method }
            } else {
                LotusError::Transport(err)
            }
        })?;
        let body: RpcResponse = response.error_for_status()?.json().await?;
        if let Some(error) = body.error {
            debug!(method, code = error.code, message = %error.message, "Lotus rpc returned error");
            return Err(LotusError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        let result = body.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|source| LotusError::Decode { method, source })
    }
}

#[async_trait]
impl LotusApi for LotusRpcClient {
    #[instrument(skip(self))]
    async fn chain_head(&self) -> Result<TipSet, LotusError> {
        let ts: TipSetJson = self.call("ChainHead", json!([])).await?;
        Ok(ts.into())
    }

    async fn chain_get_tipset(&self, key: &TipSetKey) -> Result<TipSet, LotusError> {
        let ts: TipSetJson = self.call("ChainGetTipSet", json!([key_json(key)])).await?;
        Ok(ts.into())
    }

    async fn chain_get_tipset_by_height(
        &self,
        height: ChainEpoch,
        key: &TipSetKey,
    ) -> Result<TipSet, LotusError> {
        let ts: TipSetJson = self
            .call("ChainGetTipSetByHeight", json!([height, key_json(key)]))
            .await?;
        Ok(ts.into())
    }

    async fn chain_get_path(
        &self,
        from: &TipSetKey,
        to: &TipSetKey,
    ) -> Result<Vec<HeadChange>, LotusError> {
        let changes: Option<Vec<HeadChangeJson>> = self
            .call("ChainGetPath", json!([key_json(from), key_json(to)]))
            .await?;
        changes
            .unwrap_or_default()
            .into_iter()
            .map(|change| {
                let kind = match change.kind.as_str() {
                    "apply" => HeadChangeKind::Apply,
                    "revert" => HeadChangeKind::Revert,
                    "current" => HeadChangeKind::Current,
                    other => {
                        return Err(LotusError::InvalidValue(format!(
                            "unknown head change type '{other}'"
                        )));
                    }
                };
                Ok(HeadChange {
                    kind,
                    tipset: change.val.into(),
                })
            })
            .collect()
    }

    async fn chain_get_genesis(&self) -> Result<TipSet, LotusError> {
        let ts: TipSetJson = self.call("ChainGetGenesis", json!([])).await?;
        Ok(ts.into())
    }

    async fn state_list_miners(&self, key: &TipSetKey) -> Result<Vec<String>, LotusError> {
        let miners: Option<Vec<String>> =
            self.call("StateListMiners", json!([key_json(key)])).await?;
        Ok(miners.unwrap_or_default())
    }

    async fn state_miner_power(
        &self,
        miner: &str,
        key: &TipSetKey,
    ) -> Result<MinerPower, LotusError> {
        let power: MinerPowerJson = self
            .call("StateMinerPower", json!([miner, key_json(key)]))
            .await?;
        Ok(MinerPower {
            miner_power: power.miner_power.try_into()?,
            total_power: power.total_power.try_into()?,
            has_min_power: power.has_min_power,
        })
    }

    async fn state_miner_info(&self, miner: &str, key: &TipSetKey) -> Result<MinerInfo, LotusError> {
        let info: MinerInfoJson = self
            .call("StateMinerInfo", json!([miner, key_json(key)]))
            .await?;
        Ok(MinerInfo {
            owner: info.owner,
            worker: info.worker,
            peer_id: info.peer_id.filter(|p| !p.is_empty()),
            multiaddrs: info.multiaddrs.unwrap_or_default(),
            sector_size: info.sector_size,
        })
    }

    async fn state_miner_sector_count(
        &self,
        miner: &str,
        key: &TipSetKey,
    ) -> Result<SectorCount, LotusError> {
        let count: SectorCountJson = self
            .call("StateMinerSectorCount", json!([miner, key_json(key)]))
            .await?;
        Ok(SectorCount {
            live: count.live,
            active: count.active,
            faulty: count.faulty,
        })
    }

    async fn state_all_miner_faults(
        &self,
        lookback: ChainEpoch,
        key: &TipSetKey,
    ) -> Result<Vec<Fault>, LotusError> {
        let faults: Option<Vec<FaultJson>> = self
            .call("StateAllMinerFaults", json!([lookback, key_json(key)]))
            .await?;
        Ok(faults
            .unwrap_or_default()
            .into_iter()
            .map(|f| Fault {
                miner: f.miner,
                epoch: f.epoch,
            })
            .collect())
    }

    async fn state_market_storage_deal(
        &self,
        deal_id: u64,
        key: &TipSetKey,
    ) -> Result<MarketDeal, LotusError> {
        let deal: MarketDealJson = self
            .call("StateMarketStorageDeal", json!([deal_id, key_json(key)]))
            .await?;
        Ok(MarketDeal {
            proposal: DealProposal {
                piece_cid: Cid::new(deal.proposal.piece_cid.cid),
                piece_size: deal.proposal.piece_size,
                client: deal.proposal.client,
                provider: deal.proposal.provider,
                start_epoch: deal.proposal.start_epoch,
                end_epoch: deal.proposal.end_epoch,
                storage_price_per_epoch: parse_price(&deal.proposal.storage_price_per_epoch)?,
                verified_deal: deal.proposal.verified_deal,
            },
            state: MarketDealState {
                sector_start_epoch: deal.state.sector_start_epoch,
                last_updated_epoch: deal.state.last_updated_epoch,
                slash_epoch: deal.state.slash_epoch,
            },
        })
    }

    #[instrument(skip(self))]
    async fn client_query_ask(&self, peer_id: &str, miner: &str) -> Result<QueryAsk, LotusError> {
        let ask: StorageAskJson = self.call("ClientQueryAsk", json!([peer_id, miner])).await?;
        Ok(QueryAsk {
            miner: ask.miner,
            price: parse_price(&ask.price)?,
            verified_price: parse_price(&ask.verified_price)?,
            min_piece_size: ask.min_piece_size,
            max_piece_size: ask.max_piece_size,
            timestamp: ask.timestamp,
            expiry: ask.expiry,
        })
    }

    #[instrument(skip(self, params), fields(miner = %params.miner, data = %params.data_root))]
    async fn client_start_deal(&self, params: &StartDealParams) -> Result<Cid, LotusError> {
        let body = json!([{
            "Data": {
                "TransferType": "graphsync",
                "Root": CidJson::from(&params.data_root),
                "PieceCid": params.piece_cid.as_ref().map(CidJson::from),
                "PieceSize": params.piece_size,
            },
            "Wallet": params.wallet,
            "Miner": params.miner,
            "EpochPrice": params.epoch_price.to_string(),
            "MinBlocksDuration": params.min_blocks_duration,
            "DealStartEpoch": params.deal_start_epoch,
            "FastRetrieval": params.fast_retrieval,
            "VerifiedDeal": params.verified_deal,
        }]);
        let proposal: Option<CidJson> = self.call("ClientStartDeal", body).await?;
        proposal
            .map(|c| Cid::new(c.cid))
            .ok_or(LotusError::EmptyResult {
                method: "ClientStartDeal",
            })
    }

    async fn client_get_deal_info(&self, proposal: &Cid) -> Result<DealInfo, LotusError> {
        let info: DealInfoJson = self
            .call("ClientGetDealInfo", json!([CidJson::from(proposal)]))
            .await?;
        Ok(DealInfo {
            proposal_cid: Cid::new(info.proposal_cid.cid),
            state: DealState::from_code(info.state),
            message: info.message,
            provider: info.provider,
            data_root: info
                .data_ref
                .map(|d| Cid::new(d.root.cid))
                .unwrap_or_default(),
            piece_cid: info.piece_cid.map(|c| Cid::new(c.cid)).unwrap_or_default(),
            size: info.size,
            price_per_epoch: parse_price(&info.price_per_epoch)?,
            duration: info.duration,
            deal_id: info.deal_id,
            activation_epoch: 0,
            verified: info.verified,
        })
    }

    async fn client_find_data(
        &self,
        root: &Cid,
        piece_cid: Option<&Cid>,
    ) -> Result<Vec<QueryOffer>, LotusError> {
        let offers: Option<Vec<QueryOfferJson>> = self
            .call(
                "ClientFindData",
                json!([CidJson::from(root), piece_cid.map(CidJson::from)]),
            )
            .await?;
        offers
            .unwrap_or_default()
            .into_iter()
            .map(|offer| {
                Ok(QueryOffer {
                    err: offer.err,
                    root: Cid::new(offer.root.cid),
                    piece_cid: offer.piece.map(|c| Cid::new(c.cid)),
                    size: offer.size,
                    min_price: parse_price(&offer.min_price)?,
                    unseal_price: parse_price(&offer.unseal_price)?,
                    miner: offer.miner,
                    miner_peer_id: offer.miner_peer.id,
                })
            })
            .collect()
    }

    #[instrument(skip(self, order), fields(miner = %order.miner, root = %order.root))]
    async fn client_retrieve(&self, order: &RetrievalOrder) -> Result<(), LotusError> {
        let body = json!([{
            "Root": CidJson::from(&order.root),
            "Piece": order.piece_cid.as_ref().map(CidJson::from),
            "Size": order.size,
            "Total": order.total.to_string(),
            "UnsealPrice": order.unseal_price.to_string(),
            "PaymentInterval": 1_048_576,
            "PaymentIntervalIncrease": 1_048_576,
            "Client": order.client,
            "Miner": order.miner,
            "MinerPeer": { "Address": order.miner, "ID": order.miner_peer_id },
        }, null]);
        let _: Value = self.call("ClientRetrieve", body).await?;
        Ok(())
    }

    async fn wallet_default_address(&self) -> Result<String, LotusError> {
        self.call("WalletDefaultAddress", json!([])).await
    }

    async fn net_agent_version(&self, peer_id: &str) -> Result<String, LotusError> {
        self.call("NetAgentVersion", json!([peer_id])).await
    }
}
