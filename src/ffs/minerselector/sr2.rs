use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{QUERY_ASK_TIMEOUT, ask_price, fits_piece_size, query_ask};
use crate::error::{Error, Result};
use crate::ffs::interfaces::{MinerProposal, MinerSelector, MinerSelectorFilter};
use crate::index::AskRunner;
use crate::lotus::{QueryAsk, SharedLotus};

/// Highest epoch price, in attoFIL, accepted for a bucket miner.
pub const MAX_SR2_PRICE: u64 = 100_000_000_000;

const ASK_CACHE_SIZE: usize = 256;
const ASK_CACHE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MinersBuckets {
    #[serde(default, alias = "buckets")]
    pub buckets: Vec<Bucket>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Bucket {
    #[serde(default, alias = "amount")]
    pub amount: i64,
    #[serde(default, alias = "minerAddresses")]
    pub miner_addresses: Vec<String>,
}

/// Selects miners from remotely published region buckets.
pub struct Sr2 {
    url: String,
    http: reqwest::Client,
    api: SharedLotus,
    asks: Option<Arc<AskRunner>>,
    cache: Mutex<LruCache<String, (Instant, QueryAsk)>>,
}

impl Sr2 {
    /// Builds the selector and checks the bucket descriptor is reachable.
    pub async fn new(url: &str, api: SharedLotus, asks: Option<Arc<AskRunner>>) -> Result<Self> {
        url::Url::parse(url)
            .map_err(|err| Error::InvalidConfig(format!("invalid sr2 url {url}: {err}")))?;
        let selector = Self {
            url: url.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            api,
            asks,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(ASK_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        };
        let buckets = selector.buckets().await?;
        info!(buckets = buckets.buckets.len(), "Loaded sr2 miner buckets");
        Ok(selector)
    }

    pub async fn buckets(&self) -> Result<MinersBuckets> {
        let buckets = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<MinersBuckets>()
            .await?;
        Ok(buckets)
    }

    async fn ask(&self, miner: &str) -> Result<QueryAsk> {
        if let Some(asks) = &self.asks {
            if let Some(ask) = asks.get().storage.get(miner) {
                return Ok(ask.clone());
            }
        }
        let cached = self.cache.lock().get(miner).cloned();
        if let Some((at, ask)) = cached {
            if at.elapsed() < ASK_CACHE_TTL {
                return Ok(ask);
            }
        }
        let ask = query_ask(&self.api, miner, QUERY_ASK_TIMEOUT).await?;
        self.cache
            .lock()
            .put(miner.to_string(), (Instant::now(), ask.clone()));
        Ok(ask)
    }

    async fn pick(
        &self,
        filter: &MinerSelectorFilter,
        mut miners: Vec<String>,
        amount: usize,
    ) -> Vec<MinerProposal> {
        miners.shuffle(&mut rand::thread_rng());
        let mut picked = Vec::with_capacity(amount);
        for miner in miners {
            if picked.len() == amount {
                break;
            }
            if filter.excluded_miners.contains(&miner) {
                continue;
            }
            let ask = match self.ask(&miner).await {
                Ok(ask) => ask,
                Err(err) => {
                    warn!(miner = %miner, error = %err, "Sr2 miner query-ask failed");
                    continue;
                }
            };
            let price = ask_price(&ask, filter.verified_deal);
            if price > MAX_SR2_PRICE {
                warn!(miner = %miner, price, "Skipping sr2 miner above the maximum price");
                continue;
            }
            if filter.max_price > 0 && price > filter.max_price {
                warn!(miner = %miner, price, max_price = filter.max_price, "Skipping sr2 miner above max price");
                continue;
            }
            if !fits_piece_size(&ask, filter.piece_size) {
                warn!(miner = %miner, piece_size = filter.piece_size, "Skipping sr2 miner outside piece size bounds");
                continue;
            }
            picked.push(MinerProposal {
                addr: miner,
                epoch_price: price,
            });
        }
        picked
    }
}

#[async_trait]
impl MinerSelector for Sr2 {
    async fn get_miners(
        &self,
        n: usize,
        filter: &MinerSelectorFilter,
    ) -> Result<Vec<MinerProposal>> {
        let buckets = self.buckets().await?;
        let mut selected = Vec::new();
        for bucket in buckets.buckets {
            let amount = bucket.amount.clamp(0, bucket.miner_addresses.len() as i64) as usize;
            selected.extend(self.pick(filter, bucket.miner_addresses, amount).await);
        }
        if selected.is_empty() || selected.len() < n {
            return Err(Error::NotEnoughMiners {
                wanted: n,
                found: selected.len(),
            });
        }
        selected.truncate(n.max(1));
        Ok(selected)
    }

    async fn get_replication_factor(&self) -> Result<Option<usize>> {
        let buckets = self.buckets().await?;
        let total: i64 = buckets.buckets.iter().map(|b| b.amount.max(0)).sum();
        Ok(Some(total as usize))
    }
}
