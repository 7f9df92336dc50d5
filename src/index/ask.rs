//! # Ask index
//!
//! Periodic full scan of storage asks from every miner with on-chain power.
//! The persisted snapshot is kept together with a price-ordered view that
//! serves [`AskRunner::query`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use metrics::{gauge, histogram};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AskIndexConfig;
use crate::datastore::{Key, SharedDatastore};
use crate::error::{Error, Result};
use crate::lotus::{QueryAsk, SharedLotus, TipSetKey};
use crate::signaler::{Listener, Signaler};

pub type StorageAsk = QueryAsk;

/// Persisted ask snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AskIndex {
    pub last_updated: Option<DateTime<Utc>>,
    pub storage_median_price: u64,
    pub storage: BTreeMap<String, StorageAsk>,
}

/// Filter over the price-ordered asks. Zero values disable a constraint.
#[derive(Debug, Clone, Copy, Default)]
pub struct Query {
    pub max_price: u64,
    pub piece_size: u64,
    pub limit: usize,
    pub offset: usize,
}

struct State {
    index: AskIndex,
    ordered: Vec<StorageAsk>,
}

pub struct AskRunner {
    config: AskIndexConfig,
    api: SharedLotus,
    ds: SharedDatastore,
    state: RwLock<State>,
    signaler: Signaler,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

pub fn state_key() -> Key {
    Key::new("/index/ask/state")
}

fn ordered_asks(storage: &BTreeMap<String, StorageAsk>) -> Vec<StorageAsk> {
    let mut ordered: Vec<StorageAsk> = storage.values().cloned().collect();
    ordered.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.miner.cmp(&b.miner)));
    ordered
}

/// Median of a price-ordered slice; mean of the two middle prices for even lengths.
pub fn median_price(ordered: &[StorageAsk]) -> u64 {
    let len = ordered.len();
    match len {
        0 => 0,
        _ if len % 2 == 1 => ordered[len / 2].price,
        _ => (ordered[len / 2 - 1].price + ordered[len / 2].price) / 2,
    }
}

impl AskRunner {
    /// Loads the persisted index. Call [`AskRunner::start`] to begin refreshing.
    pub async fn new(
        ds: SharedDatastore,
        api: SharedLotus,
        config: AskIndexConfig,
    ) -> Result<Arc<Self>> {
        let index: AskIndex = match ds.get(&state_key()).await? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => AskIndex::default(),
        };
        info!(entries = index.storage.len(), "Loaded persisted ask index");
        let ordered = ordered_asks(&index.storage);
        Ok(Arc::new(Self {
            config,
            api,
            ds,
            state: RwLock::new(State { index, ordered }),
            signaler: Signaler::new(),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }))
    }

    pub fn start(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        let handle = tokio::spawn(async move { runner.run().await });
        *self.worker.lock() = Some(handle);
    }

    /// Copy of the current index.
    pub fn get(&self) -> AskIndex {
        self.state.read().index.clone()
    }

    pub fn query(&self, q: Query) -> Vec<StorageAsk> {
        let state = self.state.read();
        let mut res = Vec::new();
        let mut offset = q.offset;
        for ask in &state.ordered {
            if q.max_price != 0 && ask.price > q.max_price {
                break;
            }
            // A zero max size means the ask doesn't bound it.
            if q.piece_size != 0
                && (ask.min_piece_size > q.piece_size
                    || (ask.max_piece_size != 0 && ask.max_piece_size < q.piece_size))
            {
                continue;
            }
            if offset > 0 {
                offset -= 1;
                continue;
            }
            res.push(ask.clone());
            if q.limit != 0 && res.len() == q.limit {
                break;
            }
        }
        res
    }

    pub fn listen(&self) -> Listener {
        self.signaler.listen()
    }

    pub fn unregister(&self, listener: &Listener) {
        self.signaler.unregister(listener.id);
    }

    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.signaler.close();
        info!("Ask index closed");
    }

    #[instrument(skip_all, name = "ask_index")]
    async fn run(&self) {
        if self.config.refresh_on_start
            && !self.config.disable
            && let Err(err) = self.refresh().await
        {
            error!(error = ?err, "Ask index refresh failed");
        }
        let interval = Duration::from_secs(self.config.refresh_interval_seconds);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Ask index shutdown requested");
                    break;
                }
                _ = sleep(interval) => {
                    if self.config.disable {
                        debug!("Ask index refresh skipped; disabled");
                        continue;
                    }
                    if let Err(err) = self.refresh().await {
                        error!(error = ?err, "Ask index refresh failed");
                    }
                }
            }
        }
    }

    /// Rebuilds the index from a full scan of on-chain miners.
    pub async fn refresh(&self) -> Result<()> {
        let started = Instant::now();
        let head = TipSetKey::default();
        let miners = self.api.state_list_miners(&head).await?;
        let total = miners.len().max(1) as f64;
        let ask_timeout = Duration::from_secs(self.config.query_ask_timeout_seconds);

        let mut storage = BTreeMap::new();
        let mut done = 0usize;
        let mut results = stream::iter(miners)
            .map(|miner| {
                let api = self.api.clone();
                async move { fetch_storage_ask(api, miner, ask_timeout).await }
            })
            .buffer_unordered(self.config.max_parallel);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::Canceled),
                next = results.next() => {
                    let Some(result) = next else { break };
                    done += 1;
                    gauge!("ask_index_progress").set(done as f64 / total);
                    if let Some(ask) = result {
                        storage.insert(ask.miner.clone(), ask);
                    }
                }
            }
        }
        gauge!("ask_index_progress").set(1.0);

        if storage.is_empty() {
            warn!("Ignoring ask index save since no asks were collected");
            return Ok(());
        }

        let ordered = ordered_asks(&storage);
        let index = AskIndex {
            last_updated: Some(Utc::now()),
            storage_median_price: median_price(&ordered),
            storage,
        };
        self.ds
            .put(&state_key(), serde_json::to_vec(&index)?)
            .await?;

        gauge!("ask_index_asks").set(index.storage.len() as f64);
        {
            let mut state = self.state.write();
            state.index = index;
            state.ordered = ordered;
        }
        self.signaler.signal();

        histogram!("ask_index_refresh_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        info!(
            asks = self.state.read().ordered.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ask index updated"
        );
        Ok(())
    }
}

/// Queries one miner's ask; miners without power or a peer id are skipped.
async fn fetch_storage_ask(api: SharedLotus, miner: String, limit: Duration) -> Option<StorageAsk> {
    let work = async {
        let head = TipSetKey::default();
        let power = match api.state_miner_power(&miner, &head).await {
            Ok(power) => power,
            Err(err) => {
                debug!(miner = %miner, error = %err, "Getting miner power failed");
                return None;
            }
        };
        if power.miner_power.raw_byte_power == 0 {
            return None;
        }
        let info = match api.state_miner_info(&miner, &head).await {
            Ok(info) => info,
            Err(err) => {
                debug!(miner = %miner, error = %err, "Getting miner info failed");
                return None;
            }
        };
        let peer_id = info.peer_id?;
        api.client_query_ask(&peer_id, &miner).await.ok()
    };
    timeout(limit, work).await.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ask(miner: &str, price: u64, min: u64) -> StorageAsk {
        StorageAsk {
            miner: miner.to_string(),
            price,
            min_piece_size: min,
            max_piece_size: 1 << 35,
            ..StorageAsk::default()
        }
    }

    #[test]
    fn median_handles_odd_and_even() {
        assert_eq!(median_price(&[]), 0);
        assert_eq!(median_price(&[ask("a", 10, 0)]), 10);
        assert_eq!(
            median_price(&[ask("a", 10, 0), ask("b", 20, 0), ask("c", 90, 0)]),
            20
        );
        assert_eq!(
            median_price(&[ask("a", 10, 0), ask("b", 20, 0), ask("c", 40, 0), ask("d", 90, 0)]),
            30
        );
    }

    #[test]
    fn ordering_is_by_price_then_miner() {
        let mut storage = BTreeMap::new();
        for a in [ask("f03", 5, 0), ask("f01", 9, 0), ask("f02", 5, 0)] {
            storage.insert(a.miner.clone(), a);
        }
        let miners: Vec<_> = ordered_asks(&storage)
            .into_iter()
            .map(|a| a.miner)
            .collect();
        assert_eq!(miners, vec!["f02", "f03", "f01"]);
    }
}
