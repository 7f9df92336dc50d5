//! # Miner index
//!
//! Two sub-indices sharing one store:
//!
//! - **on-chain**: power share, sector size and sector counts of every miner
//! - **meta**: user agent and geolocation of miners with positive power
//!
//! Each rebuild of either sub-index emits one signal to listeners.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{gauge, histogram};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::MinerIndexConfig;
use crate::datastore::{Key, NamespacedDatastore, SharedDatastore};
use crate::error::Result;
use crate::iplocation::{Location, SharedLocationResolver};
use crate::lotus::{ChainEpoch, SharedLotus};
use crate::signaler::{Listener, Signaler};

mod meta;
mod onchain;
pub mod store;

pub use meta::merge as merge_meta;
pub use store::MinerStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnChainMinerData {
    pub power: u128,
    pub relative_power: f64,
    pub sector_size: u64,
    pub sectors_live: u64,
    pub sectors_active: u64,
    pub sectors_faulty: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainIndex {
    /// Chain height the snapshot was taken at.
    pub last_updated: ChainEpoch,
    pub miners: BTreeMap<String, OnChainMinerData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub last_updated: Option<DateTime<Utc>>,
    pub user_agent: String,
    pub location: Location,
    pub online: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaIndex {
    pub info: BTreeMap<String, Meta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinerIndex {
    pub meta: MetaIndex,
    pub on_chain: ChainIndex,
}

pub struct MinerRunner {
    config: MinerIndexConfig,
    api: SharedLotus,
    resolver: Option<SharedLocationResolver>,
    store: MinerStore,
    index: RwLock<MinerIndex>,
    signaler: Signaler,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MinerRunner {
    /// Loads the persisted index under `/index/miner`.
    pub async fn new(
        ds: SharedDatastore,
        api: SharedLotus,
        resolver: Option<SharedLocationResolver>,
        config: MinerIndexConfig,
    ) -> Result<Arc<Self>> {
        let scoped = Arc::new(NamespacedDatastore::new(ds, Key::new("/index/miner")));
        let store = MinerStore::new(scoped, config.flush_batch_size);
        let index = store.get_index().await?;
        info!(
            miners = index.on_chain.miners.len(),
            height = index.on_chain.last_updated,
            "Loaded persisted miner index"
        );
        Ok(Arc::new(Self {
            config,
            api,
            resolver,
            store,
            index: RwLock::new(index),
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

    pub fn get(&self) -> MinerIndex {
        self.index.read().clone()
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
        info!("Miner index closed");
    }

    #[instrument(skip_all, name = "miner_index")]
    async fn run(&self) {
        if self.config.refresh_on_start && !self.config.disable {
            self.refresh_all().await;
        }
        let interval = Duration::from_secs(self.config.refresh_interval_seconds);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Miner index shutdown requested");
                    break;
                }
                _ = sleep(interval) => {
                    if self.config.disable {
                        debug!("Miner index refresh skipped; disabled");
                        continue;
                    }
                    self.refresh_all().await;
                }
            }
        }
    }

    async fn refresh_all(&self) {
        if let Err(err) = self.refresh_on_chain().await {
            error!(error = ?err, "On-chain miner index refresh failed");
        }
        if let Err(err) = self.refresh_meta().await {
            error!(error = ?err, "Miner metadata refresh failed");
        }
    }

    /// Rebuilds and persists the on-chain sub-index.
    pub async fn refresh_on_chain(&self) -> Result<()> {
        let started = Instant::now();
        let chain = onchain::build(&self.api, self.config.onchain_max_parallel, &self.shutdown).await?;
        self.store.save_on_chain(&chain).await?;

        gauge!("miner_index_miners").set(chain.miners.len() as f64);
        let (miners, height) = (chain.miners.len(), chain.last_updated);
        self.index.write().on_chain = chain;
        self.signaler.signal();

        histogram!("miner_index_refresh_duration_ms", "subindex" => "onchain")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        info!(miners, height, "On-chain miner index updated");
        Ok(())
    }

    /// Refreshes metadata of every miner with positive power.
    pub async fn refresh_meta(&self) -> Result<()> {
        let started = Instant::now();
        let (addrs, previous) = {
            let index = self.index.read();
            let addrs: Vec<String> = index
                .on_chain
                .miners
                .iter()
                .filter(|(_, data)| data.power > 0)
                .map(|(addr, _)| addr.clone())
                .collect();
            (addrs, index.meta.clone())
        };

        let fresh = meta::build(
            &self.api,
            self.resolver.as_ref(),
            addrs,
            &previous,
            self.config.meta_max_parallel,
            &self.shutdown,
        )
        .await?;
        self.store.save_meta(&fresh).await?;

        let resolved = fresh.info.len();
        self.index.write().meta.info.extend(fresh.info);
        self.signaler.signal();

        histogram!("miner_index_refresh_duration_ms", "subindex" => "meta")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        info!(resolved, "Miner metadata index updated");
        Ok(())
    }
}
