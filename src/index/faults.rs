//! # Faults index
//!
//! Accumulates per-miner fault epochs by walking the chain from the last
//! checkpoint up to `head - 20`. Progress is checkpointed through the
//! [`Chainstore`] every section of at most 2000 tipsets so that a reorg never
//! leaves faults from an orphaned fork in the index.
//!
//! Lotus nodes commonly ship with the fault enumeration RPC disabled, so the
//! background loop only runs when `FAULTS_INDEX_ENABLED` is set.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{gauge, histogram};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::chainstore::Chainstore;
use crate::chainsync::ChainSync;
use crate::config::FaultsIndexConfig;
use crate::datastore::{Key, NamespacedDatastore, SharedDatastore};
use crate::error::{Error, Result};
use crate::lotus::{ChainEpoch, SharedLotus};
use crate::signaler::{Listener, Signaler};

/// Tipsets behind the head the index trails, to stay clear of shallow reorgs.
pub const HEIGHT_OFFSET: ChainEpoch = 20;

/// Maximum tipsets covered by one fault query and checkpoint.
pub const BATCH_SIZE: usize = 2000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Faults {
    pub epochs: Vec<ChainEpoch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultsIndex {
    pub tipset_key: String,
    pub miners: BTreeMap<String, Faults>,
}

pub struct FaultsRunner {
    config: FaultsIndexConfig,
    api: SharedLotus,
    sync: ChainSync,
    store: Chainstore,
    index: RwLock<FaultsIndex>,
    signaler: Signaler,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FaultsRunner {
    pub async fn new(
        ds: SharedDatastore,
        api: SharedLotus,
        config: FaultsIndexConfig,
    ) -> Result<Arc<Self>> {
        let sync = ChainSync::new(api.clone());
        let scoped = Arc::new(NamespacedDatastore::new(ds, Key::new("/chainstore/faults")));
        let store = Chainstore::new(scoped, Arc::new(sync.clone()));

        let mut index = FaultsIndex::default();
        store.get_last_checkpoint(&mut index).await?;
        info!(miners = index.miners.len(), "Loaded persisted faults index");

        Ok(Arc::new(Self {
            config,
            api,
            sync,
            store,
            index: RwLock::new(index),
            signaler: Signaler::new(),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }))
    }

    /// Starts the background loop when the index is enabled.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Faults index disabled; serving persisted snapshot only");
            return;
        }
        let runner = Arc::clone(self);
        let handle = tokio::spawn(async move { runner.run().await });
        *self.worker.lock() = Some(handle);
    }

    pub fn get(&self) -> FaultsIndex {
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
        info!("Faults index closed");
    }

    #[instrument(skip_all, name = "faults_index")]
    async fn run(&self) {
        if let Err(err) = self.refresh().await {
            error!(error = ?err, "Initial faults index refresh failed");
        }
        let interval = Duration::from_secs(self.config.refresh_interval_seconds);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Faults index shutdown requested");
                    break;
                }
                _ = sleep(interval) => {
                    if let Err(err) = self.refresh().await {
                        error!(error = ?err, "Faults index refresh failed");
                    }
                }
            }
        }
    }

    /// Advances the index up to `head - HEIGHT_OFFSET`.
    pub async fn refresh(&self) -> Result<()> {
        let head = self.api.chain_head().await?;
        let target_height = head.height - HEIGHT_OFFSET;
        if target_height <= 0 {
            info!(height = head.height, "Chain too young for faults index");
            return Ok(());
        }
        let target = self
            .api
            .chain_get_tipset_by_height(target_height, &head.key)
            .await?;

        let mut index = FaultsIndex::default();
        let base = self.store.load_and_prune(&target.key, &mut index).await?;
        let resolved = self.sync.resolve_base(base.as_ref(), &target.key).await?;
        let path = resolved.path;

        let started = Instant::now();
        for (n, section) in path.chunks(BATCH_SIZE).enumerate() {
            if self.shutdown.is_cancelled() {
                return Err(Error::Canceled);
            }
            let Some(section_head) = section.last() else {
                continue;
            };
            let faults = self
                .api
                .state_all_miner_faults(section.len() as ChainEpoch, &section_head.key)
                .await?;
            index.tipset_key = section_head.key.to_string();
            for fault in faults {
                index
                    .miners
                    .entry(fault.miner)
                    .or_default()
                    .epochs
                    .push(fault.epoch);
            }

            self.store.save(&section_head.key, &index).await?;
            info!(
                from = section.first().map(|ts| ts.height).unwrap_or_default(),
                to = section_head.height,
                "Processed faults section"
            );
            *self.index.write() = index.clone();
            self.signaler.signal();
            gauge!("faults_index_progress").set((n * BATCH_SIZE) as f64 / path.len() as f64);
        }

        histogram!("faults_index_refresh_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        gauge!("faults_index_height").set(target.height as f64);
        gauge!("faults_index_progress").set(1.0);
        info!(height = target.height, "Faults index updated");
        Ok(())
    }
}
