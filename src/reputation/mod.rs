//! # Reputation
//!
//! Ranks miners by combining the miner, faults and ask indices with weighted
//! external sources:
//!
//! `score = 50·faults + 20·power + 20·external + 10·ask`
//!
//! - `faults`: `2^-n` for a miner with `n` recorded fault epochs
//! - `power`: relative raw byte power
//! - `external`: sum of `weight · score` over sources that know the miner
//! - `ask`: 1 when the miner's ask is below the median price
//!
//! Scores are rebuilt whenever any index signals an update.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::datastore::SharedDatastore;
use crate::error::{Error, Result};
use crate::index::{AskIndex, AskRunner, FaultsIndex, FaultsRunner, MinerIndex, MinerRunner};

pub mod source;

pub use source::{Source, SourceError, SourceStore};

const SOURCES_REFRESH_INTERVAL: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerScore {
    pub addr: String,
    pub score: i64,
}

/// Scores a single miner against index snapshots and external sources.
pub fn calculate_score(
    addr: &str,
    miners: &MinerIndex,
    faults: &FaultsIndex,
    asks: &AskIndex,
    sources: &[Source],
) -> MinerScore {
    let power_score = miners
        .on_chain
        .miners
        .get(addr)
        .map(|m| m.relative_power)
        .unwrap_or_default();

    let faults_score = faults
        .miners
        .get(addr)
        .map(|f| 2f64.powi(-(f.epochs.len().min(i32::MAX as usize) as i32)))
        .unwrap_or(1.0);

    let external_score: f64 = sources
        .iter()
        .filter_map(|s| s.scores.get(addr).map(|score| s.weight * score))
        .sum();

    let ask_score = match asks.storage.get(addr) {
        Some(ask) if ask.price < asks.storage_median_price => 1.0,
        _ => 0.0,
    };

    let score = 50.0 * faults_score + 20.0 * power_score + 20.0 * external_score + 10.0 * ask_score;
    MinerScore {
        addr: addr.to_string(),
        score: score as i64,
    }
}

/// Ranks every miner with a known ask, best first.
pub fn rank(
    miners: &MinerIndex,
    faults: &FaultsIndex,
    asks: &AskIndex,
    sources: &[Source],
) -> Vec<MinerScore> {
    let mut scores: Vec<MinerScore> = asks
        .storage
        .keys()
        .map(|addr| calculate_score(addr, miners, faults, asks, sources))
        .collect();
    scores.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.addr.cmp(&b.addr)));
    scores
}

pub struct Reputation {
    sources: SourceStore,
    http: reqwest::Client,
    miner_index: Arc<MinerRunner>,
    faults_index: Arc<FaultsRunner>,
    ask_index: Arc<AskRunner>,
    scores: RwLock<Vec<MinerScore>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Reputation {
    pub fn new(
        ds: SharedDatastore,
        miner_index: Arc<MinerRunner>,
        faults_index: Arc<FaultsRunner>,
        ask_index: Arc<AskRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sources: SourceStore::new(ds),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            miner_index,
            faults_index,
            ask_index,
            scores: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Builds the initial ranking and spawns the index subscriber and the
    /// source refresher.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.rebuild().await?;
        let subscriber = {
            let rm = Arc::clone(self);
            tokio::spawn(async move { rm.subscribe_indices().await })
        };
        let refresher = {
            let rm = Arc::clone(self);
            tokio::spawn(async move { rm.refresh_sources_loop().await })
        };
        self.workers.lock().extend([subscriber, refresher]);
        Ok(())
    }

    pub async fn add_source(&self, source: Source) -> Result<()> {
        self.sources.add(&source).await.map_err(|err| match err {
            SourceError::AlreadyExists(_) | SourceError::InvalidWeight(_) => {
                Error::InvalidConfig(err.to_string())
            }
            other => Error::Internal(other.to_string()),
        })
    }

    /// Ranked miners with trusted miners first, excluding `excluded` and,
    /// when `country_codes` is non-empty, miners located elsewhere.
    pub fn query_miners(
        &self,
        excluded: &[String],
        country_codes: &[String],
        trusted: &[String],
    ) -> Vec<MinerScore> {
        let scores = self.scores.read();
        let mut res: Vec<MinerScore> = trusted
            .iter()
            .filter_map(|t| scores.iter().find(|s| &s.addr == t).cloned())
            .collect();

        let meta = if country_codes.is_empty() {
            None
        } else {
            Some(self.miner_index.get().meta)
        };
        for score in scores.iter() {
            if trusted.contains(&score.addr) || excluded.contains(&score.addr) {
                continue;
            }
            if let Some(meta) = &meta {
                let Some(info) = meta.info.get(&score.addr) else {
                    continue;
                };
                if !country_codes.contains(&info.location.country) {
                    continue;
                }
            }
            res.push(score.clone());
        }
        res
    }

    pub fn get_top_miners(&self, n: usize) -> Result<Vec<MinerScore>> {
        if n == 0 {
            return Err(Error::InvalidConfig(
                "the number of miners should be greater than zero".to_string(),
            ));
        }
        Ok(self.scores.read().iter().take(n).cloned().collect())
    }

    pub async fn close(&self) {
        self.shutdown.cancel();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.await;
        }
        info!("Reputation module closed");
    }

    /// Recomputes scores from the current index snapshots.
    pub async fn rebuild(&self) -> Result<()> {
        let started = Instant::now();
        let sources = self
            .sources
            .get_all()
            .await
            .map_err(|err| Error::Internal(err.to_string()))?;
        let scores = rank(
            &self.miner_index.get(),
            &self.faults_index.get(),
            &self.ask_index.get(),
            &sources,
        );
        let count = scores.len();
        *self.scores.write() = scores;
        info!(
            miners = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rebuilt reputation scores"
        );
        Ok(())
    }

    #[instrument(skip_all, name = "reputation_subscriber")]
    async fn subscribe_indices(&self) {
        let mut miners = self.miner_index.listen();
        let mut faults = self.faults_index.listen();
        let mut asks = self.ask_index.listen();
        loop {
            let source = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(()) = miners.recv() => "miner",
                Some(()) = faults.recv() => "faults",
                Some(()) = asks.recv() => "ask",
                else => break,
            };
            debug!(index = source, "Index updated; rebuilding scores");
            if let Err(err) = self.rebuild().await {
                error!(error = ?err, "Rebuilding reputation scores failed");
            }
        }
        self.miner_index.unregister(&miners);
        self.faults_index.unregister(&faults);
        self.ask_index.unregister(&asks);
    }

    #[instrument(skip_all, name = "reputation_sources")]
    async fn refresh_sources_loop(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(SOURCES_REFRESH_INTERVAL) => self.refresh_sources().await,
            }
        }
    }

    pub async fn refresh_sources(&self) {
        let sources = match self.sources.get_all().await {
            Ok(sources) => sources,
            Err(err) => {
                error!(error = ?err, "Listing reputation sources failed");
                return;
            }
        };
        let refreshes = sources.into_iter().map(|mut source| async move {
            if let Err(err) = source.refresh(&self.http).await {
                warn!(source = %source.id, error = %err, "Refreshing reputation source failed");
                return;
            }
            if let Err(err) = self.sources.update(&source).await {
                warn!(source = %source.id, error = %err, "Persisting reputation source failed");
            }
        });
        join_all(refreshes).await;
        debug!("Reputation sources refreshed");
    }
}
