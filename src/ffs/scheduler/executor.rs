//! # Executor
//!
//! Converges a cid towards the [`StorageConfig`](crate::ffs::types::StorageConfig)
//! carried by a storage job, and runs retrievals.
//!
//! The executor never touches job records. It reports deal progress through
//! channels and returns an [`Execution`] that the scheduler persists. The only
//! store it writes is the started-deals registry, which lets a restarted
//! daemon keep watching proposals that were already on their way.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::sjstore::SjStore;
use crate::error::{Error, Result};
use crate::ffs::interfaces::{
    FetchRequest, SharedColdStorage, SharedHotStorage, SharedMinerSelector,
};
use crate::ffs::joblogger::{JobLogger, LogContext};
use crate::ffs::types::{
    DealError, FilConfig, FilStorage, HotInfo, IpfsHotInfo, RetrievalId, RetrievalInfo,
    RetrievalJob, StorageInfo, StorageJob,
};
use crate::lotus::{Cid, DealInfo};

/// Inputs of one storage execution.
pub struct StorageTask<'a> {
    pub job: &'a StorageJob,
    /// Fires when the job is canceled or the daemon shuts down.
    pub cancel: &'a CancellationToken,
    /// Fires only when the daemon shuts down.
    pub shutdown: &'a CancellationToken,
    pub deal_updates: mpsc::Sender<DealInfo>,
    pub deal_errors: mpsc::Sender<DealError>,
}

/// Outcome of a storage execution.
#[derive(Debug)]
pub struct Execution {
    /// Placement to persist. `None` when nothing could be established.
    pub info: Option<StorageInfo>,
    pub deal_errors: Vec<DealError>,
    pub result: Result<()>,
}

pub struct Executor {
    hot: SharedHotStorage,
    cold: SharedColdStorage,
    selector: SharedMinerSelector,
    sjs: Arc<SjStore>,
    logger: Arc<JobLogger>,
    deal_timeout: Duration,
}

impl Executor {
    pub fn new(
        hot: SharedHotStorage,
        cold: SharedColdStorage,
        selector: SharedMinerSelector,
        sjs: Arc<SjStore>,
        logger: Arc<JobLogger>,
        deal_timeout: Duration,
    ) -> Self {
        Self {
            hot,
            cold,
            selector,
            sjs,
            logger,
            deal_timeout,
        }
    }

    #[instrument(skip_all, fields(job_id = %task.job.id, user_id = %task.job.user_id, cid = %task.job.cid))]
    pub async fn execute_storage(
        &self,
        task: &StorageTask<'_>,
        prev: Option<StorageInfo>,
    ) -> Execution {
        let job = task.job;
        let ctx = LogContext::new(job.user_id.clone(), job.cid.clone()).with_job(job.id.clone());
        let mut deal_errors = Vec::new();

        let mut current = match self.refreshed_info(job, prev).await {
            Ok(info) => info,
            Err(err) => {
                return Execution {
                    info: None,
                    deal_errors,
                    result: Err(err),
                };
            }
        };

        self.logger
            .log(&ctx, "Ensuring hot storage satisfies the configuration...")
            .await;
        current.hot = match self.execute_hot(&ctx, task, &current).await {
            Ok(hot) => hot,
            Err(err) => {
                self.logger
                    .log(&ctx, format!("Hot storage execution failed: {err}"))
                    .await;
                return Execution {
                    info: None,
                    deal_errors,
                    result: Err(err),
                };
            }
        };
        self.logger
            .log(&ctx, "Hot storage execution ran successfully.")
            .await;

        self.logger
            .log(&ctx, "Ensuring cold storage satisfies the configuration...")
            .await;
        let result = self
            .execute_cold(&ctx, task, &mut current, &mut deal_errors)
            .await;
        match &result {
            Ok(()) => {
                self.logger
                    .log(&ctx, "Cold storage execution ran successfully.")
                    .await
            }
            Err(err) => {
                self.logger
                    .log(&ctx, format!("Cold storage execution failed: {err}"))
                    .await
            }
        }

        current.job_id = job.id.clone();
        current.created = Some(Utc::now());
        Execution {
            info: Some(current),
            deal_errors,
            result,
        }
    }

    /// Previous placement re-checked against hot and cold storage.
    async fn refreshed_info(
        &self,
        job: &StorageJob,
        prev: Option<StorageInfo>,
    ) -> Result<StorageInfo> {
        let Some(mut info) = prev else {
            return Ok(StorageInfo {
                user_id: job.user_id.clone(),
                job_id: job.id.clone(),
                cid: job.cid.clone(),
                ..StorageInfo::default()
            });
        };
        info.hot.enabled =
            info.hot.enabled && self.hot.is_pinned(&job.user_id, &job.cid).await?;

        let mut active = Vec::with_capacity(info.cold.filecoin.proposals.len());
        for proposal in std::mem::take(&mut info.cold.filecoin.proposals) {
            // Imported deals may lack a proposal cid; they're trusted as is.
            if proposal.proposal_cid.is_undef()
                || self.cold.is_deal_active(&proposal.proposal_cid).await?
            {
                active.push(proposal);
            }
        }
        info.cold.filecoin.proposals = active;
        Ok(info)
    }

    async fn execute_hot(
        &self,
        ctx: &LogContext,
        task: &StorageTask<'_>,
        curr: &StorageInfo,
    ) -> Result<HotInfo> {
        let job = task.job;
        let cfg = &job.config.hot;
        if cfg.enabled == curr.hot.enabled {
            self.logger.log(ctx, "No actions needed in hot storage.").await;
            return Ok(curr.hot.clone());
        }

        if !cfg.enabled {
            let referenced = self.sjs.cid_referenced_by_others(&job.cid, &job.id).await;
            self.hot.unpin(&job.user_id, &job.cid, referenced).await?;
            self.logger
                .log(ctx, "Cid successfully removed from hot storage.")
                .await;
            return Ok(HotInfo::default());
        }

        let limit = Duration::from_secs(cfg.ipfs.add_timeout.max(1) as u64);
        let replaced = match &job.replaced_cid {
            Some(old) if self.hot.is_pinned(&job.user_id, old).await? => Some(old),
            _ => None,
        };
        let pinned = match replaced {
            Some(old) => {
                self.logger
                    .log(ctx, format!("Replacing previous pin {old}"))
                    .await;
                guarded(task.cancel, limit, self.hot.replace(&job.user_id, old, &job.cid)).await
            }
            None => guarded(task.cancel, limit, self.hot.pin(&job.user_id, &job.cid)).await,
        };

        let size = match pinned {
            Ok(size) => size,
            Err(err) if err.is_canceled() => return Err(err),
            Err(err) => {
                self.logger
                    .log(ctx, format!("Direct fetching from IPFS wasn't possible: {err}"))
                    .await;
                if !cfg.allow_unfreeze || curr.cold.filecoin.proposals.is_empty() {
                    self.logger
                        .log(ctx, "Unfreeze is disabled or active Filecoin deals are unavailable.")
                        .await;
                    return Err(err);
                }
                self.unfreeze(ctx, task, curr, limit).await?
            }
        };

        Ok(HotInfo {
            enabled: true,
            size,
            ipfs: IpfsHotInfo {
                created: Some(Utc::now()),
            },
        })
    }

    /// Retrieves the data from the miners holding it and pins it.
    async fn unfreeze(
        &self,
        ctx: &LogContext,
        task: &StorageTask<'_>,
        curr: &StorageInfo,
        limit: Duration,
    ) -> Result<u64> {
        let job = task.job;
        let filecoin = &curr.cold.filecoin;
        let data_cid = if filecoin.data_cid.is_undef() {
            job.cid.clone()
        } else {
            filecoin.data_cid.clone()
        };
        let request = FetchRequest {
            data_cid: data_cid.clone(),
            piece_cid: filecoin
                .proposals
                .iter()
                .map(|p| p.piece_cid.clone())
                .find(|c| !c.is_undef()),
            wallet: job.config.cold.filecoin.addr.clone(),
            miners: filecoin.proposals.iter().map(|p| p.miner.clone()).collect(),
            max_price: job.config.hot.unfreeze_max_price,
            selector: String::new(),
        };

        self.logger.log(ctx, "Unfreezing from Filecoin...").await;
        let fetched = self.cold.fetch(&request, task.cancel).await?;
        self.logger
            .log(
                ctx,
                format!(
                    "Unfrozen successfully from {} with cost {} attoFIL, saving in hot storage...",
                    fetched.retrieved_miner, fetched.funds_spent
                ),
            )
            .await;
        guarded(task.cancel, limit, self.hot.pin(&job.user_id, &data_cid)).await
    }

    async fn execute_cold(
        &self,
        ctx: &LogContext,
        task: &StorageTask<'_>,
        current: &mut StorageInfo,
        errors: &mut Vec<DealError>,
    ) -> Result<()> {
        let job = task.job;
        let cfg = &job.config.cold;
        if !cfg.enabled {
            self.logger
                .log(ctx, "Cold storage is disabled, existing Filecoin deals will eventually expire.")
                .await;
            return Ok(());
        }

        // Deals accepted before the daemon stopped are watched again first.
        let started = self.sjs.get_started_deals(&job.user_id, &job.cid).await?;
        if !started.is_empty() {
            self.logger
                .log(ctx, format!("Resuming {} detached executing deals...", started.len()))
                .await;
            let (ok, failed) = self.wait_for_deals(ctx, task, &started).await;
            self.logger
                .log(ctx, format!("{} resumed deals finished successfully.", ok.len()))
                .await;
            errors.extend(failed);
            if task.shutdown.is_cancelled() {
                return Err(Error::Canceled);
            }
            self.sjs
                .remove_started_deals(&job.user_id, &job.cid)
                .await?;
            if !ok.is_empty() {
                current.cold.enabled = true;
                current.cold.filecoin.data_cid = job.cid.clone();
                current.cold.filecoin.proposals.splice(0..0, ok);
            }
        }

        let mut fil_cfg = cfg.filecoin.clone();
        if fil_cfg.renew.enabled {
            self.renew(ctx, task, current, &fil_cfg, errors).await?;
        }

        if let Some(rep_factor) = self.selector.get_replication_factor().await? {
            self.logger
                .log(ctx, format!("Miner selector dictates a replication factor of {rep_factor}."))
                .await;
            fil_cfg.rep_factor = rep_factor;
        }

        let counted = self
            .counted_proposals(&current.cold.filecoin.proposals, &fil_cfg)
            .await?;
        if counted >= fil_cfg.rep_factor {
            self.logger
                .log(ctx, "The current replication factor is equal or higher than desired, avoiding making new deals.")
                .await;
            current.cold.enabled = true;
            return Ok(());
        }

        let delta = delta_config(&fil_cfg, counted, &current.cold.filecoin.proposals);
        self.logger
            .log(
                ctx,
                format!(
                    "Current replication factor is lower than desired, making {} new deals...",
                    delta.rep_factor
                ),
            )
            .await;
        let stored = match self.cold.store(&job.cid, &delta, task.cancel).await {
            Ok(stored) => stored,
            Err(err) => {
                self.logger
                    .log(ctx, format!("Starting deals failed, with cause: {err}"))
                    .await;
                return Err(err);
            }
        };
        for rejected in &stored.rejected {
            self.logger
                .log(
                    ctx,
                    format!("Proposal to miner {} failed: {}", rejected.miner, rejected.message),
                )
                .await;
            let _ = task.deal_errors.try_send(rejected.clone());
        }
        errors.extend(stored.rejected.iter().cloned());
        if stored.accepted.is_empty() {
            return Err(Error::DealsFailed("all proposals were rejected".to_string()));
        }

        self.sjs
            .add_started_deals(&job.user_id, &job.cid, &stored.accepted)
            .await?;
        let (ok, failed) = self.wait_for_deals(ctx, task, &stored.accepted).await;
        errors.extend(failed);
        if task.shutdown.is_cancelled() {
            return Err(Error::Canceled);
        }
        self.sjs
            .remove_started_deals(&job.user_id, &job.cid)
            .await?;

        let confirmed = ok.len();
        let filecoin = &mut current.cold.filecoin;
        filecoin.data_cid = job.cid.clone();
        if stored.piece_size > 0 {
            filecoin.size = stored.piece_size;
        }
        filecoin.proposals.splice(0..0, ok);
        if confirmed > 0 || counted > 0 {
            current.cold.enabled = true;
        }

        if task.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let active = counted + confirmed;
        if active < fil_cfg.rep_factor {
            return Err(Error::DealsFailed(format!(
                "only {active} of {} deals are active",
                fil_cfg.rep_factor
            )));
        }
        Ok(())
    }

    async fn renew(
        &self,
        ctx: &LogContext,
        task: &StorageTask<'_>,
        current: &mut StorageInfo,
        cfg: &FilConfig,
        errors: &mut Vec<DealError>,
    ) -> Result<()> {
        if !current.hot.enabled {
            self.logger
                .log(ctx, "Skipping deal renewals, the data isn't available in hot storage.")
                .await;
            return Ok(());
        }
        self.logger.log(ctx, "Checking deal renewals...").await;
        let before = current.cold.filecoin.proposals.len();
        match self
            .cold
            .ensure_renewals(
                &task.job.cid,
                current.cold.filecoin.clone(),
                cfg,
                self.deal_timeout,
                task.cancel,
            )
            .await
        {
            Ok((renewed, renew_errors)) => {
                for err in &renew_errors {
                    self.logger
                        .log(ctx, format!("Deal renewal errored. Miner: {}, Cause: {}", err.miner, err.message))
                        .await;
                    let _ = task.deal_errors.try_send(err.clone());
                }
                errors.extend(renew_errors);
                let created = renewed.proposals.len().saturating_sub(before);
                if created > 0 {
                    self.logger
                        .log(ctx, format!("A total of {created} new deals were created in the renewal process."))
                        .await;
                }
                current.cold.filecoin = renewed;
                self.logger
                    .log(ctx, "Deal renewal evaluated successfully.")
                    .await;
                Ok(())
            }
            Err(err) if err.is_canceled() => Err(err),
            Err(err) => {
                self.logger
                    .log(ctx, format!("Deal renewal process couldn't be executed: {err}"))
                    .await;
                Ok(())
            }
        }
    }

    /// Active proposals that still satisfy `cfg`: not renewed away, not
    /// from an excluded miner, long enough and not expired.
    async fn counted_proposals(&self, proposals: &[FilStorage], cfg: &FilConfig) -> Result<usize> {
        let dated = |p: &FilStorage| p.start_epoch > 0 && p.duration > 0;
        let epoch = if proposals.iter().any(dated) {
            Some(self.cold.get_current_epoch().await?)
        } else {
            None
        };
        Ok(proposals
            .iter()
            .filter(|p| !p.renewed)
            .filter(|p| !cfg.excluded_miners.contains(&p.miner))
            .filter(|p| p.duration == 0 || p.duration >= cfg.deal_min_duration)
            .filter(|p| match epoch {
                Some(epoch) if dated(p) => p.expiration_epoch() > epoch,
                _ => true,
            })
            .count())
    }

    async fn wait_for_deals(
        &self,
        ctx: &LogContext,
        task: &StorageTask<'_>,
        proposals: &[Cid],
    ) -> (Vec<FilStorage>, Vec<DealError>) {
        self.logger.log(ctx, "Watching deals unfold...").await;
        let waits = proposals.iter().map(|proposal| {
            let updates = task.deal_updates.clone();
            async move {
                let result = self
                    .cold
                    .wait_for_deal(
                        &task.job.cid,
                        proposal,
                        self.deal_timeout,
                        Some(updates),
                        task.cancel,
                    )
                    .await;
                (proposal, result)
            }
        });

        let mut ok = Vec::new();
        let mut failed = Vec::new();
        for (proposal, result) in join_all(waits).await {
            let deal_error = match result {
                Ok(Ok(storage)) => {
                    ok.push(storage);
                    continue;
                }
                Ok(Err(deal_error)) => deal_error,
                Err(err) if err.is_canceled() => DealError {
                    proposal_cid: Some(proposal.clone()),
                    miner: String::new(),
                    message: "job canceled while waiting for the deal".to_string(),
                },
                Err(err) => DealError {
                    proposal_cid: Some(proposal.clone()),
                    miner: String::new(),
                    message: format!("waiting for deal finality: {err}"),
                },
            };
            let _ = task.deal_errors.try_send(deal_error.clone());
            failed.push(deal_error);
        }
        (ok, failed)
    }

    /// Fetches data of a retrieval job from the Filecoin market.
    #[instrument(skip_all, fields(job_id = %job.id, user_id = %job.user_id, cid = %job.data_cid))]
    pub async fn execute_retrieval(
        &self,
        job: &RetrievalJob,
        cancel: &CancellationToken,
    ) -> Result<RetrievalInfo> {
        let ctx =
            LogContext::new(job.user_id.clone(), job.data_cid.clone()).with_job(job.id.clone());
        self.logger.log(&ctx, "Fetching data from Filecoin...").await;
        let request = FetchRequest {
            data_cid: job.data_cid.clone(),
            piece_cid: job.piece_cid.clone(),
            wallet: job.wallet.clone(),
            miners: job.miners.clone(),
            max_price: job.max_price,
            selector: job.selector.clone(),
        };
        let fetched = match self.cold.fetch(&request, cancel).await {
            Ok(fetched) => fetched,
            Err(err) => {
                self.logger
                    .log(&ctx, format!("Retrieval failed: {err}"))
                    .await;
                return Err(err);
            }
        };
        let id = RetrievalId::from_parts(
            job.created_at,
            &job.wallet,
            &fetched.retrieved_miner,
            &job.data_cid,
        );
        self.logger
            .log(
                &ctx.clone().with_retrieval(id.clone()),
                format!(
                    "Retrieved {} bytes from {} paying {} attoFIL.",
                    fetched.size, fetched.retrieved_miner, fetched.funds_spent
                ),
            )
            .await;
        Ok(RetrievalInfo {
            id,
            data_cid: job.data_cid.clone(),
            total_paid: fetched.funds_spent,
            miner: fetched.retrieved_miner,
            size: fetched.size,
            created_at: Some(Utc::now()),
        })
    }
}

/// Config for the deals still missing: the remaining replicas, excluding
/// miners that already hold the data.
fn delta_config(cfg: &FilConfig, counted: usize, existing: &[FilStorage]) -> FilConfig {
    let mut delta = cfg.clone();
    delta.rep_factor = cfg.rep_factor - counted;
    for proposal in existing {
        if !delta.excluded_miners.contains(&proposal.miner) {
            delta.excluded_miners.push(proposal.miner.clone());
        }
    }
    delta
}

/// Runs `fut` bounded by `limit`, aborting when `cancel` fires.
async fn guarded<T>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Canceled),
        res = tokio::time::timeout(limit, fut) => res.map_err(|_| Error::Timeout)?,
    }
}
