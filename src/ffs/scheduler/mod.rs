//! # Scheduler
//!
//! Turns declared storage configs into storage jobs and runs them.
//!
//! - A dispatcher pulls jobs from the storage-job store. Each user has at
//!   most one executing job, and at most `max_parallel_storage` run overall.
//! - Retrievals run on a separate pool bounded by `max_parallel_retrieval`.
//! - A tracker re-evaluates repairable and renewable configs on their
//!   intervals and whenever the faults index moves.
//! - A GC loop releases staged pins nobody claimed.
//!
//! Finished storage jobs are persisted in order: job record, then cid info,
//! then tracking state.

pub mod cfgstore;
pub mod cistore;
pub mod executor;
pub mod queue;
pub mod rjstore;
pub mod sjstore;
pub mod trackstore;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use self::cfgstore::ConfigStore;
use self::cistore::CiStore;
use self::executor::{Execution, Executor, StorageTask};
use self::rjstore::RjStore;
use self::sjstore::SjStore;
use self::trackstore::{TrackStore, TrackedConfig};
use crate::config::SchedulerConfig;
use crate::datastore::SharedDatastore;
use crate::error::{Error, Result};
use crate::ffs::interfaces::{SharedColdStorage, SharedHotStorage, SharedMinerSelector};
use crate::ffs::joblogger::{JobLogger, LogContext, WatchOptions};
use crate::ffs::types::{
    DealError, JobId, JobStatus, LogEntry, NotificationConfig, RetrievalJob, StorageConfig,
    StorageInfo, StorageJob, UserId, now_nanos,
};
use crate::index::FaultsRunner;
use crate::lotus::{ChainEpoch, Cid, DealInfo};
use crate::notifications::{Notifier, Update, alerts};
use crate::signaler::Listener;

pub use self::sjstore::{ListConfig, ListPage, Select};

/// Upper bound between two dispatcher wake-ups without a push.
const DISPATCH_IDLE: Duration = Duration::from_secs(5);
const PROGRESS_BUFFER: usize = 64;
/// How long a push waits for a canceled executing job to unwind.
const CANCEL_WAIT: Duration = Duration::from_secs(60);

/// Collaborators the scheduler drives.
pub struct SchedulerDeps {
    pub ds: SharedDatastore,
    pub hot: SharedHotStorage,
    pub cold: SharedColdStorage,
    pub selector: SharedMinerSelector,
    pub notifier: Arc<Notifier>,
    /// Wakes the repair pass when the faults index advances.
    pub faults: Option<Arc<FaultsRunner>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Replace an existing config instead of failing.
    pub override_config: bool,
    /// Persist the config without scheduling a job.
    pub no_exec: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RetrievalRequest {
    pub data_cid: Cid,
    pub piece_cid: Option<Cid>,
    pub selector: String,
    /// Miners to retrieve from; empty means any miner offering the data.
    pub miners: Vec<String>,
    /// Paying wallet; defaults to the configured wallet address.
    pub wallet: String,
    pub max_price: u64,
    pub notifications: Vec<NotificationConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageJobsSummary {
    pub queued: Vec<StorageJob>,
    pub executing: Vec<StorageJob>,
    pub latest_final: Vec<StorageJob>,
    pub latest_successful: Vec<StorageJob>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pass {
    Repair,
    Renew,
}

impl Pass {
    fn as_str(self) -> &'static str {
        match self {
            Pass::Repair => "repair",
            Pass::Renew => "renew",
        }
    }
}

/// Cancellation tokens of executing jobs, plus cancels that arrived
/// between a dequeue and the job being registered. `done` closes once the
/// job's final status is persisted.
#[derive(Default)]
struct Running {
    tokens: HashMap<JobId, CancellationToken>,
    done: HashMap<JobId, watch::Receiver<()>>,
    pending: HashSet<JobId>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    wallet_address: Option<String>,
    sjs: Arc<SjStore>,
    rjs: RjStore,
    cis: CiStore,
    ts: TrackStore,
    cfgs: ConfigStore,
    logger: Arc<JobLogger>,
    notifier: Arc<Notifier>,
    executor: Executor,
    hot: SharedHotStorage,
    cold: SharedColdStorage,
    faults: Option<Arc<FaultsRunner>>,
    evaluate: Notify,
    storage_slots: Arc<Semaphore>,
    running: Mutex<Running>,
    push_lock: tokio::sync::Mutex<()>,
    retrieval_tx: Mutex<Option<mpsc::UnboundedSender<JobId>>>,
    retrieval_rx: Mutex<Option<mpsc::UnboundedReceiver<JobId>>>,
    clock: AtomicI64,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub async fn new(
        config: SchedulerConfig,
        wallet_address: Option<String>,
        deps: SchedulerDeps,
    ) -> Result<Arc<Self>> {
        let sjs = Arc::new(SjStore::open(deps.ds.clone()).await?);
        let logger = Arc::new(JobLogger::new(deps.ds.clone()));
        let executor = Executor::new(
            deps.hot.clone(),
            deps.cold.clone(),
            deps.selector,
            sjs.clone(),
            logger.clone(),
            Duration::from_secs(config.deal_finality_timeout_seconds),
        );
        let (retrieval_tx, retrieval_rx) = mpsc::unbounded_channel();
        let slots = config.max_parallel_storage.max(1);

        Ok(Arc::new(Self {
            wallet_address: wallet_address.filter(|a| !a.is_empty()),
            rjs: RjStore::new(deps.ds.clone()),
            cis: CiStore::new(deps.ds.clone()),
            ts: TrackStore::new(deps.ds.clone()),
            cfgs: ConfigStore::new(deps.ds),
            sjs,
            logger,
            notifier: deps.notifier,
            executor,
            hot: deps.hot,
            cold: deps.cold,
            faults: deps.faults,
            evaluate: Notify::new(),
            storage_slots: Arc::new(Semaphore::new(slots)),
            running: Mutex::new(Running::default()),
            push_lock: tokio::sync::Mutex::new(()),
            retrieval_tx: Mutex::new(Some(retrieval_tx)),
            retrieval_rx: Mutex::new(Some(retrieval_rx)),
            clock: AtomicI64::new(0),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            config,
        }))
    }

    /// Resumes interrupted work and spawns the background loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.resume().await?;

        let mut handles = Vec::new();
        let scheduler = Arc::clone(self);
        handles.push(tokio::spawn(async move { scheduler.dispatch_loop().await }));
        let scheduler = Arc::clone(self);
        handles.push(tokio::spawn(async move { scheduler.track_loop().await }));
        let scheduler = Arc::clone(self);
        handles.push(tokio::spawn(async move { scheduler.gc_loop().await }));
        let retrievals = self.retrieval_rx.lock().take();
        if let Some(rx) = retrievals {
            let scheduler = Arc::clone(self);
            handles.push(tokio::spawn(async move { scheduler.retrieval_loop(rx).await }));
        }
        self.handles.lock().extend(handles);
        info!(
            max_parallel_storage = self.config.max_parallel_storage,
            max_parallel_retrieval = self.config.max_parallel_retrieval,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stops the loops and waits for executing jobs to unwind. Jobs
    /// interrupted here stay executing and are resumed by the next start.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.retrieval_tx.lock().take();
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = ?err, "Scheduler task panicked");
            }
        }
        let slots = self.config.max_parallel_storage.max(1) as u32;
        if self.storage_slots.acquire_many(slots).await.is_err() {
            warn!("Storage slots closed before in-flight jobs unwound");
        }
        self.sjs.close();
        self.logger.close();
        info!("Scheduler closed");
    }

    async fn resume(&self) -> Result<()> {
        for id in self.sjs.executing_job_ids().await {
            let job = self.sjs.get(&id).await?;
            let started = self.sjs.get_started_deals(&job.user_id, &job.cid).await?;
            if started.is_empty() {
                self.sjs
                    .finalize(&id, JobStatus::Failed, "restart", Vec::new())
                    .await?;
                warn!(job_id = %id, cid = %job.cid, "Interrupted storage job failed on restart");
            } else {
                self.sjs.requeue(&id).await?;
                info!(
                    job_id = %id,
                    cid = %job.cid,
                    deals = started.len(),
                    "Requeued storage job to resume watching its deals"
                );
            }
        }

        for job in self.rjs.with_status(JobStatus::Executing).await? {
            self.rjs
                .finalize(&job.id, JobStatus::Failed, |j| {
                    j.err_cause = "restart".to_string()
                })
                .await?;
            warn!(job_id = %job.id, "Interrupted retrieval job failed on restart");
        }
        for job in self.rjs.with_status(JobStatus::Queued).await? {
            self.submit_retrieval(job.id)?;
        }
        self.record_queue_gauges().await;
        Ok(())
    }

    /// Declares `cfg` as the target of `(user, cid)` and schedules a job
    /// converging to it, unless `opts.no_exec` is set.
    #[instrument(skip(self, cfg), fields(user_id = %user, cid = %cid))]
    pub async fn push_storage_config(
        &self,
        user: &UserId,
        cid: &Cid,
        mut cfg: StorageConfig,
        opts: PushOptions,
    ) -> Result<Option<JobId>> {
        if cid.is_undef() {
            return Err(Error::InvalidConfig("cid can't be undefined".to_string()));
        }
        self.apply_defaults(&mut cfg);
        cfg.validate()?;

        let _guard = self.push_lock.lock().await;
        if !opts.override_config && self.cfgs.get(user, cid).await?.is_some() {
            return Err(Error::AlreadyConfigured);
        }
        self.cancel_active(user, cid).await?;
        self.cfgs.put(user, cid, &cfg).await?;
        if opts.no_exec {
            debug!("Config saved without execution");
            return Ok(None);
        }
        self.enqueue(user, cid, cfg, None).await.map(Some)
    }

    /// Applies the config of `old` to `new` and forgets `old`. The hot pin of
    /// `old` is moved to `new` when the job runs.
    #[instrument(skip(self), fields(user_id = %user))]
    pub async fn push_replace(&self, user: &UserId, old: &Cid, new: &Cid) -> Result<JobId> {
        if old.is_undef() || new.is_undef() {
            return Err(Error::InvalidConfig("cid can't be undefined".to_string()));
        }
        if old == new {
            return Err(Error::InvalidConfig(
                "the old and new cid should be different".to_string(),
            ));
        }

        let _guard = self.push_lock.lock().await;
        let mut cfg = self
            .cfgs
            .get(user, old)
            .await?
            .ok_or_else(|| Error::NotFound(format!("storage config of {old}")))?;
        if self.sjs.get_executing_job(user, old).await.is_some()
            || !self.sjs.get_queued_jobs_for(user, old).await.is_empty()
        {
            return Err(Error::ActiveInStorage);
        }
        self.apply_defaults(&mut cfg);
        cfg.validate()?;

        self.cancel_active(user, new).await?;
        let job_id = self.enqueue(user, new, cfg.clone(), Some(old.clone())).await?;
        self.cfgs.put(user, new, &cfg).await?;
        self.cfgs.delete(user, old).await?;
        self.ts.remove(user, old).await?;
        Ok(job_id)
    }

    /// Forgets the declared config of `(user, cid)`. Placements must be
    /// disabled first.
    pub async fn remove(&self, user: &UserId, cid: &Cid) -> Result<()> {
        let _guard = self.push_lock.lock().await;
        let cfg = self
            .cfgs
            .get(user, cid)
            .await?
            .ok_or_else(|| Error::NotFound(format!("storage config of {cid}")))?;
        if cfg.hot.enabled || cfg.cold.enabled {
            return Err(Error::ActiveInStorage);
        }
        self.cfgs.delete(user, cid).await?;
        self.ts.remove(user, cid).await?;
        info!(user_id = %user, cid = %cid, "Removed storage config");
        Ok(())
    }

    /// Cancels a job. Terminal jobs are left untouched; executing ones turn
    /// canceled once their execution unwinds.
    pub async fn cancel(&self, job_id: &JobId) -> Result<()> {
        let job = self.sjs.get(job_id).await?;
        if job.status.is_final() {
            return Ok(());
        }
        if let Some(job) = self.sjs.cancel_queued(job_id).await? {
            self.logger
                .log(&job_context(&job), "Job canceled while queued.")
                .await;
            self.notifier.notify(Update::FinalStorageJob { job });
            self.record_queue_gauges().await;
            return Ok(());
        }

        {
            let mut running = self.running.lock();
            match running.tokens.get(job_id) {
                Some(token) => token.cancel(),
                None => {
                    running.pending.insert(job_id.clone());
                }
            }
        }
        // The job may have finished while the cancel was recorded.
        if self.sjs.get(job_id).await?.status.is_final() {
            self.running.lock().pending.remove(job_id);
        }
        info!(job_id = %job_id, "Cancellation requested");
        Ok(())
    }

    pub async fn get_storage_job(&self, job_id: &JobId) -> Result<StorageJob> {
        self.sjs.get(job_id).await
    }

    pub async fn get_storage_config(&self, user: &UserId, cid: &Cid) -> Result<StorageConfig> {
        self.cfgs
            .get(user, cid)
            .await?
            .ok_or_else(|| Error::NotFound(format!("storage config of {cid}")))
    }

    /// Cids the user declared a config for.
    pub async fn configured_cids(&self, user: &UserId) -> Result<Vec<Cid>> {
        self.cfgs.cids(user).await
    }

    pub async fn get_cid_info(&self, user: &UserId, cid: &Cid) -> Result<StorageInfo> {
        self.cis
            .get(user, cid)
            .await?
            .ok_or_else(|| Error::NotFound(format!("storage info of {cid}")))
    }

    pub async fn list_cid_info(&self, user: &UserId) -> Result<Vec<StorageInfo>> {
        self.cis.list(user).await
    }

    pub async fn get_executing_job_ids(&self) -> Vec<JobId> {
        self.sjs.executing_job_ids().await
    }

    pub async fn queued_storage_jobs(
        &self,
        user: Option<&UserId>,
        cids: &[Cid],
    ) -> Result<Vec<StorageJob>> {
        self.sjs.queued_jobs(user, cids).await
    }

    pub async fn executing_storage_jobs(
        &self,
        user: Option<&UserId>,
        cids: &[Cid],
    ) -> Result<Vec<StorageJob>> {
        self.sjs.executing_jobs(user, cids).await
    }

    pub async fn latest_final_storage_jobs(
        &self,
        user: Option<&UserId>,
        cids: &[Cid],
    ) -> Result<Vec<StorageJob>> {
        self.sjs.latest_final_jobs(user, cids).await
    }

    pub async fn latest_successful_storage_jobs(
        &self,
        user: Option<&UserId>,
        cids: &[Cid],
    ) -> Result<Vec<StorageJob>> {
        self.sjs.latest_successful_jobs(user, cids).await
    }

    pub async fn storage_jobs_summary(
        &self,
        user: Option<&UserId>,
        cids: &[Cid],
    ) -> Result<StorageJobsSummary> {
        Ok(StorageJobsSummary {
            queued: self.sjs.queued_jobs(user, cids).await?,
            executing: self.sjs.executing_jobs(user, cids).await?,
            latest_final: self.sjs.latest_final_jobs(user, cids).await?,
            latest_successful: self.sjs.latest_successful_jobs(user, cids).await?,
        })
    }

    pub async fn list_storage_jobs(&self, cfg: ListConfig) -> Result<ListPage> {
        self.sjs.list(cfg).await
    }

    /// Streams job updates of `user` into `out` until `cancel` fires.
    pub async fn watch_jobs(
        &self,
        cancel: CancellationToken,
        out: mpsc::Sender<StorageJob>,
        user: &UserId,
        job_ids: Vec<JobId>,
    ) -> Result<()> {
        self.sjs.watch(cancel, out, user, job_ids).await
    }

    /// Streams log entries of `(user, cid)` into `out` until `cancel` fires.
    pub async fn watch_logs(
        &self,
        cancel: CancellationToken,
        out: mpsc::Sender<LogEntry>,
        user: &UserId,
        cid: &Cid,
        opts: WatchOptions,
    ) -> Result<()> {
        self.logger.watch(cancel, out, user, cid, opts).await
    }

    pub async fn logs(&self, user: &UserId, cid: &Cid) -> Result<Vec<LogEntry>> {
        self.logger.get_by_cid(user, cid).await
    }

    /// Adds data to hot storage as a staged pin of `user`.
    pub async fn stage(&self, user: &UserId, data: Vec<u8>) -> Result<Cid> {
        self.hot.stage(user, data).await
    }

    /// Reads `cid` from hot storage. The cid must be configured with hot
    /// storage enabled.
    pub async fn get_cid_from_hot(&self, user: &UserId, cid: &Cid) -> Result<Vec<u8>> {
        let cfg = self.get_storage_config(user, cid).await?;
        if !cfg.hot.enabled {
            return Err(Error::NotFound(format!("{cid} isn't enabled in hot storage")));
        }
        self.hot.get(cid).await
    }

    /// Queues a retrieval of `request.data_cid` from the Filecoin market.
    #[instrument(skip(self, request), fields(user_id = %user, cid = %request.data_cid))]
    pub async fn start_retrieval(&self, user: &UserId, request: RetrievalRequest) -> Result<JobId> {
        if request.data_cid.is_undef() {
            return Err(Error::InvalidConfig("data cid can't be undefined".to_string()));
        }
        let wallet = if request.wallet.is_empty() {
            self.wallet_address
                .clone()
                .ok_or_else(|| Error::InvalidConfig("no wallet address to pay the retrieval".to_string()))?
        } else {
            request.wallet
        };
        let job = self
            .rjs
            .create(RetrievalJob {
                id: JobId::new(),
                user_id: user.clone(),
                data_cid: request.data_cid,
                piece_cid: request.piece_cid,
                miners: request.miners,
                selector: request.selector,
                wallet,
                max_price: request.max_price,
                created_at: self.next_created_at(),
                ..RetrievalJob::default()
            })
            .await?;
        self.notifier.register(&job.id, &request.notifications);
        self.submit_retrieval(job.id.clone())?;
        info!(job_id = %job.id, "Retrieval job queued");
        Ok(job.id)
    }

    pub async fn get_retrieval_job(&self, job_id: &JobId) -> Result<RetrievalJob> {
        self.rjs.get(job_id).await
    }

    /// Unpins staged data older than the grace period that no queued or
    /// executing job references.
    pub async fn gc_staged(&self) -> Result<Vec<Cid>> {
        let grace = chrono::Duration::seconds(self.config.gc_staged_grace_seconds as i64);
        let exclude = self.sjs.active_cids().await;
        self.hot.gc_staged(&exclude, Utc::now() - grace).await
    }

    /// Runs the repair pass over every tracked config now.
    pub async fn evaluate_repairs(&self) {
        self.evaluate_tracked(Pass::Repair).await
    }

    /// Runs the renewal pass over every tracked config now.
    pub async fn evaluate_renewals(&self) {
        self.evaluate_tracked(Pass::Renew).await
    }

    fn apply_defaults(&self, cfg: &mut StorageConfig) {
        if cfg.cold.filecoin.addr.is_empty() {
            if let Some(addr) = &self.wallet_address {
                cfg.cold.filecoin.addr = addr.clone();
            }
        }
    }

    /// Cancels queued and executing jobs of `(user, cid)`, returning once
    /// none of them is left non-terminal.
    async fn cancel_active(&self, user: &UserId, cid: &Cid) -> Result<()> {
        for id in self.sjs.get_queued_jobs_for(user, cid).await {
            self.cancel(&id).await?;
        }
        if let Some(id) = self.sjs.get_executing_job(user, cid).await {
            self.cancel(&id).await?;
            self.wait_until_final(&id).await?;
        }
        Ok(())
    }

    async fn wait_until_final(&self, id: &JobId) -> Result<()> {
        let deadline = Instant::now() + CANCEL_WAIT;
        loop {
            let done = self.running.lock().done.get(id).cloned();
            if self.sjs.get(id).await?.status.is_final() {
                return Ok(());
            }
            if self.shutdown.is_cancelled() {
                return Err(Error::Canceled);
            }
            if Instant::now() >= deadline {
                warn!(job_id = %id, "Canceled job didn't unwind in time");
                return Err(Error::Timeout);
            }
            match done {
                Some(mut rx) => {
                    tokio::select! {
                        _ = rx.changed() => {}
                        _ = sleep_until(deadline) => {}
                    }
                }
                // Dequeued but not registered yet.
                None => sleep(Duration::from_millis(20)).await,
            }
        }
    }

    async fn enqueue(
        &self,
        user: &UserId,
        cid: &Cid,
        config: StorageConfig,
        replaced_cid: Option<Cid>,
    ) -> Result<JobId> {
        let job = StorageJob {
            id: JobId::new(),
            user_id: user.clone(),
            cid: cid.clone(),
            status: JobStatus::Queued,
            created_at: self.next_created_at(),
            config,
            replaced_cid,
            ..StorageJob::default()
        };
        for stale in self.sjs.enqueue(job.clone()).await? {
            self.notifier.notify(Update::FinalStorageJob { job: stale });
        }
        self.logger
            .log(&job_context(&job), "Pushing new configuration...")
            .await;
        self.record_queue_gauges().await;
        self.evaluate.notify_one();
        Ok(job.id)
    }

    /// Strictly increasing creation timestamps keep the FIFO order stable.
    fn next_created_at(&self) -> i64 {
        let now = now_nanos();
        let mut prev = self.clock.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .clock
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    fn submit_retrieval(&self, id: JobId) -> Result<()> {
        match self.retrieval_tx.lock().as_ref() {
            Some(tx) => tx.send(id).map_err(|_| Error::Closed),
            None => Err(Error::Closed),
        }
    }

    async fn record_queue_gauges(&self) {
        gauge!("scheduler_queued_jobs").set(self.sjs.queued_count().await as f64);
        gauge!("scheduler_executing_jobs").set(self.sjs.executing_job_ids().await.len() as f64);
    }

    #[instrument(skip_all, name = "scheduler_dispatch")]
    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.storage_slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = match self.sjs.dequeue().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.evaluate.notified() => {}
                        _ = sleep(DISPATCH_IDLE) => {}
                    }
                    continue;
                }
                Err(err) => {
                    drop(permit);
                    error!(error = ?err, "Dequeuing storage job failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(DISPATCH_IDLE) => {}
                    }
                    continue;
                }
            };

            let token = self.shutdown.child_token();
            let (done_tx, done_rx) = watch::channel(());
            {
                let mut running = self.running.lock();
                if running.pending.remove(&job.id) {
                    token.cancel();
                }
                running.tokens.insert(job.id.clone(), token.clone());
                running.done.insert(job.id.clone(), done_rx);
            }
            self.record_queue_gauges().await;

            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                let job_id = job.id.clone();
                scheduler.run_storage_job(job, token).await;
                scheduler.running.lock().done.remove(&job_id);
                drop(done_tx);
                drop(permit);
                scheduler.evaluate.notify_one();
            });
        }
        debug!("Dispatcher stopped");
    }

    #[instrument(skip_all, fields(job_id = %job.id, user_id = %job.user_id, cid = %job.cid))]
    async fn run_storage_job(self: &Arc<Self>, job: StorageJob, cancel: CancellationToken) {
        let started = Instant::now();
        self.notifier.register(&job.id, &job.config.notifications);
        self.notifier.check_disk_space(&job.id);
        self.logger
            .log(&job_context(&job), "Executing job...")
            .await;

        let (deal_tx, deal_rx) = mpsc::channel(PROGRESS_BUFFER);
        let (err_tx, err_rx) = mpsc::channel(PROGRESS_BUFFER);
        let forwarder = tokio::spawn(Arc::clone(self).forward_progress(job.id.clone(), deal_rx, err_rx));

        let prev = self.cis.get(&job.user_id, &job.cid).await;
        let task = StorageTask {
            job: &job,
            cancel: &cancel,
            shutdown: &self.shutdown,
            deal_updates: deal_tx,
            deal_errors: err_tx,
        };
        let execution = match prev {
            Ok(prev) => self.executor.execute_storage(&task, prev).await,
            Err(err) => Execution {
                info: None,
                deal_errors: Vec::new(),
                result: Err(err),
            },
        };
        // Closing the senders lets the forwarder drain and stop.
        drop(task);
        if let Err(err) = forwarder.await {
            error!(error = ?err, "Deal progress forwarder panicked");
        }
        self.running.lock().tokens.remove(&job.id);

        if self.shutdown.is_cancelled() {
            info!("Scheduler shutting down, job left executing");
            return;
        }
        self.finish_storage_job(job, cancel.is_cancelled(), execution, started)
            .await;
    }

    async fn forward_progress(
        self: Arc<Self>,
        job_id: JobId,
        mut deals: mpsc::Receiver<DealInfo>,
        mut errors: mpsc::Receiver<DealError>,
    ) {
        loop {
            tokio::select! {
                Some(deal) = deals.recv() => {
                    match self.sjs.monitor_job(&job_id, deal.clone()).await {
                        Ok(job) => self.notifier.notify(Update::StorageJob { job, deal }),
                        Err(err) => warn!(error = ?err, job_id = %job_id, "Recording deal update failed"),
                    }
                }
                Some(deal_error) = errors.recv() => {
                    if let Err(err) = self.sjs.record_deal_errors(&job_id, &[deal_error]).await {
                        warn!(error = ?err, job_id = %job_id, "Recording deal error failed");
                    }
                }
                else => break,
            }
        }
    }

    async fn finish_storage_job(
        &self,
        job: StorageJob,
        canceled: bool,
        execution: Execution,
        started: Instant,
    ) {
        let (status, err_cause) = match &execution.result {
            _ if canceled => (JobStatus::Canceled, "job canceled".to_string()),
            Ok(()) => (JobStatus::Success, String::new()),
            Err(err) => (JobStatus::Failed, err.to_string()),
        };
        let ctx = job_context(&job);
        let job = match self
            .sjs
            .finalize(&job.id, status, &err_cause, execution.deal_errors)
            .await
        {
            Ok(job) => job,
            Err(err) => {
                error!(error = ?err, "Finalizing storage job failed");
                return;
            }
        };

        if let Some(info) = &execution.info {
            if let Err(err) = self.persist_placement(&job, info).await {
                error!(error = ?err, "Persisting storage info failed");
            }
        }

        match status {
            JobStatus::Success => {
                self.logger
                    .log(&ctx, "Job successfully executed.")
                    .await
            }
            _ => {
                self.logger
                    .log(&ctx, format!("Job finished with status {status}: {err_cause}"))
                    .await
            }
        }
        counter!("scheduler_jobs_finished_total", "status" => status.as_str()).increment(1);
        histogram!("scheduler_job_duration_ms").record(started.elapsed().as_millis() as f64);
        self.record_queue_gauges().await;
        info!(status = %status, "Storage job finished");
        self.notifier.notify(Update::FinalStorageJob { job });
    }

    /// Cid info first, then tracking, mirroring the latest declared config.
    async fn persist_placement(&self, job: &StorageJob, info: &StorageInfo) -> Result<()> {
        self.cis.put(info).await?;
        match self.cfgs.get(&job.user_id, &job.cid).await? {
            Some(cfg) => self.ts.put(&job.user_id, &job.cid, &cfg).await,
            None => self.ts.remove(&job.user_id, &job.cid).await,
        }
    }

    #[instrument(skip_all, name = "scheduler_retrievals")]
    async fn retrieval_loop(self: Arc<Self>, rx: mpsc::UnboundedReceiver<JobId>) {
        let shutdown = self.shutdown.clone();
        let jobs = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|id| (id, rx))
        });
        jobs.take_until(async move { shutdown.cancelled().await })
            .for_each_concurrent(self.config.max_parallel_retrieval.max(1), |id| {
                let scheduler = Arc::clone(&self);
                async move { scheduler.run_retrieval_job(id).await }
            })
            .await;
        debug!("Retrieval pool stopped");
    }

    #[instrument(skip(self))]
    async fn run_retrieval_job(&self, id: JobId) {
        let job = match self.rjs.start(&id).await {
            Ok(job) => job,
            Err(err) => {
                error!(error = ?err, "Starting retrieval job failed");
                return;
            }
        };
        self.notifier.notify(Update::RetrievalJob {
            job: job.clone(),
            info: None,
        });

        let cancel = self.shutdown.child_token();
        let result = self.executor.execute_retrieval(&job, &cancel).await;
        if self.shutdown.is_cancelled() {
            return;
        }

        let (status, finalized) = match result {
            Ok(info) => {
                let finalized = self
                    .rjs
                    .finalize(&id, JobStatus::Success, |j| {
                        j.retrieval_id = info.id.clone();
                        j.miner = Some(info.miner.clone());
                    })
                    .await
                    .map(|job| (job, Some(info)));
                (JobStatus::Success, finalized)
            }
            Err(err) => {
                let cause = err.to_string();
                let finalized = self
                    .rjs
                    .finalize(&id, JobStatus::Failed, |j| j.err_cause = cause)
                    .await
                    .map(|job| (job, None));
                (JobStatus::Failed, finalized)
            }
        };
        counter!("scheduler_retrievals_finished_total", "status" => status.as_str()).increment(1);
        match finalized {
            Ok((job, info)) => self.notifier.notify(Update::RetrievalJob { job, info }),
            Err(err) => error!(error = ?err, "Finalizing retrieval job failed"),
        }
    }

    #[instrument(skip_all, name = "scheduler_tracker")]
    async fn track_loop(self: Arc<Self>) {
        let mut faults = self.faults.as_ref().map(|f| f.listen());
        let repair_every = Duration::from_secs(self.config.repair_interval_seconds.max(1));
        let renew_every = Duration::from_secs(self.config.renew_interval_seconds.max(1));
        let mut next_repair = Instant::now() + repair_every;
        let mut next_renew = Instant::now() + renew_every;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep_until(next_repair) => {
                    self.evaluate_tracked(Pass::Repair).await;
                    next_repair = Instant::now() + repair_every;
                }
                _ = sleep_until(next_renew) => {
                    self.evaluate_tracked(Pass::Renew).await;
                    next_renew = Instant::now() + renew_every;
                }
                _ = next_signal(&mut faults) => {
                    debug!("Faults index advanced, evaluating repairs");
                    self.evaluate_tracked(Pass::Repair).await;
                }
            }
        }

        if let (Some(runner), Some(listener)) = (&self.faults, &faults) {
            runner.unregister(listener);
        }
        debug!("Tracker stopped");
    }

    async fn evaluate_tracked(&self, pass: Pass) {
        let started = Instant::now();
        let tracked = match self.ts.get_all().await {
            Ok(tracked) => tracked,
            Err(err) => {
                error!(error = ?err, pass = pass.as_str(), "Loading tracked configs failed");
                return;
            }
        };
        let epoch = match pass {
            Pass::Repair => None,
            Pass::Renew => match self.cold.get_current_epoch().await {
                Ok(epoch) => Some(epoch),
                Err(err) => {
                    error!(error = ?err, "Reading current epoch for renewals failed");
                    return;
                }
            },
        };

        let mut scheduled = 0u64;
        for entry in tracked {
            for tracked in &entry.tracked {
                if self.shutdown.is_cancelled() {
                    return;
                }
                match self.evaluate_one(pass, &entry.cid, tracked, epoch).await {
                    Ok(true) => scheduled += 1,
                    Ok(false) => {}
                    Err(err) => warn!(
                        error = ?err,
                        cid = %entry.cid,
                        user_id = %tracked.user_id,
                        pass = pass.as_str(),
                        "Evaluating tracked config failed"
                    ),
                }
            }
        }
        histogram!("scheduler_tracker_pass_duration_ms", "pass" => pass.as_str())
            .record(started.elapsed().as_millis() as f64);
        info!(pass = pass.as_str(), scheduled, "Tracked configs evaluated");
    }

    /// Schedules a job for `tracked` when it needs one. Returns whether a job
    /// was scheduled.
    async fn evaluate_one(
        &self,
        pass: Pass,
        cid: &Cid,
        tracked: &TrackedConfig,
        epoch: Option<ChainEpoch>,
    ) -> Result<bool> {
        let user = &tracked.user_id;
        let cfg = &tracked.storage_config;
        if self.sjs.get_executing_job(user, cid).await.is_some()
            || !self.sjs.get_queued_jobs_for(user, cid).await.is_empty()
        {
            return Ok(false);
        }
        let info = self.cis.get(user, cid).await?;

        let needed = match (pass, epoch) {
            (Pass::Repair, _) => cfg.repairable && self.needs_repair(user, cid, cfg, info.as_ref()).await?,
            (Pass::Renew, Some(epoch)) => {
                if let Some(info) = &info {
                    self.alert_expirations(cfg, info, epoch);
                }
                cfg.cold.enabled
                    && cfg.cold.filecoin.renew.enabled
                    && info.as_ref().is_some_and(|i| needs_renewal(i, cfg, epoch))
            }
            (Pass::Renew, None) => false,
        };
        if !needed {
            return Ok(false);
        }

        info!(cid = %cid, user_id = %user, pass = pass.as_str(), "Scheduling job for tracked config");
        counter!("scheduler_tracked_jobs_total", "pass" => pass.as_str()).increment(1);
        let job_id = self.enqueue(user, cid, cfg.clone(), None).await?;
        self.logger
            .log(
                &LogContext::new(user.clone(), cid.clone()).with_job(job_id),
                format!("Scheduled by the {} check.", pass.as_str()),
            )
            .await;
        Ok(true)
    }

    async fn needs_repair(
        &self,
        user: &UserId,
        cid: &Cid,
        cfg: &StorageConfig,
        info: Option<&StorageInfo>,
    ) -> Result<bool> {
        let Some(info) = info else {
            return Ok(true);
        };
        if cfg.hot.enabled && !self.hot.is_pinned(user, cid).await? {
            return Ok(true);
        }
        if !cfg.cold.enabled {
            return Ok(false);
        }
        let mut active = 0;
        for proposal in info.cold.filecoin.proposals.iter().filter(|p| !p.renewed) {
            if proposal.proposal_cid.is_undef() || self.cold.is_deal_active(&proposal.proposal_cid).await? {
                active += 1;
            }
        }
        Ok(active < cfg.cold.filecoin.rep_factor)
    }

    /// Raises deal-expiration alerts of `cfg` for the deals in `info`.
    fn alert_expirations(&self, cfg: &StorageConfig, info: &StorageInfo, epoch: ChainEpoch) {
        let wants_alert = cfg
            .notifications
            .iter()
            .flat_map(|n| n.alerts.iter())
            .any(|a| a.alert_type == alerts::DEAL_EXPIRATION_CHECK);
        if !wants_alert {
            return;
        }
        for proposal in &info.cold.filecoin.proposals {
            if proposal.renewed || proposal.start_epoch <= 0 || proposal.duration <= 0 {
                continue;
            }
            self.notifier.notify_configs(
                &cfg.notifications,
                Update::DealExpiration {
                    job_id: info.job_id.clone(),
                    deal_id: proposal.deal_id,
                    piece_cid: proposal.piece_cid.clone(),
                    miner: proposal.miner.clone(),
                    expiry_epoch: proposal.expiration_epoch(),
                    current_epoch: epoch,
                },
            );
        }
    }

    #[instrument(skip_all, name = "scheduler_gc")]
    async fn gc_loop(self: Arc<Self>) {
        let every = Duration::from_secs(self.config.gc_interval_seconds.max(1));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(every) => {}
            }
            match self.gc_staged().await {
                Ok(removed) if !removed.is_empty() => {
                    counter!("scheduler_gc_unpinned_total").increment(removed.len() as u64);
                    info!(count = removed.len(), "Unpinned stale staged data");
                }
                Ok(_) => {}
                Err(err) => error!(error = ?err, "Staged data GC failed"),
            }
        }
    }
}

fn job_context(job: &StorageJob) -> LogContext {
    LogContext::new(job.user_id.clone(), job.cid.clone()).with_job(job.id.clone())
}

/// Whether a live proposal expires within the renewal threshold.
fn needs_renewal(info: &StorageInfo, cfg: &StorageConfig, epoch: ChainEpoch) -> bool {
    let threshold = cfg.cold.filecoin.renew.threshold;
    info.cold.filecoin.proposals.iter().any(|p| {
        !p.renewed
            && p.start_epoch > 0
            && p.duration > 0
            && p.expiration_epoch() > epoch
            && p.expiration_epoch() - epoch <= threshold
    })
}

/// Resolves on the next faults signal. Never resolves without a listener.
async fn next_signal(listener: &mut Option<Listener>) {
    if let Some(l) = listener {
        if l.recv().await.is_some() {
            return;
        }
        *listener = None;
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffs::types::{ColdInfo, FilInfo, FilStorage};

    fn info_with(proposals: Vec<FilStorage>) -> StorageInfo {
        StorageInfo {
            cold: ColdInfo {
                enabled: true,
                filecoin: FilInfo {
                    proposals,
                    ..FilInfo::default()
                },
            },
            ..StorageInfo::default()
        }
    }

    #[test]
    fn renewal_triggers_inside_threshold_only() {
        let cfg = StorageConfig::default().with_renew(true, 100);
        let deal = |start, renewed| FilStorage {
            start_epoch: start,
            duration: 1_000,
            renewed,
            ..FilStorage::default()
        };

        assert!(!needs_renewal(&info_with(vec![deal(500, false)]), &cfg, 1_000));
        assert!(needs_renewal(&info_with(vec![deal(500, false)]), &cfg, 1_450));
        assert!(!needs_renewal(&info_with(vec![deal(500, true)]), &cfg, 1_450));
        // Already expired deals are repaired, not renewed.
        assert!(!needs_renewal(&info_with(vec![deal(500, false)]), &cfg, 1_600));
    }

    #[tokio::test]
    async fn closed_listener_never_signals() {
        let signaler = crate::signaler::Signaler::new();
        let mut listener = Some(signaler.listen());
        signaler.signal();
        next_signal(&mut listener).await;

        signaler.close();
        let pending = tokio::time::timeout(Duration::from_millis(20), next_signal(&mut listener)).await;
        assert!(pending.is_err());
        assert!(listener.is_none());
    }
}
