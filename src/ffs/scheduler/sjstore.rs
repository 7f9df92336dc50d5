//! # Storage-job store
//!
//! Persists [`StorageJob`]s with their secondary indices and keeps the
//! in-memory views the scheduler needs on its hot path:
//!
//! - `/sjstore/job/<jobID>`: canonical record
//! - `/sjstore/apiid/<uid>/<cid>/<createdAt>` → jobID
//! - `/sjstore/cid/<cid>/<uid>/<createdAt>` → jobID
//! - `/sjstore/starteddeals_v2/<uid>/<cid>` → accepted, non-terminal deals
//!
//! Every mutation runs under a single writer lock and commits as one
//! transaction. Watchers get a copy of each mutated job through a bounded
//! buffer; a watcher that falls behind is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::UserFifo;
use crate::datastore::{Key, SharedDatastore, Txn};
use crate::error::{Error, Result};
use crate::ffs::types::{DealError, JobId, JobStatus, StorageJob, UserId};
use crate::lotus::{Cid, DealInfo};

const WATCHER_BUFFER: usize = 32;

pub fn job_key() -> Key {
    Key::new("/sjstore/job")
}

pub fn apiid_key() -> Key {
    Key::new("/sjstore/apiid")
}

pub fn cid_key() -> Key {
    Key::new("/sjstore/cid")
}

pub fn started_deals_key() -> Key {
    Key::new("/sjstore/starteddeals_v2")
}

type Placement = (UserId, Cid);

/// Which jobs a listing returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Select {
    #[default]
    All,
    Queued,
    Executing,
    Final,
}

impl Select {
    fn accepts(self, status: JobStatus) -> bool {
        match self {
            Select::All => true,
            Select::Queued => status == JobStatus::Queued,
            Select::Executing => status == JobStatus::Executing,
            Select::Final => status.is_final(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ListConfig {
    pub user_id: Option<UserId>,
    pub cid: Option<Cid>,
    /// Zero returns every match.
    pub limit: usize,
    pub ascending: bool,
    pub select: Select,
    /// Id of the last job of the previous page.
    pub next_page_token: Option<JobId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    pub jobs: Vec<StorageJob>,
    pub more: bool,
    pub next_page_token: Option<JobId>,
}

#[derive(Default)]
struct State {
    fifo: UserFifo,
    queued: HashMap<JobId, Placement>,
    executing: HashMap<Placement, JobId>,
    last_final: HashMap<Placement, (i64, JobId)>,
    last_successful: HashMap<Placement, (i64, JobId)>,
}

impl State {
    fn track_final(&mut self, job: &StorageJob) {
        let placement = (job.user_id.clone(), job.cid.clone());
        let newer = |slot: Option<&(i64, JobId)>| slot.is_none_or(|(ts, _)| *ts <= job.created_at);
        if newer(self.last_final.get(&placement)) {
            self.last_final
                .insert(placement.clone(), (job.created_at, job.id.clone()));
        }
        if job.status == JobStatus::Success && newer(self.last_successful.get(&placement)) {
            self.last_successful
                .insert(placement, (job.created_at, job.id.clone()));
        }
    }
}

struct Watcher {
    user_id: UserId,
    job_ids: HashSet<JobId>,
    tx: mpsc::Sender<StorageJob>,
}

pub struct SjStore {
    ds: SharedDatastore,
    state: RwLock<State>,
    next_watcher: AtomicU64,
    watchers: Mutex<HashMap<u64, Watcher>>,
}

impl SjStore {
    /// Opens the store and rebuilds the in-memory views from persisted jobs.
    pub async fn open(ds: SharedDatastore) -> Result<Self> {
        let mut state = State::default();
        let mut executing_users = Vec::new();
        for entry in ds.query(&job_key()).await? {
            let job: StorageJob = serde_json::from_slice(&entry.value)?;
            let placement = (job.user_id.clone(), job.cid.clone());
            match job.status {
                JobStatus::Queued => {
                    state.fifo.push(&job.user_id, job.created_at, job.id.clone());
                    state.queued.insert(job.id, placement);
                }
                JobStatus::Executing => {
                    executing_users.push(job.user_id.clone());
                    state.executing.insert(placement, job.id);
                }
                status if status.is_final() => state.track_final(&job),
                _ => {}
            }
        }
        for user in &executing_users {
            state.fifo.occupy(user);
        }
        info!(
            queued = state.queued.len(),
            executing = state.executing.len(),
            "Storage job store opened"
        );
        Ok(Self {
            ds,
            state: RwLock::new(state),
            next_watcher: AtomicU64::new(0),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    async fn load(&self, id: &JobId) -> Result<Option<StorageJob>> {
        match self.ds.get(&job_key().child(id.as_str())).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn load_many(&self, ids: impl IntoIterator<Item = JobId>) -> Result<Vec<StorageJob>> {
        let mut jobs = Vec::new();
        for id in ids {
            if let Some(job) = self.load(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    fn write(txn: &mut Txn, job: &StorageJob) -> Result<()> {
        txn.put(job_key().child(job.id.as_str()), serde_json::to_vec(job)?)?;
        let ts = job.created_at.to_string();
        txn.put(
            apiid_key()
                .child(job.user_id.as_str())
                .child(job.cid.as_str())
                .child(&ts),
            job.id.as_str().as_bytes().to_vec(),
        )?;
        txn.put(
            cid_key()
                .child(job.cid.as_str())
                .child(job.user_id.as_str())
                .child(&ts),
            job.id.as_str().as_bytes().to_vec(),
        )?;
        Ok(())
    }

    pub async fn get(&self, id: &JobId) -> Result<StorageJob> {
        self.load(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("storage job {id}")))
    }

    /// Persists a new queued job. Other queued jobs for the same
    /// `(user, cid)` are canceled first and returned.
    pub async fn enqueue(&self, mut job: StorageJob) -> Result<Vec<StorageJob>> {
        job.status = JobStatus::Queued;
        let mut state = self.state.write().await;
        let placement = (job.user_id.clone(), job.cid.clone());
        let stale: Vec<JobId> = state
            .queued
            .iter()
            .filter(|(_, p)| **p == placement)
            .map(|(id, _)| id.clone())
            .collect();

        let mut txn = Txn::new(self.ds.clone(), false);
        let mut canceled = Vec::new();
        for id in stale {
            let Some(mut old) = self.load(&id).await? else {
                continue;
            };
            old.status = JobStatus::Canceled;
            old.err_cause = format!("superseded by job {}", job.id);
            Self::write(&mut txn, &old)?;
            canceled.push(old);
        }
        Self::write(&mut txn, &job)?;
        txn.commit().await?;

        for old in &canceled {
            state.queued.remove(&old.id);
            state.fifo.remove(&old.user_id, &old.id);
            state.track_final(old);
            self.publish(old);
        }
        state.fifo.push(&job.user_id, job.created_at, job.id.clone());
        state.queued.insert(job.id.clone(), placement);
        self.publish(&job);
        debug!(job_id = %job.id, canceled = canceled.len(), "Enqueued storage job");
        Ok(canceled)
    }

    /// Moves the next eligible job to `Executing`.
    pub async fn dequeue(&self) -> Result<Option<StorageJob>> {
        let mut state = self.state.write().await;
        let Some((user, created_at, id)) = state.fifo.pop() else {
            return Ok(None);
        };
        let loaded = match self.load(&id).await {
            Ok(loaded) => loaded,
            Err(err) => {
                state.fifo.restore(&user, created_at, id);
                return Err(err);
            }
        };
        let Some(mut job) = loaded else {
            state.queued.remove(&id);
            state.fifo.release(&user);
            warn!(job_id = %id, "Queued job vanished from the datastore");
            return Ok(None);
        };
        job.status = JobStatus::Executing;
        let mut txn = Txn::new(self.ds.clone(), false);
        if let Err(err) = Self::write(&mut txn, &job) {
            state.fifo.restore(&user, created_at, id);
            return Err(err);
        }
        if let Err(err) = txn.commit().await {
            state.fifo.restore(&user, created_at, id);
            return Err(err.into());
        }
        state.queued.remove(&job.id);
        state
            .executing
            .insert((job.user_id.clone(), job.cid.clone()), job.id.clone());
        self.publish(&job);
        Ok(Some(job))
    }

    /// Puts an interrupted executing job back in the queue.
    pub async fn requeue(&self, id: &JobId) -> Result<StorageJob> {
        let mut state = self.state.write().await;
        let mut job = self.get(id).await?;
        if job.status != JobStatus::Executing {
            return Err(Error::Internal(format!(
                "job {id} is {} and can't be requeued",
                job.status
            )));
        }
        job.status = JobStatus::Queued;
        let mut txn = Txn::new(self.ds.clone(), false);
        Self::write(&mut txn, &job)?;
        txn.commit().await?;

        let placement = (job.user_id.clone(), job.cid.clone());
        state.executing.remove(&placement);
        state.fifo.release(&job.user_id);
        state.fifo.push(&job.user_id, job.created_at, job.id.clone());
        state.queued.insert(job.id.clone(), placement);
        self.publish(&job);
        Ok(job)
    }

    /// Cancels the job if it's still queued. Returns `None` otherwise.
    pub async fn cancel_queued(&self, id: &JobId) -> Result<Option<StorageJob>> {
        let mut state = self.state.write().await;
        if !state.queued.contains_key(id) {
            return Ok(None);
        }
        let mut job = self.get(id).await?;
        job.status = JobStatus::Canceled;
        let mut txn = Txn::new(self.ds.clone(), false);
        Self::write(&mut txn, &job)?;
        txn.commit().await?;

        state.queued.remove(id);
        state.fifo.remove(&job.user_id, id);
        state.track_final(&job);
        self.publish(&job);
        Ok(Some(job))
    }

    /// Moves an executing job to a terminal status.
    pub async fn finalize(
        &self,
        id: &JobId,
        status: JobStatus,
        err_cause: &str,
        deal_errors: Vec<DealError>,
    ) -> Result<StorageJob> {
        if !status.is_final() {
            return Err(Error::Internal(format!("{status} isn't a final status")));
        }
        let mut state = self.state.write().await;
        let mut job = self.get(id).await?;
        if job.status.is_final() {
            return Err(Error::Internal(format!(
                "job {id} is already {}",
                job.status
            )));
        }
        let was_queued = job.status == JobStatus::Queued;
        job.status = status;
        job.err_cause = err_cause.to_string();
        for err in deal_errors {
            if !job.deal_errors.contains(&err) {
                job.deal_errors.push(err);
            }
        }
        let mut txn = Txn::new(self.ds.clone(), false);
        Self::write(&mut txn, &job)?;
        txn.commit().await?;

        let placement = (job.user_id.clone(), job.cid.clone());
        if was_queued {
            state.queued.remove(id);
            state.fifo.remove(&job.user_id, id);
        } else if state.executing.get(&placement) == Some(id) {
            state.executing.remove(&placement);
            state.fifo.release(&job.user_id);
        }
        state.track_final(&job);
        self.publish(&job);
        Ok(job)
    }

    /// Records a deal state change on an executing job.
    pub async fn monitor_job(&self, id: &JobId, deal: DealInfo) -> Result<StorageJob> {
        let _state = self.state.write().await;
        let mut job = self.get(id).await?;
        if job.status.is_final() {
            return Ok(job);
        }
        match job
            .deal_info
            .iter_mut()
            .find(|d| d.proposal_cid == deal.proposal_cid)
        {
            Some(existing) => *existing = deal,
            None => job.deal_info.push(deal),
        }
        job.deal_info
            .sort_by(|a, b| a.proposal_cid.cmp(&b.proposal_cid));
        let mut txn = Txn::new(self.ds.clone(), false);
        Self::write(&mut txn, &job)?;
        txn.commit().await?;
        self.publish(&job);
        Ok(job)
    }

    /// Attaches deal errors to a running job as they happen.
    pub async fn record_deal_errors(&self, id: &JobId, errors: &[DealError]) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let _state = self.state.write().await;
        let mut job = self.get(id).await?;
        if job.status.is_final() {
            return Ok(());
        }
        for err in errors {
            if !job.deal_errors.contains(err) {
                job.deal_errors.push(err.clone());
            }
        }
        let mut txn = Txn::new(self.ds.clone(), false);
        Self::write(&mut txn, &job)?;
        txn.commit().await?;
        self.publish(&job);
        Ok(())
    }

    pub async fn get_executing_job(&self, user: &UserId, cid: &Cid) -> Option<JobId> {
        self.state
            .read()
            .await
            .executing
            .get(&(user.clone(), cid.clone()))
            .cloned()
    }

    pub async fn get_queued_jobs_for(&self, user: &UserId, cid: &Cid) -> Vec<JobId> {
        let placement = (user.clone(), cid.clone());
        self.state
            .read()
            .await
            .queued
            .iter()
            .filter(|(_, p)| **p == placement)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn executing_job_ids(&self) -> Vec<JobId> {
        self.state.read().await.executing.values().cloned().collect()
    }

    pub async fn queued_count(&self) -> usize {
        self.state.read().await.fifo.len()
    }

    /// Cids referenced by queued or executing jobs.
    pub async fn active_cids(&self) -> Vec<Cid> {
        let state = self.state.read().await;
        let mut cids: Vec<Cid> = state
            .queued
            .values()
            .map(|(_, c)| c.clone())
            .chain(state.executing.keys().map(|(_, c)| c.clone()))
            .collect();
        cids.sort();
        cids.dedup();
        cids
    }

    /// Whether a queued or executing job other than `except` references `cid`.
    pub async fn cid_referenced_by_others(&self, cid: &Cid, except: &JobId) -> bool {
        let state = self.state.read().await;
        state
            .queued
            .iter()
            .any(|(id, (_, c))| c == cid && id != except)
            || state
                .executing
                .iter()
                .any(|((_, c), id)| c == cid && id != except)
    }

    pub async fn queued_jobs(&self, user: Option<&UserId>, cids: &[Cid]) -> Result<Vec<StorageJob>> {
        let ids: Vec<JobId> = {
            let state = self.state.read().await;
            state
                .fifo
                .ids()
                .into_iter()
                .filter(|id| {
                    state
                        .queued
                        .get(id)
                        .is_some_and(|(u, c)| selects(user, cids, u, c))
                })
                .collect()
        };
        self.load_many(ids).await
    }

    pub async fn executing_jobs(
        &self,
        user: Option<&UserId>,
        cids: &[Cid],
    ) -> Result<Vec<StorageJob>> {
        let ids: Vec<JobId> = {
            let state = self.state.read().await;
            state
                .executing
                .iter()
                .filter(|((u, c), _)| selects(user, cids, u, c))
                .map(|(_, id)| id.clone())
                .collect()
        };
        let mut jobs = self.load_many(ids).await?;
        jobs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(jobs)
    }

    pub async fn latest_final_jobs(
        &self,
        user: Option<&UserId>,
        cids: &[Cid],
    ) -> Result<Vec<StorageJob>> {
        let ids = {
            let state = self.state.read().await;
            latest(&state.last_final, user, cids)
        };
        self.load_many(ids).await
    }

    pub async fn latest_successful_jobs(
        &self,
        user: Option<&UserId>,
        cids: &[Cid],
    ) -> Result<Vec<StorageJob>> {
        let ids = {
            let state = self.state.read().await;
            latest(&state.last_successful, user, cids)
        };
        self.load_many(ids).await
    }

    /// Pages through jobs using the user or cid indices when possible.
    pub async fn list(&self, cfg: ListConfig) -> Result<ListPage> {
        let mut slots: Vec<(i64, JobId)> = match (&cfg.user_id, &cfg.cid) {
            (Some(user), cid) => {
                let mut prefix = apiid_key().child(user.as_str());
                if let Some(cid) = cid {
                    prefix = prefix.child(cid.as_str());
                }
                self.index_slots(&prefix).await?
            }
            (None, Some(cid)) => self.index_slots(&cid_key().child(cid.as_str())).await?,
            (None, None) => self
                .ds
                .query(&job_key())
                .await?
                .into_iter()
                .map(|e| {
                    let job: StorageJob = serde_json::from_slice(&e.value)?;
                    Ok((job.created_at, job.id))
                })
                .collect::<Result<_>>()?,
        };
        slots.sort();
        if !cfg.ascending {
            slots.reverse();
        }
        if let Some(token) = &cfg.next_page_token {
            match slots.iter().position(|(_, id)| id == token) {
                Some(pos) => {
                    slots.drain(..=pos);
                }
                None => return Err(Error::NotFound(format!("page token {token}"))),
            }
        }

        let mut page = ListPage::default();
        for (_, id) in slots {
            let Some(job) = self.load(&id).await? else {
                continue;
            };
            if !cfg.select.accepts(job.status) {
                continue;
            }
            if cfg.limit > 0 && page.jobs.len() == cfg.limit {
                page.more = true;
                break;
            }
            page.jobs.push(job);
        }
        if page.more {
            page.next_page_token = page.jobs.last().map(|j| j.id.clone());
        }
        Ok(page)
    }

    async fn index_slots(&self, prefix: &Key) -> Result<Vec<(i64, JobId)>> {
        let mut slots = Vec::new();
        for entry in self.ds.query(prefix).await? {
            let ts = entry.key.name().parse::<i64>().unwrap_or_default();
            let id = JobId::from(String::from_utf8_lossy(&entry.value).into_owned());
            slots.push((ts, id));
        }
        Ok(slots)
    }

    fn started_key(user: &UserId, cid: &Cid) -> Key {
        started_deals_key().child(user.as_str()).child(cid.as_str())
    }

    /// Remembers accepted proposals so they can be watched again after a
    /// restart.
    pub async fn add_started_deals(&self, user: &UserId, cid: &Cid, proposals: &[Cid]) -> Result<()> {
        let key = Self::started_key(user, cid);
        let _state = self.state.write().await;
        let mut deals: Vec<DealInfo> = match self.ds.get(&key).await? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => Vec::new(),
        };
        for proposal in proposals {
            if deals.iter().all(|d| &d.proposal_cid != proposal) {
                deals.push(DealInfo {
                    proposal_cid: proposal.clone(),
                    data_root: cid.clone(),
                    ..DealInfo::default()
                });
            }
        }
        self.ds.put(&key, serde_json::to_vec(&deals)?).await?;
        Ok(())
    }

    pub async fn get_started_deals(&self, user: &UserId, cid: &Cid) -> Result<Vec<Cid>> {
        match self.ds.get(&Self::started_key(user, cid)).await? {
            Some(raw) => {
                let deals: Vec<DealInfo> = serde_json::from_slice(&raw)?;
                Ok(deals.into_iter().map(|d| d.proposal_cid).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn remove_started_deals(&self, user: &UserId, cid: &Cid) -> Result<()> {
        let _state = self.state.write().await;
        self.ds.delete(&Self::started_key(user, cid)).await?;
        Ok(())
    }

    fn publish(&self, job: &StorageJob) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|id, watcher| {
            if watcher.user_id != job.user_id
                || (!watcher.job_ids.is_empty() && !watcher.job_ids.contains(&job.id))
            {
                return true;
            }
            match watcher.tx.try_send(job.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(watcher = id, user_id = %watcher.user_id, "Dropping slow job watcher");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Streams updates of the user's jobs, restricted to `job_ids` when not
    /// empty, until `cancel` fires or the receiver goes away. The current
    /// state of each listed job is sent first.
    pub async fn watch(
        &self,
        cancel: CancellationToken,
        out: mpsc::Sender<StorageJob>,
        user: &UserId,
        job_ids: Vec<JobId>,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(WATCHER_BUFFER);
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().insert(
            id,
            Watcher {
                user_id: user.clone(),
                job_ids: job_ids.iter().cloned().collect(),
                tx,
            },
        );

        let result = self.forward(&cancel, &out, &mut rx, user, job_ids).await;
        self.watchers.lock().remove(&id);
        result
    }

    async fn forward(
        &self,
        cancel: &CancellationToken,
        out: &mpsc::Sender<StorageJob>,
        rx: &mut mpsc::Receiver<StorageJob>,
        user: &UserId,
        job_ids: Vec<JobId>,
    ) -> Result<()> {
        for job in self.load_many(job_ids).await? {
            if &job.user_id == user && out.send(job).await.is_err() {
                return Ok(());
            }
        }
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => return Ok(()),
                },
            };
            if out.send(job).await.is_err() {
                return Ok(());
            }
        }
    }

    pub fn close(&self) {
        self.watchers.lock().clear();
    }
}

fn selects(user: Option<&UserId>, cids: &[Cid], u: &UserId, c: &Cid) -> bool {
    user.is_none_or(|user| user == u) && (cids.is_empty() || cids.contains(c))
}

fn latest(
    slots: &HashMap<Placement, (i64, JobId)>,
    user: Option<&UserId>,
    cids: &[Cid],
) -> Vec<JobId> {
    let mut picked: Vec<&(i64, JobId)> = slots
        .iter()
        .filter(|((u, c), _)| selects(user, cids, u, c))
        .map(|(_, slot)| slot)
        .collect();
    picked.sort();
    picked.into_iter().map(|(_, id)| id.clone()).collect()
}
