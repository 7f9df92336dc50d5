//! # Job logger
//!
//! Append-only, human readable progress log per `(user, cid)`, persisted
//! under `/ffs/joblogger/<user>/<cid>/<nanos>` with a live tail.
//!
//! Watchers register on the hub before reading history, so entries written
//! while the history is streamed are delivered exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::types::{JobId, LogEntry, RetrievalId, UserId, now_nanos};
use crate::datastore::{Key, SharedDatastore};
use crate::error::Result;
use crate::lotus::Cid;

const WATCHER_BUFFER: usize = 64;

fn base_key() -> Key {
    Key::new("/ffs/joblogger")
}

pub fn cid_prefix(user: &UserId, cid: &Cid) -> Key {
    base_key().child(user.as_str()).child(cid.as_str())
}

/// Correlation attached to every log line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogContext {
    pub user_id: UserId,
    pub cid: Cid,
    pub job_id: Option<JobId>,
    pub retrieval_id: Option<RetrievalId>,
}

impl LogContext {
    pub fn new(user_id: UserId, cid: Cid) -> Self {
        Self {
            user_id,
            cid,
            job_id: None,
            retrieval_id: None,
        }
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_retrieval(mut self, retrieval_id: RetrievalId) -> Self {
        self.retrieval_id = Some(retrieval_id);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct WatchOptions {
    /// Stream persisted entries before live ones.
    pub history: bool,
    /// Only deliver entries of this job.
    pub job_id: Option<JobId>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    cid: Cid,
    #[serde(default)]
    job_id: Option<JobId>,
    #[serde(default)]
    retrieval_id: Option<RetrievalId>,
    timestamp: i64,
    msg: String,
}

struct Watcher {
    user_id: UserId,
    cid: Cid,
    tx: mpsc::Sender<LogEntry>,
}

pub struct JobLogger {
    ds: SharedDatastore,
    last_timestamp: AtomicI64,
    next_watcher: AtomicU64,
    watchers: Mutex<HashMap<u64, Watcher>>,
}

impl JobLogger {
    pub fn new(ds: SharedDatastore) -> Self {
        Self {
            ds,
            last_timestamp: AtomicI64::new(0),
            next_watcher: AtomicU64::new(0),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Strictly increasing nanosecond timestamp so keys never collide.
    fn timestamp(&self) -> i64 {
        let now = now_nanos();
        let mut last = self.last_timestamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last_timestamp.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    /// Persists and broadcasts a log line. Failures are reported through
    /// tracing and never interrupt the caller.
    pub async fn log(&self, ctx: &LogContext, msg: impl Into<String>) {
        let msg = msg.into();
        info!(
            user_id = %ctx.user_id,
            cid = %ctx.cid,
            job_id = ctx.job_id.as_ref().map(|j| j.as_str()).unwrap_or_default(),
            "{msg}"
        );
        let timestamp = self.timestamp();
        let stored = StoredEntry {
            cid: ctx.cid.clone(),
            job_id: ctx.job_id.clone(),
            retrieval_id: ctx.retrieval_id.clone(),
            timestamp,
            msg,
        };
        let key = cid_prefix(&ctx.user_id, &ctx.cid).child(timestamp.to_string());
        match serde_json::to_vec(&stored) {
            Ok(buf) => {
                if let Err(err) = self.ds.put(&key, buf).await {
                    error!(error = ?err, "Persisting job log entry failed");
                }
            }
            Err(err) => error!(error = ?err, "Encoding job log entry failed"),
        }

        let entry = LogEntry {
            user_id: ctx.user_id.clone(),
            cid: stored.cid,
            timestamp,
            job_id: stored.job_id,
            msg: stored.msg,
        };
        let mut watchers = self.watchers.lock();
        watchers.retain(|id, watcher| {
            if watcher.user_id != entry.user_id || watcher.cid != entry.cid {
                return true;
            }
            match watcher.tx.try_send(entry.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(watcher = id, "Dropping slow job log watcher");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Persisted entries of a `(user, cid)` ascending by time.
    pub async fn get_by_cid(&self, user: &UserId, cid: &Cid) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for raw in self.ds.query(&cid_prefix(user, cid)).await? {
            let stored: StoredEntry = serde_json::from_slice(&raw.value)?;
            entries.push(LogEntry {
                user_id: user.clone(),
                cid: stored.cid,
                timestamp: stored.timestamp,
                job_id: stored.job_id,
                msg: stored.msg,
            });
        }
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    /// Forwards log entries of `(user, cid)` into `out` until `cancel` fires,
    /// the receiver goes away, or this watcher falls behind and is dropped.
    pub async fn watch(
        &self,
        cancel: CancellationToken,
        out: mpsc::Sender<LogEntry>,
        user: &UserId,
        cid: &Cid,
        opts: WatchOptions,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(WATCHER_BUFFER);
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().insert(
            id,
            Watcher {
                user_id: user.clone(),
                cid: cid.clone(),
                tx,
            },
        );

        let result = self.forward(&cancel, &out, &mut rx, user, cid, &opts).await;
        self.watchers.lock().remove(&id);
        result
    }

    async fn forward(
        &self,
        cancel: &CancellationToken,
        out: &mpsc::Sender<LogEntry>,
        rx: &mut mpsc::Receiver<LogEntry>,
        user: &UserId,
        cid: &Cid,
        opts: &WatchOptions,
    ) -> Result<()> {
        let matches = |entry: &LogEntry| match &opts.job_id {
            Some(job_id) => entry.job_id.as_ref() == Some(job_id),
            None => true,
        };

        let mut watermark = i64::MIN;
        if opts.history {
            for entry in self.get_by_cid(user, cid).await? {
                watermark = entry.timestamp;
                if matches(&entry) && out.send(entry).await.is_err() {
                    return Ok(());
                }
            }
        }

        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                entry = rx.recv() => match entry {
                    Some(entry) => entry,
                    None => return Ok(()),
                },
            };
            if entry.timestamp <= watermark || !matches(&entry) {
                continue;
            }
            if out.send(entry).await.is_err() {
                return Ok(());
            }
        }
    }

    pub fn close(&self) {
        self.watchers.lock().clear();
        info!("Job logger closed");
    }
}
