//! # Notifications
//!
//! Webhook fan-out for job updates. Jobs register their
//! [`NotificationConfig`]s when they start executing; every later
//! [`Update`] is matched against each config's events and alerts, and each
//! match becomes one HTTP `POST` handed to a bounded delivery pool.
//! Delivery is best-effort: failures are logged and counted, never retried.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NotifierConfig;
use crate::error::Result;
use crate::ffs::types::{JobId, NotificationConfig, Webhook};

pub mod alerts;
pub mod events;
pub mod payloads;

pub use payloads::Update;

struct Delivery {
    job_id: JobId,
    webhook: Webhook,
    body: Value,
}

pub struct Notifier {
    http: reqwest::Client,
    registrations: RwLock<HashMap<JobId, Vec<NotificationConfig>>>,
    queue: Mutex<Option<mpsc::Sender<Delivery>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    disk_path: PathBuf,
}

impl Notifier {
    /// Builds the notifier and spawns its delivery pool. `disk_path` is the
    /// filesystem probed by `datacap` alerts.
    pub fn new(config: &NotifierConfig, disk_path: PathBuf) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.webhook_timeout_seconds))
            .build()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let notifier = Arc::new(Self {
            http: http.clone(),
            registrations: RwLock::new(HashMap::new()),
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(None),
            disk_path,
        });

        let workers = config.workers.max(1);
        let handle = tokio::spawn(async move {
            let deliveries = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|delivery| (delivery, rx))
            });
            deliveries
                .for_each_concurrent(workers, |delivery| {
                    let http = http.clone();
                    async move { deliver(&http, delivery).await }
                })
                .await;
            debug!("Notifier delivery pool drained");
        });
        *notifier.worker.lock() = Some(handle);
        info!(workers, "Notifier started");
        Ok(notifier)
    }

    /// Associates `configs` with a job. Jobs without configs aren't tracked.
    pub fn register(&self, job_id: &JobId, configs: &[NotificationConfig]) {
        if configs.is_empty() {
            return;
        }
        self.registrations
            .write()
            .insert(job_id.clone(), configs.to_vec());
    }

    pub fn is_registered(&self, job_id: &JobId) -> bool {
        self.registrations.read().contains_key(job_id)
    }

    /// Queues one delivery per matching config. Final updates drop the
    /// registration afterwards.
    pub fn notify(&self, update: Update) {
        let configs = if update.is_final() {
            self.registrations.write().remove(update.job_id())
        } else {
            self.registrations.read().get(update.job_id()).cloned()
        };
        if let Some(configs) = configs {
            self.dispatch(&configs, &update);
        }
    }

    /// Matches `update` against `configs` without touching registrations.
    /// Used for alerts raised outside a job execution.
    pub fn notify_configs(&self, configs: &[NotificationConfig], update: Update) {
        self.dispatch(configs, &update);
    }

    fn dispatch(&self, configs: &[NotificationConfig], update: &Update) {
        let matching: Vec<_> = configs
            .iter()
            .filter(|cfg| {
                cfg.events.iter().any(|e| update.matches_event(e))
                    || cfg.alerts.iter().any(|a| update.matches_alert(a))
            })
            .collect();
        if matching.is_empty() {
            return;
        }

        let body = match update.payload() {
            Ok(body) => body,
            Err(err) => {
                error!(error = ?err, job_id = %update.job_id(), "Rendering notification failed");
                return;
            }
        };
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            warn!(job_id = %update.job_id(), "Notifier closed, dropping notification");
            return;
        };
        for cfg in matching {
            let delivery = Delivery {
                job_id: update.job_id().clone(),
                webhook: cfg.webhook.clone(),
                body: body.clone(),
            };
            if tx.try_send(delivery).is_err() {
                counter!("notifier_dropped_total").increment(1);
                warn!(job_id = %update.job_id(), "Notification queue full, dropping notification");
            }
        }
    }

    /// Emits a `datacap` update when the job has a disk space alert.
    pub fn check_disk_space(&self, job_id: &JobId) {
        let wants_check = self.registrations.read().get(job_id).is_some_and(|configs| {
            configs
                .iter()
                .flat_map(|c| c.alerts.iter())
                .any(|a| a.alert_type == alerts::DISK_SPACE_CHECK)
        });
        if !wants_check {
            return;
        }
        match alerts::available_disk_space(&self.disk_path) {
            Ok(available) => self.notify(Update::DiskSpace {
                job_id: job_id.clone(),
                available,
            }),
            Err(err) => warn!(error = %err, "Reading available disk space failed"),
        }
    }

    /// Stops accepting notifications and waits for queued deliveries.
    pub async fn close(&self) {
        self.queue.lock().take();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = ?err, "Notifier delivery pool panicked");
            }
        }
        info!("Notifier closed");
    }
}

async fn deliver(http: &reqwest::Client, delivery: Delivery) {
    let mut request = http.post(&delivery.webhook.url).json(&delivery.body);
    for (name, value) in &delivery.webhook.headers {
        request = request.header(name, value);
    }
    match request.send().await.and_then(|r| r.error_for_status()) {
        Ok(_) => {
            counter!("notifier_delivered_total").increment(1);
            debug!(job_id = %delivery.job_id, url = %delivery.webhook.url, "Delivered notification");
        }
        Err(err) => {
            counter!("notifier_failed_total").increment(1);
            warn!(
                job_id = %delivery.job_id,
                url = %delivery.webhook.url,
                error = %err,
                "Webhook delivery failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::ffs::types::{JobStatus, StorageJob};

    fn config() -> NotifierConfig {
        NotifierConfig {
            workers: 2,
            queue_capacity: 16,
            webhook_timeout_seconds: 5,
        }
    }

    fn webhook(server: &MockServer, events: &[&str]) -> NotificationConfig {
        NotificationConfig {
            webhook: Webhook {
                url: format!("{}/hook", server.uri()),
                headers: BTreeMap::from([("x-token".to_string(), "secret".to_string())]),
            },
            events: events.iter().map(|e| e.to_string()).collect(),
            alerts: Vec::new(),
        }
    }

    #[tokio::test]
    async fn posts_once_per_matching_config_and_deregisters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-token", "secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let notifier = Notifier::new(&config(), std::env::temp_dir()).unwrap();
        let job = StorageJob {
            id: JobId::from("job-1"),
            status: JobStatus::Success,
            ..StorageJob::default()
        };
        notifier.register(
            &job.id,
            &[
                webhook(&server, &["*-completed"]),
                webhook(&server, &["storage-deal-*"]),
                webhook(&server, &["data-retrieval-completed"]),
            ],
        );
        notifier.notify(Update::FinalStorageJob { job: job.clone() });
        assert!(!notifier.is_registered(&job.id));
        notifier.notify(Update::FinalStorageJob { job });

        notifier.close().await;
        server.verify().await;
    }
}
