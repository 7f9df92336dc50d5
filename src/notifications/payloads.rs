//! Job updates delivered to webhooks and their JSON bodies.

use serde::Serialize;
use serde_json::Value;

use super::alerts::{self, DEAL_EXPIRATION_CHECK, DISK_SPACE_CHECK};
use super::events::{self, Domain, Verb};
use crate::ffs::types::{
    DealError, JobId, JobStatus, RetrievalInfo, RetrievalJob, StorageJob, WebhookAlert,
};
use crate::lotus::{ChainEpoch, Cid, DealInfo, DealState};

/// Something that happened to a registered job.
#[derive(Debug, Clone)]
pub enum Update {
    /// A deal of an executing storage job changed state.
    StorageJob { job: StorageJob, deal: DealInfo },
    /// The storage job reached a terminal status.
    FinalStorageJob { job: StorageJob },
    RetrievalJob {
        job: RetrievalJob,
        info: Option<RetrievalInfo>,
    },
    DiskSpace { job_id: JobId, available: u64 },
    DealExpiration {
        job_id: JobId,
        deal_id: u64,
        piece_cid: Cid,
        miner: String,
        expiry_epoch: ChainEpoch,
        current_epoch: ChainEpoch,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StorageJobNotification<'a> {
    cid: &'a str,
    job_id: &'a JobId,
    job_status: &'a str,
    miner: &'a str,
    price: u64,
    proposal_cid: &'a str,
    #[serde(skip_serializing_if = "is_zero")]
    deal_id: u64,
    deal_status: String,
    #[serde(rename = "error", skip_serializing_if = "str::is_empty")]
    err_cause: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    message: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinalStorageJobNotification<'a> {
    job_id: &'a JobId,
    job_status: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    job_error: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    deal_errors: Vec<DealErrorPayload<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DealErrorPayload<'a> {
    proposal_cid: &'a str,
    miner: &'a str,
    #[serde(rename = "error")]
    message: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrievalJobNotification<'a> {
    job_id: &'a JobId,
    job_status: &'a str,
    retrieval_id: &'a str,
    data_cid: &'a str,
    total_paid: u64,
    miner: &'a str,
    size: u64,
    created_at: String,
    #[serde(rename = "error", skip_serializing_if = "str::is_empty")]
    err_cause: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiskSpaceAlertNotification<'a> {
    job_id: &'a JobId,
    alert_type: &'a str,
    available_disk_space: String,
    error: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DealExpirationAlertNotification<'a> {
    alert_type: &'a str,
    job_id: &'a JobId,
    deal_id: u64,
    piece_cid: &'a str,
    miner: &'a str,
    epoch_till_expiration: i64,
    error: &'a str,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Human size with binary units, e.g. `9.5GiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        return format!("{bytes}B");
    }
    let number = format!("{value:.4}");
    let number = number.trim_end_matches('0').trim_end_matches('.');
    format!("{number}{}", UNITS[unit])
}

impl Update {
    pub fn job_id(&self) -> &JobId {
        match self {
            Update::StorageJob { job, .. } | Update::FinalStorageJob { job } => &job.id,
            Update::RetrievalJob { job, .. } => &job.id,
            Update::DiskSpace { job_id, .. } | Update::DealExpiration { job_id, .. } => job_id,
        }
    }

    /// Final updates deregister the job once delivered.
    pub fn is_final(&self) -> bool {
        match self {
            Update::FinalStorageJob { .. } => true,
            Update::RetrievalJob { job, .. } => job.status.is_final(),
            _ => false,
        }
    }

    fn domain_and_verbs(&self) -> Option<(Domain, Vec<Verb>)> {
        match self {
            Update::StorageJob { job, deal } => {
                let mut verbs = Vec::new();
                if deal.deal_id != 0 {
                    verbs.push(Verb::Created);
                }
                match deal.state {
                    DealState::Active => verbs.push(Verb::Completed),
                    DealState::Failing | DealState::Error => verbs.push(Verb::Failed),
                    DealState::Expired => verbs.push(Verb::Expired),
                    DealState::Slashed => verbs.push(Verb::Slashed),
                    _ => {}
                }
                if job.status == JobStatus::Failed && !verbs.contains(&Verb::Failed) {
                    verbs.push(Verb::Failed);
                }
                if job.status == JobStatus::Canceled {
                    verbs.push(Verb::Canceled);
                }
                Some((Domain::StorageDeal, verbs))
            }
            Update::FinalStorageJob { job } => Some((Domain::StorageDeal, status_verbs(job.status))),
            Update::RetrievalJob { job, .. } => {
                let mut verbs = status_verbs(job.status);
                if job.status == JobStatus::Executing {
                    verbs.push(Verb::Created);
                }
                Some((Domain::DataRetrieval, verbs))
            }
            Update::DiskSpace { .. } | Update::DealExpiration { .. } => None,
        }
    }

    pub fn matches_event(&self, event: &str) -> bool {
        match self.domain_and_verbs() {
            Some((domain, verbs)) => events::matches(event, domain, &verbs),
            None => false,
        }
    }

    pub fn matches_alert(&self, alert: &WebhookAlert) -> bool {
        match self {
            Update::DiskSpace { available, .. } => {
                alert.alert_type == DISK_SPACE_CHECK
                    && alerts::parse_size(&alert.threshold)
                        .map(|threshold| *available < threshold)
                        .unwrap_or(false)
            }
            Update::DealExpiration {
                expiry_epoch,
                current_epoch,
                ..
            } => {
                if alert.alert_type != DEAL_EXPIRATION_CHECK {
                    return false;
                }
                let Ok(threshold) = alerts::parse_duration(&alert.threshold) else {
                    return false;
                };
                expiry_epoch <= current_epoch
                    || expiry_epoch - current_epoch < alerts::duration_to_epochs(threshold)
            }
            _ => false,
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Update::StorageJob { job, deal } => serde_json::to_value(StorageJobNotification {
                cid: job.cid.as_str(),
                job_id: &job.id,
                job_status: job.status.as_str(),
                miner: &deal.provider,
                price: deal.price_per_epoch,
                proposal_cid: deal.proposal_cid.as_str(),
                deal_id: deal.deal_id,
                deal_status: deal.state.name(),
                err_cause: &job.err_cause,
                message: &deal.message,
            }),
            Update::FinalStorageJob { job } => {
                serde_json::to_value(FinalStorageJobNotification {
                    job_id: &job.id,
                    job_status: job.status.as_str(),
                    job_error: &job.err_cause,
                    deal_errors: job.deal_errors.iter().map(deal_error).collect(),
                })
            }
            Update::RetrievalJob { job, info } => {
                let info = info.clone().unwrap_or_default();
                serde_json::to_value(RetrievalJobNotification {
                    job_id: &job.id,
                    job_status: job.status.as_str(),
                    retrieval_id: job.retrieval_id.as_str(),
                    data_cid: job.data_cid.as_str(),
                    total_paid: info.total_paid,
                    miner: job.miner.as_deref().unwrap_or(&info.miner),
                    size: info.size,
                    created_at: info.created_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    err_cause: &job.err_cause,
                })
            }
            Update::DiskSpace { job_id, available } => {
                serde_json::to_value(DiskSpaceAlertNotification {
                    job_id,
                    alert_type: DISK_SPACE_CHECK,
                    available_disk_space: format_bytes(*available),
                    error: "available disk space below threshold",
                })
            }
            Update::DealExpiration {
                job_id,
                deal_id,
                piece_cid,
                miner,
                expiry_epoch,
                current_epoch,
            } => {
                let (epoch_till_expiration, error) = if expiry_epoch > current_epoch {
                    (expiry_epoch - current_epoch, "deal close to expiration")
                } else {
                    (0, "deal already expired")
                };
                serde_json::to_value(DealExpirationAlertNotification {
                    alert_type: DEAL_EXPIRATION_CHECK,
                    job_id,
                    deal_id: *deal_id,
                    piece_cid: piece_cid.as_str(),
                    miner,
                    epoch_till_expiration,
                    error,
                })
            }
        }
    }
}

fn status_verbs(status: JobStatus) -> Vec<Verb> {
    match status {
        JobStatus::Success => vec![Verb::Completed],
        JobStatus::Failed => vec![Verb::Failed],
        JobStatus::Canceled => vec![Verb::Canceled],
        _ => Vec::new(),
    }
}

fn deal_error(err: &DealError) -> DealErrorPayload<'_> {
    DealErrorPayload {
        proposal_cid: err.proposal_cid.as_ref().map(Cid::as_str).unwrap_or_default(),
        miner: &err.miner,
        message: &err.message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffs::types::UserId;

    fn job(status: JobStatus) -> StorageJob {
        StorageJob {
            id: JobId::from("job-1"),
            user_id: UserId::from("u1"),
            cid: Cid::from("bafyx"),
            status,
            ..StorageJob::default()
        }
    }

    #[test]
    fn active_deal_matches_completed_events() {
        let update = Update::StorageJob {
            job: job(JobStatus::Executing),
            deal: DealInfo {
                state: DealState::Active,
                deal_id: 7,
                provider: "f01".into(),
                price_per_epoch: 500,
                ..DealInfo::default()
            },
        };
        assert!(update.matches_event("storage-deal-completed"));
        assert!(update.matches_event("*-created"));
        assert!(!update.matches_event("data-retrieval-completed"));

        let body = update.payload().unwrap();
        assert_eq!(body["miner"], "f01");
        assert_eq!(body["price"], 500);
        assert_eq!(body["dealStatus"], "StorageDealActive");
        assert!(body.get("error").is_none());
    }

    #[test]
    fn final_update_carries_deal_errors() {
        let mut failed = job(JobStatus::Failed);
        failed.err_cause = "not enough active deals".into();
        failed.deal_errors.push(DealError {
            proposal_cid: None,
            miner: "f02".into(),
            message: "rejected".into(),
        });
        let update = Update::FinalStorageJob { job: failed };
        assert!(update.is_final());
        assert!(update.matches_event("*-failed"));
        assert!(!update.matches_event("storage-deal-completed"));
        let body = update.payload().unwrap();
        assert_eq!(body["jobStatus"], "Failed");
        assert_eq!(body["dealErrors"][0]["miner"], "f02");
    }

    #[test]
    fn deal_expiration_alert_uses_epochs() {
        let update = Update::DealExpiration {
            job_id: JobId::from("job-1"),
            deal_id: 1,
            piece_cid: Cid::from("baga"),
            miner: "f01".into(),
            expiry_epoch: 1_000,
            current_epoch: 900,
        };
        let alert = |threshold: &str| WebhookAlert {
            alert_type: DEAL_EXPIRATION_CHECK.into(),
            threshold: threshold.into(),
        };
        // 100 epochs left: 1h is 120 epochs, 30m is 60.
        assert!(update.matches_alert(&alert("1h")));
        assert!(!update.matches_alert(&alert("30m")));
        assert!(!update.matches_event("*"));
    }

    #[test]
    fn disk_space_alert_compares_bytes() {
        let update = Update::DiskSpace {
            job_id: JobId::from("job-1"),
            available: 5 * 1024 * 1024 * 1024,
        };
        let alert = |threshold: &str| WebhookAlert {
            alert_type: DISK_SPACE_CHECK.into(),
            threshold: threshold.into(),
        };
        assert!(update.matches_alert(&alert("10GB")));
        assert!(!update.matches_alert(&alert("1GB")));
        assert_eq!(update.payload().unwrap()["availableDiskSpace"], "5GiB");
    }
}
