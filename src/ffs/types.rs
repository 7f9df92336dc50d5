use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lotus::{ChainEpoch, Cid, DealInfo};
use crate::notifications::{alerts, events};

/// Minimum deal duration accepted by the network: 180 days of epochs.
pub const MIN_DEAL_DURATION: i64 = 180 * crate::lotus::EPOCHS_PER_DAY;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Tenant identifier.
    UserId
);
string_id!(JobId);
string_id!(
    /// Stable identifier of a retrieval derived from its parameters.
    RetrievalId
);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl RetrievalId {
    pub fn from_parts(created_at: i64, from: &str, miner: &str, root: &Cid) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(created_at.to_le_bytes());
        hasher.update(from.as_bytes());
        hasher.update(miner.as_bytes());
        hasher.update(root.as_str().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }
}

/// Current time as unix nanoseconds.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    Unspecified,
    Queued,
    Executing,
    Failed,
    Canceled,
    Success,
}

impl JobStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Canceled | JobStatus::Success
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Unspecified => "Unspecified",
            JobStatus::Queued => "Queued",
            JobStatus::Executing => "Executing",
            JobStatus::Failed => "Failed",
            JobStatus::Canceled => "Canceled",
            JobStatus::Success => "Success",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed deal proposal attributed to a miner.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealError {
    pub proposal_cid: Option<Cid>,
    pub miner: String,
    pub message: String,
}

impl fmt::Display for DealError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.miner, self.message)
    }
}

/// Unit of scheduling for storage convergence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageJob {
    pub id: JobId,
    pub user_id: UserId,
    pub cid: Cid,
    pub status: JobStatus,
    pub err_cause: String,
    pub deal_info: Vec<DealInfo>,
    pub deal_errors: Vec<DealError>,
    /// Unix nanoseconds.
    pub created_at: i64,
    /// Target placement the job converges to.
    #[serde(default)]
    pub config: StorageConfig,
    /// Cid whose hot pin is moved to `cid`, if any.
    #[serde(default)]
    pub replaced_cid: Option<Cid>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalJob {
    pub id: JobId,
    pub user_id: UserId,
    pub retrieval_id: RetrievalId,
    pub data_cid: Cid,
    pub piece_cid: Option<Cid>,
    /// Candidate miners requested by the caller; empty means any.
    pub miners: Vec<String>,
    pub selector: String,
    /// Miner the data was eventually retrieved from.
    pub miner: Option<String>,
    pub wallet: String,
    pub max_price: u64,
    pub status: JobStatus,
    pub err_cause: String,
    pub created_at: i64,
}

/// Declarative target placement of a cid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub hot: HotConfig,
    pub cold: ColdConfig,
    #[serde(default)]
    pub repairable: bool,
    #[serde(default)]
    pub notifications: Vec<NotificationConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotConfig {
    pub enabled: bool,
    #[serde(default)]
    pub allow_unfreeze: bool,
    #[serde(default)]
    pub unfreeze_max_price: u64,
    pub ipfs: IpfsConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpfsConfig {
    /// Seconds allowed for fetching the data from the IPFS network.
    pub add_timeout: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColdConfig {
    pub enabled: bool,
    pub filecoin: FilConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilConfig {
    pub rep_factor: usize,
    pub deal_min_duration: i64,
    #[serde(default)]
    pub excluded_miners: Vec<String>,
    #[serde(default)]
    pub trusted_miners: Vec<String>,
    #[serde(default)]
    pub country_codes: Vec<String>,
    #[serde(default)]
    pub renew: FilRenew,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub max_price: u64,
    #[serde(default)]
    pub fast_retrieval: bool,
    #[serde(default)]
    pub deal_start_offset: i64,
    #[serde(default)]
    pub verified_deal: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilRenew {
    pub enabled: bool,
    /// Epochs before expiration at which a renewal is attempted.
    pub threshold: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAlert {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub threshold: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub webhook: Webhook,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub alerts: Vec<WebhookAlert>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            hot: HotConfig {
                enabled: true,
                allow_unfreeze: false,
                unfreeze_max_price: 0,
                ipfs: IpfsConfig { add_timeout: 30 },
            },
            cold: ColdConfig {
                enabled: true,
                filecoin: FilConfig {
                    rep_factor: 1,
                    deal_min_duration: MIN_DEAL_DURATION,
                    ..FilConfig::default()
                },
            },
            repairable: false,
            notifications: Vec::new(),
        }
    }
}

impl StorageConfig {
    pub fn with_hot_enabled(mut self, enabled: bool) -> Self {
        self.hot.enabled = enabled;
        self
    }

    pub fn with_cold_enabled(mut self, enabled: bool) -> Self {
        self.cold.enabled = enabled;
        self
    }

    pub fn with_repairable(mut self, enabled: bool) -> Self {
        self.repairable = enabled;
        self
    }

    pub fn with_rep_factor(mut self, rep_factor: usize) -> Self {
        self.cold.filecoin.rep_factor = rep_factor;
        self
    }

    pub fn with_max_price(mut self, max_price: u64) -> Self {
        self.cold.filecoin.max_price = max_price;
        self
    }

    pub fn with_cold_addr(mut self, addr: impl Into<String>) -> Self {
        self.cold.filecoin.addr = addr.into();
        self
    }

    pub fn with_renew(mut self, enabled: bool, threshold: i64) -> Self {
        self.cold.filecoin.renew = FilRenew { enabled, threshold };
        self
    }

    pub fn with_notifications(mut self, notifications: Vec<NotificationConfig>) -> Self {
        self.notifications = notifications;
        self
    }

    /// True when the scheduler must keep re-evaluating this config.
    pub fn needs_tracking(&self) -> bool {
        self.repairable || (self.cold.enabled && self.cold.filecoin.renew.enabled)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hot.enabled && self.hot.ipfs.add_timeout <= 0 {
            return Err(invalid(format!(
                "hot add timeout should be greater than 0 seconds, got {}",
                self.hot.ipfs.add_timeout
            )));
        }
        if self.cold.enabled {
            self.cold.filecoin.validate()?;
        }
        if (self.repairable || self.cold.filecoin.renew.enabled)
            && !self.hot.enabled
            && !self.cold.enabled
        {
            return Err(invalid(
                "repair or renewal requires hot or cold storage enabled".to_string(),
            ));
        }
        for notification in &self.notifications {
            notification.validate()?;
        }
        Ok(())
    }
}

impl FilConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rep_factor == 0 {
            return Err(invalid(
                "replication factor should be greater than zero".to_string(),
            ));
        }
        if self.deal_min_duration < MIN_DEAL_DURATION {
            return Err(invalid(format!(
                "deal duration should be at least {MIN_DEAL_DURATION}, got {}",
                self.deal_min_duration
            )));
        }
        if self.addr.trim().is_empty() {
            return Err(invalid("invalid wallet address".to_string()));
        }
        if self.renew.enabled && self.renew.threshold <= 0 {
            return Err(invalid(format!(
                "renew threshold should be positive, got {}",
                self.renew.threshold
            )));
        }
        Ok(())
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.webhook.url)
            .map_err(|err| invalid(format!("invalid webhook url {}: {err}", self.webhook.url)))?;
        for event in &self.events {
            if !events::is_known(event) {
                return Err(invalid(format!("unknown notification event {event}")));
            }
        }
        for alert in &self.alerts {
            alerts::validate(alert).map_err(|err| invalid(err.to_string()))?;
        }
        Ok(())
    }
}

fn invalid(message: String) -> Error {
    Error::InvalidConfig(message)
}

/// Last-known converged placement of a cid for a user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub user_id: UserId,
    pub job_id: JobId,
    pub cid: Cid,
    pub created: Option<DateTime<Utc>>,
    pub hot: HotInfo,
    pub cold: ColdInfo,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotInfo {
    pub enabled: bool,
    pub size: u64,
    pub ipfs: IpfsHotInfo,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpfsHotInfo {
    pub created: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColdInfo {
    pub enabled: bool,
    pub filecoin: FilInfo,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilInfo {
    pub data_cid: Cid,
    pub size: u64,
    pub proposals: Vec<FilStorage>,
}

/// An accepted and active deal backing a cid.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilStorage {
    pub proposal_cid: Cid,
    pub piece_cid: Cid,
    pub deal_id: u64,
    pub renewed: bool,
    pub duration: i64,
    pub activation_epoch: ChainEpoch,
    pub start_epoch: ChainEpoch,
    pub miner: String,
    pub epoch_price: u64,
}

impl FilStorage {
    pub fn expiration_epoch(&self) -> ChainEpoch {
        self.start_epoch + self.duration
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalInfo {
    pub id: RetrievalId,
    pub data_cid: Cid,
    pub total_paid: u64,
    pub miner: String,
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub user_id: UserId,
    pub cid: Cid,
    pub timestamp: i64,
    pub job_id: Option<JobId>,
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> StorageConfig {
        StorageConfig::default().with_cold_addr("f3wallet")
    }

    #[test]
    fn default_config_is_valid_once_addressed() {
        assert!(valid().validate().is_ok());
        assert!(matches!(
            StorageConfig::default().validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_zero_replication_and_short_duration() {
        assert!(valid().with_rep_factor(0).validate().is_err());
        let mut cfg = valid();
        cfg.cold.filecoin.deal_min_duration = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn repairable_needs_some_storage() {
        let cfg = valid()
            .with_hot_enabled(false)
            .with_cold_enabled(false)
            .with_repairable(true);
        assert!(cfg.validate().is_err());
        assert!(
            valid()
                .with_hot_enabled(false)
                .with_cold_enabled(false)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn renew_requires_threshold() {
        assert!(valid().with_renew(true, 0).validate().is_err());
        assert!(valid().with_renew(true, 100).validate().is_ok());
        assert!(valid().with_renew(true, 100).needs_tracking());
    }

    #[test]
    fn notification_events_must_be_known() {
        let cfg = valid().with_notifications(vec![NotificationConfig {
            webhook: Webhook {
                url: "https://hooks.example.com/pg".into(),
                headers: BTreeMap::new(),
            },
            events: vec!["storage-deal-teleported".into()],
            alerts: vec![],
        }]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retrieval_id_is_stable() {
        let root = Cid::from("bafyroot");
        let a = RetrievalId::from_parts(1, "f3a", "f01", &root);
        let b = RetrievalId::from_parts(1, "f3a", "f01", &root);
        let c = RetrievalId::from_parts(2, "f3a", "f01", &root);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }
}
