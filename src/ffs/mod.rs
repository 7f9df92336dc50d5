//! # FFS
//!
//! Declarative storage of cids across hot (IPFS) and cold (Filecoin)
//! layers. The [`scheduler`] converges every pushed [`StorageConfig`] by
//! running jobs against the [`HotStorage`] and [`ColdStorage`] seams.

pub mod coreipfs;
pub mod filcold;
pub mod interfaces;
pub mod joblogger;
pub mod minerselector;
pub mod scheduler;
pub mod types;

pub use interfaces::{
    ColdStorage, FetchInfo, FetchRequest, HotStorage, MinerProposal, MinerSelector,
    MinerSelectorFilter, SharedColdStorage, SharedHotStorage, SharedMinerSelector, StoreResult,
};
pub use types::{
    ColdConfig, DealError, FilConfig, FilInfo, FilRenew, FilStorage, HotConfig, JobId, JobStatus,
    LogEntry, NotificationConfig, RetrievalId, RetrievalInfo, RetrievalJob, StorageConfig,
    StorageInfo, StorageJob, UserId, Webhook, WebhookAlert,
};
