//! Configuration loading for the Powergate daemon.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `POWERGATE_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application configuration derived from `POWERGATE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_health_bind_addr")]
    pub health_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_datastore_url")]
    pub datastore_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub lotus: LotusConfig,
    #[serde(default)]
    pub ipfs: IpfsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ask_index: AskIndexConfig,
    #[serde(default)]
    pub miner_index: MinerIndexConfig,
    #[serde(default)]
    pub faults_index: FaultsIndexConfig,
    #[serde(default)]
    pub miner_selector: MinerSelectorConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

/// Lotus full-node JSON-RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct LotusConfig {
    #[serde(default = "default_lotus_api_url")]
    pub api_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_lotus_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

/// IPFS HTTP API endpoint used by the hot storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct IpfsConfig {
    #[serde(default = "default_ipfs_api_url")]
    pub api_url: String,
    #[serde(default = "default_ipfs_add_timeout_seconds")]
    pub add_timeout_seconds: u64,
}

/// Storage/retrieval scheduler parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_max_parallel_storage")]
    pub max_parallel_storage: usize,
    #[serde(default = "default_scheduler_max_parallel_retrieval")]
    pub max_parallel_retrieval: usize,
    #[serde(default = "default_scheduler_repair_interval_seconds")]
    pub repair_interval_seconds: u64,
    #[serde(default = "default_scheduler_renew_interval_seconds")]
    pub renew_interval_seconds: u64,
    #[serde(default = "default_scheduler_gc_interval_seconds")]
    pub gc_interval_seconds: u64,
    #[serde(default = "default_scheduler_gc_staged_grace_seconds")]
    pub gc_staged_grace_seconds: u64,
    #[serde(default = "default_scheduler_deal_watch_poll_ms")]
    pub deal_watch_poll_ms: u64,
    #[serde(default = "default_scheduler_deal_finality_timeout_seconds")]
    pub deal_finality_timeout_seconds: u64,
}

/// Ask index refresh parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AskIndexConfig {
    #[serde(default)]
    pub disable: bool,
    #[serde(default = "default_ask_query_timeout_seconds")]
    pub query_ask_timeout_seconds: u64,
    #[serde(default = "default_ask_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_ask_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
    #[serde(default = "default_true")]
    pub refresh_on_start: bool,
}

/// Miner index refresh parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct MinerIndexConfig {
    #[serde(default)]
    pub disable: bool,
    #[serde(default = "default_miner_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
    #[serde(default = "default_miner_onchain_max_parallel")]
    pub onchain_max_parallel: usize,
    #[serde(default = "default_miner_meta_max_parallel")]
    pub meta_max_parallel: usize,
    #[serde(default = "default_miner_flush_batch_size")]
    pub flush_batch_size: usize,
    #[serde(default = "default_true")]
    pub refresh_on_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_resolver_url: Option<String>,
}

/// Faults index parameters. Disabled unless explicitly enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FaultsIndexConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_faults_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
}

/// Which miner-selection strategy the executor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinerSelectorStrategy {
    Reptop,
    Sr2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct MinerSelectorConfig {
    #[serde(default = "default_miner_selector_strategy")]
    pub strategy: MinerSelectorStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sr2_url: Option<String>,
}

/// Webhook delivery pool parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct NotifierConfig {
    #[serde(default = "default_notifier_workers")]
    pub workers: usize,
    #[serde(default = "default_notifier_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_notifier_webhook_timeout_seconds")]
    pub webhook_timeout_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            health_bind_addr: default_health_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            datastore_url: default_datastore_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            wallet_address: None,
            lotus: LotusConfig::default(),
            ipfs: IpfsConfig::default(),
            scheduler: SchedulerConfig::default(),
            ask_index: AskIndexConfig::default(),
            miner_index: MinerIndexConfig::default(),
            faults_index: FaultsIndexConfig::default(),
            miner_selector: MinerSelectorConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

impl Default for LotusConfig {
    fn default() -> Self {
        Self {
            api_url: default_lotus_api_url(),
            token: None,
            call_timeout_ms: default_lotus_call_timeout_ms(),
        }
    }
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            api_url: default_ipfs_api_url(),
            add_timeout_seconds: default_ipfs_add_timeout_seconds(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_storage: default_scheduler_max_parallel_storage(),
            max_parallel_retrieval: default_scheduler_max_parallel_retrieval(),
            repair_interval_seconds: default_scheduler_repair_interval_seconds(),
            renew_interval_seconds: default_scheduler_renew_interval_seconds(),
            gc_interval_seconds: default_scheduler_gc_interval_seconds(),
            gc_staged_grace_seconds: default_scheduler_gc_staged_grace_seconds(),
            deal_watch_poll_ms: default_scheduler_deal_watch_poll_ms(),
            deal_finality_timeout_seconds: default_scheduler_deal_finality_timeout_seconds(),
        }
    }
}

impl Default for AskIndexConfig {
    fn default() -> Self {
        Self {
            disable: false,
            query_ask_timeout_seconds: default_ask_query_timeout_seconds(),
            max_parallel: default_ask_max_parallel(),
            refresh_interval_seconds: default_ask_refresh_interval_seconds(),
            refresh_on_start: true,
        }
    }
}

impl Default for MinerIndexConfig {
    fn default() -> Self {
        Self {
            disable: false,
            refresh_interval_seconds: default_miner_refresh_interval_seconds(),
            onchain_max_parallel: default_miner_onchain_max_parallel(),
            meta_max_parallel: default_miner_meta_max_parallel(),
            flush_batch_size: default_miner_flush_batch_size(),
            refresh_on_start: true,
            location_resolver_url: None,
        }
    }
}

impl Default for FaultsIndexConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            refresh_interval_seconds: default_faults_refresh_interval_seconds(),
        }
    }
}

impl Default for MinerSelectorConfig {
    fn default() -> Self {
        Self {
            strategy: default_miner_selector_strategy(),
            sr2_url: None,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            workers: default_notifier_workers(),
            queue_capacity: default_notifier_queue_capacity(),
            webhook_timeout_seconds: default_notifier_webhook_timeout_seconds(),
        }
    }
}

impl AppConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.health_bind_addr.parse()
    }

    /// Pretty JSON dump with secrets replaced, suitable for startup logs.
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.lotus.token.is_some() {
            config.lotus.token = Some("[REDACTED]".to_string());
        }
        if let Some(url) = config.datastore_url.split_once('@') {
            config.datastore_url = format!("[REDACTED]@{}", url.1);
        }
        serde_json::to_string_pretty(&config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.datastore_url.trim().is_empty() {
            return Err(ConfigError::MissingDatastoreUrl);
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }
        self.lotus.validate()?;
        self.ipfs.validate()?;
        self.scheduler.validate()?;
        self.ask_index.validate()?;
        self.miner_index.validate()?;
        self.miner_selector.validate()?;
        self.notifier.validate()?;
        Ok(())
    }
}

impl LotusConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.api_url).map_err(|err| ConfigError::InvalidUrl {
            field: "LOTUS_API_URL",
            value: self.api_url.clone(),
            error: err.to_string(),
        })?;
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::NonPositive {
                field: "LOTUS_CALL_TIMEOUT_MS",
            });
        }
        Ok(())
    }
}

impl IpfsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.api_url).map_err(|err| ConfigError::InvalidUrl {
            field: "IPFS_API_URL",
            value: self.api_url.clone(),
            error: err.to_string(),
        })?;
        if self.add_timeout_seconds == 0 {
            return Err(ConfigError::NonPositive {
                field: "IPFS_ADD_TIMEOUT_SECONDS",
            });
        }
        Ok(())
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_storage == 0 || self.max_parallel_storage > 256 {
            return Err(ConfigError::InvalidParallelism {
                field: "SCHEDULER_MAX_PARALLEL_STORAGE",
                value: self.max_parallel_storage,
            });
        }
        if self.max_parallel_retrieval == 0 || self.max_parallel_retrieval > 256 {
            return Err(ConfigError::InvalidParallelism {
                field: "SCHEDULER_MAX_PARALLEL_RETRIEVAL",
                value: self.max_parallel_retrieval,
            });
        }
        if self.repair_interval_seconds == 0 {
            return Err(ConfigError::NonPositive {
                field: "SCHEDULER_REPAIR_INTERVAL_SECONDS",
            });
        }
        if self.renew_interval_seconds == 0 {
            return Err(ConfigError::NonPositive {
                field: "SCHEDULER_RENEW_INTERVAL_SECONDS",
            });
        }
        if self.gc_interval_seconds == 0 {
            return Err(ConfigError::NonPositive {
                field: "SCHEDULER_GC_INTERVAL_SECONDS",
            });
        }
        if self.deal_watch_poll_ms == 0 {
            return Err(ConfigError::NonPositive {
                field: "SCHEDULER_DEAL_WATCH_POLL_MS",
            });
        }
        Ok(())
    }
}

impl AskIndexConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::InvalidParallelism {
                field: "ASK_INDEX_MAX_PARALLEL",
                value: self.max_parallel,
            });
        }
        if self.query_ask_timeout_seconds == 0 {
            return Err(ConfigError::NonPositive {
                field: "ASK_INDEX_QUERY_ASK_TIMEOUT_SECONDS",
            });
        }
        if self.refresh_interval_seconds == 0 {
            return Err(ConfigError::NonPositive {
                field: "ASK_INDEX_REFRESH_INTERVAL_SECONDS",
            });
        }
        Ok(())
    }
}

impl MinerIndexConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.onchain_max_parallel == 0 {
            return Err(ConfigError::InvalidParallelism {
                field: "MINER_INDEX_ONCHAIN_MAX_PARALLEL",
                value: self.onchain_max_parallel,
            });
        }
        if self.meta_max_parallel == 0 {
            return Err(ConfigError::InvalidParallelism {
                field: "MINER_INDEX_META_MAX_PARALLEL",
                value: self.meta_max_parallel,
            });
        }
        if self.flush_batch_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "MINER_INDEX_FLUSH_BATCH_SIZE",
            });
        }
        if let Some(resolver) = &self.location_resolver_url {
            url::Url::parse(resolver).map_err(|err| ConfigError::InvalidUrl {
                field: "MINER_INDEX_LOCATION_RESOLVER_URL",
                value: resolver.clone(),
                error: err.to_string(),
            })?;
        }
        Ok(())
    }
}

impl MinerSelectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.strategy, &self.sr2_url) {
            (MinerSelectorStrategy::Sr2, None) => Err(ConfigError::MissingSr2Url),
            (MinerSelectorStrategy::Sr2, Some(raw)) => {
                url::Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
                    field: "MINER_SELECTOR_SR2_URL",
                    value: raw.clone(),
                    error: err.to_string(),
                })?;
                Ok(())
            }
            (MinerSelectorStrategy::Reptop, _) => Ok(()),
        }
    }
}

impl NotifierConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 || self.workers > 64 {
            return Err(ConfigError::InvalidParallelism {
                field: "NOTIFIER_WORKERS",
                value: self.workers,
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::NonPositive {
                field: "NOTIFIER_QUEUE_CAPACITY",
            });
        }
        if self.webhook_timeout_seconds == 0 {
            return Err(ConfigError::NonPositive {
                field: "NOTIFIER_WEBHOOK_TIMEOUT_SECONDS",
            });
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_health_bind_addr() -> String {
    "0.0.0.0:6060".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_datastore_url() -> String {
    "sqlite://powergate.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_lotus_api_url() -> String {
    "http://127.0.0.1:1234/rpc/v0".to_string()
}

fn default_lotus_call_timeout_ms() -> u64 {
    30_000
}

fn default_ipfs_api_url() -> String {
    "http://127.0.0.1:5001".to_string()
}

fn default_ipfs_add_timeout_seconds() -> u64 {
    30
}

fn default_scheduler_max_parallel_storage() -> usize {
    4
}

fn default_scheduler_max_parallel_retrieval() -> usize {
    2
}

fn default_scheduler_repair_interval_seconds() -> u64 {
    86_400 // 24 hours
}

fn default_scheduler_renew_interval_seconds() -> u64 {
    86_400 // 24 hours
}

fn default_scheduler_gc_interval_seconds() -> u64 {
    3_600
}

fn default_scheduler_gc_staged_grace_seconds() -> u64 {
    3_600
}

fn default_scheduler_deal_watch_poll_ms() -> u64 {
    30_000 // one epoch
}

fn default_scheduler_deal_finality_timeout_seconds() -> u64 {
    86_400 * 2
}

fn default_ask_query_timeout_seconds() -> u64 {
    20
}

fn default_ask_max_parallel() -> usize {
    50
}

fn default_ask_refresh_interval_seconds() -> u64 {
    10 * 30 // 10 x average block time
}

fn default_miner_refresh_interval_seconds() -> u64 {
    6 * 3_600
}

fn default_miner_onchain_max_parallel() -> usize {
    1_000
}

fn default_miner_meta_max_parallel() -> usize {
    50
}

fn default_miner_flush_batch_size() -> usize {
    1_000
}

fn default_faults_refresh_interval_seconds() -> u64 {
    600
}

fn default_miner_selector_strategy() -> MinerSelectorStrategy {
    MinerSelectorStrategy::Reptop
}

fn default_notifier_workers() -> usize {
    4
}

fn default_notifier_queue_capacity() -> usize {
    1_000
}

fn default_notifier_webhook_timeout_seconds() -> u64 {
    10
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid health bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("datastore url is missing; set POWERGATE_DATASTORE_URL")]
    MissingDatastoreUrl,
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("{field} is not a valid url '{value}': {error}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        error: String,
    },
    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },
    #[error("{field} is out of range, got {value}")]
    InvalidParallelism { field: &'static str, value: usize },
    #[error("unknown miner selector strategy '{value}'; expected 'reptop' or 'sr2'")]
    InvalidSelectorStrategy { value: String },
    #[error("sr2 miner selector requires POWERGATE_MINER_SELECTOR_SR2_URL")]
    MissingSr2Url,
}

pub struct ConfigLoader {
    base_dir: PathBuf,
}

fn parse_or<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: fn() -> T,
) -> T {
    layered
        .remove(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(default)
}

fn string_or(layered: &mut BTreeMap<String, String>, key: &str, default: fn() -> String) -> String {
    layered
        .remove(key)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(default)
}

fn optional(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered.remove(key).and_then(|val| {
        let trimmed = val.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn flag(layered: &mut BTreeMap<String, String>, key: &str, default: bool) -> bool {
    layered
        .remove(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("POWERGATE_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);

        let strategy = match layered.remove("MINER_SELECTOR_STRATEGY") {
            None => default_miner_selector_strategy(),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "" | "reptop" => MinerSelectorStrategy::Reptop,
                "sr2" => MinerSelectorStrategy::Sr2,
                _ => return Err(ConfigError::InvalidSelectorStrategy { value: raw }),
            },
        };

        let l = &mut layered;
        let config = AppConfig {
            profile,
            health_bind_addr: string_or(l, "HEALTH_BIND_ADDR", default_health_bind_addr),
            log_level: string_or(l, "LOG_LEVEL", default_log_level),
            log_format: string_or(l, "LOG_FORMAT", default_log_format),
            datastore_url: string_or(l, "DATASTORE_URL", default_datastore_url),
            db_max_connections: parse_or(l, "DB_MAX_CONNECTIONS", default_db_max_connections),
            db_acquire_timeout_ms: parse_or(
                l,
                "DB_ACQUIRE_TIMEOUT_MS",
                default_db_acquire_timeout_ms,
            ),
            wallet_address: optional(l, "WALLET_ADDRESS"),
            lotus: LotusConfig {
                api_url: string_or(l, "LOTUS_API_URL", default_lotus_api_url),
                token: optional(l, "LOTUS_TOKEN"),
                call_timeout_ms: parse_or(l, "LOTUS_CALL_TIMEOUT_MS", default_lotus_call_timeout_ms),
            },
            ipfs: IpfsConfig {
                api_url: string_or(l, "IPFS_API_URL", default_ipfs_api_url),
                add_timeout_seconds: parse_or(
                    l,
                    "IPFS_ADD_TIMEOUT_SECONDS",
                    default_ipfs_add_timeout_seconds,
                ),
            },
            scheduler: SchedulerConfig {
                max_parallel_storage: parse_or(
                    l,
                    "SCHEDULER_MAX_PARALLEL_STORAGE",
                    default_scheduler_max_parallel_storage,
                ),
                max_parallel_retrieval: parse_or(
                    l,
                    "SCHEDULER_MAX_PARALLEL_RETRIEVAL",
                    default_scheduler_max_parallel_retrieval,
                ),
                repair_interval_seconds: parse_or(
                    l,
                    "SCHEDULER_REPAIR_INTERVAL_SECONDS",
                    default_scheduler_repair_interval_seconds,
                ),
                renew_interval_seconds: parse_or(
                    l,
                    "SCHEDULER_RENEW_INTERVAL_SECONDS",
                    default_scheduler_renew_interval_seconds,
                ),
                gc_interval_seconds: parse_or(
                    l,
                    "SCHEDULER_GC_INTERVAL_SECONDS",
                    default_scheduler_gc_interval_seconds,
                ),
                gc_staged_grace_seconds: parse_or(
                    l,
                    "SCHEDULER_GC_STAGED_GRACE_SECONDS",
                    default_scheduler_gc_staged_grace_seconds,
                ),
                deal_watch_poll_ms: parse_or(
                    l,
                    "SCHEDULER_DEAL_WATCH_POLL_MS",
                    default_scheduler_deal_watch_poll_ms,
                ),
                deal_finality_timeout_seconds: parse_or(
                    l,
                    "SCHEDULER_DEAL_FINALITY_TIMEOUT_SECONDS",
                    default_scheduler_deal_finality_timeout_seconds,
                ),
            },
            ask_index: AskIndexConfig {
                disable: flag(l, "ASK_INDEX_DISABLE", false),
                query_ask_timeout_seconds: parse_or(
                    l,
                    "ASK_INDEX_QUERY_ASK_TIMEOUT_SECONDS",
                    default_ask_query_timeout_seconds,
                ),
                max_parallel: parse_or(l, "ASK_INDEX_MAX_PARALLEL", default_ask_max_parallel),
                refresh_interval_seconds: parse_or(
                    l,
                    "ASK_INDEX_REFRESH_INTERVAL_SECONDS",
                    default_ask_refresh_interval_seconds,
                ),
                refresh_on_start: flag(l, "ASK_INDEX_REFRESH_ON_START", true),
            },
            miner_index: MinerIndexConfig {
                disable: flag(l, "MINER_INDEX_DISABLE", false),
                refresh_interval_seconds: parse_or(
                    l,
                    "MINER_INDEX_REFRESH_INTERVAL_SECONDS",
                    default_miner_refresh_interval_seconds,
                ),
                onchain_max_parallel: parse_or(
                    l,
                    "MINER_INDEX_ONCHAIN_MAX_PARALLEL",
                    default_miner_onchain_max_parallel,
                ),
                meta_max_parallel: parse_or(
                    l,
                    "MINER_INDEX_META_MAX_PARALLEL",
                    default_miner_meta_max_parallel,
                ),
                flush_batch_size: parse_or(
                    l,
                    "MINER_INDEX_FLUSH_BATCH_SIZE",
                    default_miner_flush_batch_size,
                ),
                refresh_on_start: flag(l, "MINER_INDEX_REFRESH_ON_START", true),
                location_resolver_url: optional(l, "MINER_INDEX_LOCATION_RESOLVER_URL"),
            },
            faults_index: FaultsIndexConfig {
                enabled: flag(l, "FAULTS_INDEX_ENABLED", false),
                refresh_interval_seconds: parse_or(
                    l,
                    "FAULTS_INDEX_REFRESH_INTERVAL_SECONDS",
                    default_faults_refresh_interval_seconds,
                ),
            },
            miner_selector: MinerSelectorConfig {
                strategy,
                sr2_url: optional(l, "MINER_SELECTOR_SR2_URL"),
            },
            notifier: NotifierConfig {
                workers: parse_or(l, "NOTIFIER_WORKERS", default_notifier_workers),
                queue_capacity: parse_or(
                    l,
                    "NOTIFIER_QUEUE_CAPACITY",
                    default_notifier_queue_capacity,
                ),
                webhook_timeout_seconds: parse_or(
                    l,
                    "NOTIFIER_WEBHOOK_TIMEOUT_SECONDS",
                    default_notifier_webhook_timeout_seconds,
                ),
            },
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.health_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("POWERGATE_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("POWERGATE_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
