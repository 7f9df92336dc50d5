//! # Error Handling
//!
//! Crate-wide error type. Every failure is classified into one of the
//! [`ErrorKind`]s so callers can decide whether to surface it synchronously,
//! record it on a job, retry at the next tick, or stop the process.

use thiserror::Error;

use crate::chainstore::ChainstoreError;
use crate::datastore::DatastoreError;
use crate::ffs::coreipfs::IpfsError;
use crate::lotus::LotusError;

/// Coarse classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, surfaced synchronously.
    Validation,
    /// Operation not allowed in the current state, surfaced synchronously.
    Precondition,
    /// I/O with a collaborator failed; retried at the next natural cadence.
    Transient,
    /// Some deal proposals failed while others succeeded.
    Partial,
    /// The process cannot continue.
    Fatal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),
    #[error("cid already has a storage config; use override to replace it")]
    AlreadyConfigured,
    #[error("cid is active in storage; disable hot and cold storage first")]
    ActiveInStorage,
    #[error("no matching job")]
    NoMatchingJob,
    #[error("{0} not found")]
    NotFound(String),
    #[error("not enough miners: wanted {wanted}, found {found}")]
    NotEnoughMiners { wanted: usize, found: usize },
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out")]
    Timeout,
    #[error("deal proposals failed: {0}")]
    DealsFailed(String),
    #[error("datastore error: {0}")]
    Datastore(#[from] DatastoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Lotus(#[from] LotusError),
    #[error(transparent)]
    Ipfs(#[from] IpfsError),
    #[error(transparent)]
    Chainstore(#[from] ChainstoreError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("component is closed")]
    Closed,
    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig(_) => ErrorKind::Validation,
            Error::AlreadyConfigured
            | Error::ActiveInStorage
            | Error::NoMatchingJob
            | Error::NotFound(_)
            | Error::Closed => ErrorKind::Precondition,
            Error::DealsFailed(_) => ErrorKind::Partial,
            Error::Migration(_) => ErrorKind::Fatal,
            Error::Chainstore(err) if err.is_fatal() => ErrorKind::Fatal,
            Error::NotEnoughMiners { .. }
            | Error::Canceled
            | Error::Timeout
            | Error::Datastore(_)
            | Error::Serialization(_)
            | Error::Lotus(_)
            | Error::Ipfs(_)
            | Error::Chainstore(_)
            | Error::Http(_)
            | Error::Internal(_) => ErrorKind::Transient,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::AlreadyConfigured => "ALREADY_CONFIGURED",
            Error::ActiveInStorage => "ACTIVE_IN_STORAGE",
            Error::NoMatchingJob => "NO_MATCHING_JOB",
            Error::NotFound(_) => "NOT_FOUND",
            Error::NotEnoughMiners { .. } => "NOT_ENOUGH_MINERS",
            Error::Canceled => "CANCELED",
            Error::Timeout => "TIMEOUT",
            Error::DealsFailed(_) => "DEALS_FAILED",
            Error::Datastore(_) => "DATASTORE",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Lotus(_) => "LOTUS",
            Error::Ipfs(_) => "IPFS",
            Error::Chainstore(_) => "CHAINSTORE",
            Error::Http(_) => "HTTP",
            Error::Migration(_) => "MIGRATION",
            Error::Closed => "CLOSED",
            Error::Internal(_) => "INTERNAL",
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
