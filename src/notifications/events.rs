//! Event names accepted in `NotificationConfig::events`.

pub const ALL: &str = "*";
pub const ALL_CREATED: &str = "*-created";
pub const ALL_COMPLETED: &str = "*-completed";
pub const ALL_RETRIED: &str = "*-retried";
pub const ALL_FAILED: &str = "*-failed";
pub const ALL_CANCELED: &str = "*-canceled";

pub const STORAGE_DEAL_ALL: &str = "storage-deal-*";
pub const STORAGE_DEAL_CREATED: &str = "storage-deal-created";
pub const STORAGE_DEAL_COMPLETED: &str = "storage-deal-completed";
pub const STORAGE_DEAL_RETRIED: &str = "storage-deal-retried";
pub const STORAGE_DEAL_FAILED: &str = "storage-deal-failed";
pub const STORAGE_DEAL_CANCELED: &str = "storage-deal-canceled";
pub const STORAGE_DEAL_EXPIRED: &str = "storage-deal-expired";
pub const STORAGE_DEAL_SLASHED: &str = "storage-deal-slashed";

pub const DATA_RETRIEVAL_ALL: &str = "data-retrieval-*";
pub const DATA_RETRIEVAL_CREATED: &str = "data-retrieval-created";
pub const DATA_RETRIEVAL_COMPLETED: &str = "data-retrieval-completed";
pub const DATA_RETRIEVAL_RETRIED: &str = "data-retrieval-retried";
pub const DATA_RETRIEVAL_FAILED: &str = "data-retrieval-failed";
pub const DATA_RETRIEVAL_CANCELED: &str = "data-retrieval-canceled";

const KNOWN: &[&str] = &[
    ALL,
    ALL_CREATED,
    ALL_COMPLETED,
    ALL_RETRIED,
    ALL_FAILED,
    ALL_CANCELED,
    STORAGE_DEAL_ALL,
    STORAGE_DEAL_CREATED,
    STORAGE_DEAL_COMPLETED,
    STORAGE_DEAL_RETRIED,
    STORAGE_DEAL_FAILED,
    STORAGE_DEAL_CANCELED,
    STORAGE_DEAL_EXPIRED,
    STORAGE_DEAL_SLASHED,
    DATA_RETRIEVAL_ALL,
    DATA_RETRIEVAL_CREATED,
    DATA_RETRIEVAL_COMPLETED,
    DATA_RETRIEVAL_RETRIED,
    DATA_RETRIEVAL_FAILED,
    DATA_RETRIEVAL_CANCELED,
];

pub fn is_known(event: &str) -> bool {
    KNOWN.contains(&event)
}

/// Outcome of an update used to match `*-<verb>` and `<domain>-<verb>` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Created,
    Completed,
    Retried,
    Failed,
    Canceled,
    Expired,
    Slashed,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Verb::Created => "created",
            Verb::Completed => "completed",
            Verb::Retried => "retried",
            Verb::Failed => "failed",
            Verb::Canceled => "canceled",
            Verb::Expired => "expired",
            Verb::Slashed => "slashed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    StorageDeal,
    DataRetrieval,
}

impl Domain {
    fn as_str(self) -> &'static str {
        match self {
            Domain::StorageDeal => "storage-deal",
            Domain::DataRetrieval => "data-retrieval",
        }
    }
}

/// Exact-string match of `event` against an update of `domain` carrying
/// `verbs`. `*` matches everything and `<domain>-*` every update of the
/// domain; chain-driven verbs only match their domain-prefixed name.
pub fn matches(event: &str, domain: Domain, verbs: &[Verb]) -> bool {
    if event == ALL {
        return true;
    }
    if let Some(prefix) = event.strip_suffix("-*") {
        return prefix == domain.as_str();
    }
    let Some((scope, verb)) = event.rsplit_once('-') else {
        return false;
    };
    let Some(verb) = verbs.iter().find(|v| v.as_str() == verb) else {
        return false;
    };
    match scope {
        "*" => !matches!(verb, Verb::Expired | Verb::Slashed),
        other => other == domain.as_str(),
    }
}
