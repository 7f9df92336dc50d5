//! Alert predicates accepted in `NotificationConfig::alerts`.
//!
//! - `datacap`: available disk space below a byte size such as `10GB`
//! - `deal-expiration`: a deal expiring sooner than a duration such as `72h`

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::ffs::types::WebhookAlert;
use crate::lotus::EPOCH_DURATION;

pub const DISK_SPACE_CHECK: &str = "datacap";
pub const DEAL_EXPIRATION_CHECK: &str = "deal-expiration";

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("unknown alert type {0}")]
    UnknownType(String),
    #[error("invalid size threshold {0}")]
    InvalidSize(String),
    #[error("invalid duration threshold {0}")]
    InvalidDuration(String),
    #[error("reading available disk space: {0}")]
    DiskSpace(#[from] std::io::Error),
}

pub fn validate(alert: &WebhookAlert) -> Result<(), AlertError> {
    match alert.alert_type.as_str() {
        DISK_SPACE_CHECK => parse_size(&alert.threshold).map(|_| ()),
        DEAL_EXPIRATION_CHECK => parse_duration(&alert.threshold).map(|_| ()),
        other => Err(AlertError::UnknownType(other.to_string())),
    }
}

/// Parses a human byte size with binary multipliers: `512`, `10GB`, `1.5 TiB`.
pub fn parse_size(raw: &str) -> Result<u64, AlertError> {
    let invalid = || AlertError::InvalidSize(raw.to_string());
    let re = Regex::new(r"^(\d+(?:\.\d+)?) ?([kKmMgGtTpP])?[iI]?[bB]?$").map_err(|_| invalid())?;
    let caps = re.captures(raw.trim()).ok_or_else(invalid)?;
    let value: f64 = caps[1].parse().map_err(|_| invalid())?;
    let exp = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 0,
        Some(unit) => match unit.as_str() {
            "k" => 1,
            "m" => 2,
            "g" => 3,
            "t" => 4,
            "p" => 5,
            _ => return Err(invalid()),
        },
    };
    Ok((value * 1024f64.powi(exp)) as u64)
}

/// Parses a duration made of `<number><unit>` parts, e.g. `72h` or `1h30m`.
pub fn parse_duration(raw: &str) -> Result<Duration, AlertError> {
    let invalid = || AlertError::InvalidDuration(raw.to_string());
    let re = Regex::new(r"(\d+(?:\.\d+)?)(ns|us|µs|ms|s|m|h)").map_err(|_| invalid())?;
    let raw = raw.trim();
    let mut consumed = 0;
    let mut secs = 0f64;
    for caps in re.captures_iter(raw) {
        let whole = caps.get(0).ok_or_else(invalid)?;
        if whole.start() != consumed {
            return Err(invalid());
        }
        consumed = whole.end();
        let value: f64 = caps[1].parse().map_err(|_| invalid())?;
        secs += value
            * match &caps[2] {
                "ns" => 1e-9,
                "us" | "µs" => 1e-6,
                "ms" => 1e-3,
                "s" => 1.0,
                "m" => 60.0,
                _ => 3600.0,
            };
    }
    if consumed == 0 || consumed != raw.len() {
        return Err(invalid());
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Whole epochs that fit in `duration`.
pub fn duration_to_epochs(duration: Duration) -> i64 {
    (duration.as_secs() / EPOCH_DURATION.as_secs()) as i64
}

pub fn available_disk_space(path: &Path) -> Result<u64, AlertError> {
    Ok(fs2::available_space(path)?)
}
