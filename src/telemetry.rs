//! Daemon-wide tracing setup.
//!
//! Scheduler, executor and index spans carry `job_id`, `user_id`, `cid` and
//! `miner` fields, so the JSON output includes the current span by default.
//! sea-orm/sqlx and reqwest still emit through `log`; they are bridged in and
//! capped at `warn` unless `RUST_LOG` says otherwise.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use thiserror::Error;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    filter::ParseError,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

/// Dependencies whose chatter drowns out deal and job events.
const QUIET_DEPENDENCIES: &[&str] = &["sqlx", "sea_orm", "hyper", "h2", "reqwest", "tower_http"];

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Filter applied when `RUST_LOG` isn't set: `level` for the daemon, `warn`
/// for the dependencies in [`QUIET_DEPENDENCIES`].
pub fn default_filter(level: &str) -> Result<EnvFilter, ParseError> {
    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_DEPENDENCIES.iter().map(|dep| format!("{dep}=warn")));
    EnvFilter::try_new(directives.join(","))
}

/// Installs the global subscriber once; later calls are no-ops.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match default_filter(&config.log_level) {
            Ok(filter) => filter,
            Err(err) => {
                TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        },
    };

    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: Failed to bridge `log` records: {err}. Database and HTTP client logs will be dropped."
            );
        }
    }

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!("Warning: Failed to set global tracing subscriber: {err}.");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_quiets_dependencies() {
        let filter = default_filter("debug").unwrap().to_string();
        assert!(filter.contains("debug"));
        for dep in QUIET_DEPENDENCIES {
            assert!(filter.contains(&format!("{dep}=warn")), "{filter}");
        }
        assert!(default_filter("sqlx=shouting").is_err());
    }

    #[test]
    fn init_is_idempotent() {
        let config = AppConfig::default();
        assert!(init_tracing(&config).is_ok());
        assert!(init_tracing(&config).is_ok());
    }
}
