//! # Powergate daemon
//!
//! Wires the datastore, chain indices, storage layers and the FFS scheduler
//! together and serves the health endpoint until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use powergate::config::{AppConfig, ConfigLoader, MinerSelectorStrategy};
use powergate::datastore::{MemoryDatastore, SharedDatastore, SqlDatastore};
use powergate::deals::DealRecordStore;
use powergate::ffs::coreipfs::{CoreIpfs, IpfsHttpClient, Pinstore};
use powergate::ffs::filcold::FilCold;
use powergate::ffs::minerselector::{RepTop, Sr2};
use powergate::ffs::scheduler::{Scheduler, SchedulerDeps};
use powergate::ffs::{SharedColdStorage, SharedHotStorage, SharedMinerSelector};
use powergate::index::{AskRunner, FaultsRunner, MinerRunner};
use powergate::iplocation::{HttpLocationResolver, SharedLocationResolver};
use powergate::lotus::SharedLotus;
use powergate::lotus::rpc::LotusRpcClient;
use powergate::migrations::Migrator;
use powergate::notifications::Notifier;
use powergate::reputation::Reputation;
use powergate::server::{AppState, run_server};
use powergate::{db, telemetry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "powergated", version, about = "Powergate storage daemon")]
struct Cli {
    /// Directory holding the layered `.env` files.
    #[arg(long)]
    base_dir: Option<PathBuf>,
    /// Run datastore migrations and exit.
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let base_dir = match cli.base_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving working directory")?,
    };
    let config = ConfigLoader::with_base_dir(base_dir.clone())
        .load()
        .context("loading configuration")?;
    config.validate().context("validating configuration")?;
    telemetry::init_tracing(&config)?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        info!(config = %redacted_json, "Effective configuration");
    }

    let ds = open_datastore(&config).await?;
    let version = Migrator::new(ds.clone())
        .ensure()
        .await
        .context("running datastore migrations")?;
    info!(version, "Datastore is at the target version");
    if cli.migrate_only {
        ds.close().await?;
        return Ok(());
    }

    let api: SharedLotus = Arc::new(LotusRpcClient::new(&config.lotus)?);

    let asks = AskRunner::new(ds.clone(), api.clone(), config.ask_index.clone()).await?;
    let resolver = match &config.miner_index.location_resolver_url {
        Some(url) => Some(Arc::new(HttpLocationResolver::new(url, Duration::from_secs(10))?)
            as SharedLocationResolver),
        None => None,
    };
    let miners = MinerRunner::new(ds.clone(), api.clone(), resolver, config.miner_index.clone()).await?;
    let faults = FaultsRunner::new(ds.clone(), api.clone(), config.faults_index.clone()).await?;
    asks.start();
    miners.start();
    faults.start();

    let reputation = Reputation::new(ds.clone(), miners.clone(), faults.clone(), asks.clone());
    reputation.start().await?;

    let selector: SharedMinerSelector = match config.miner_selector.strategy {
        MinerSelectorStrategy::Reptop => Arc::new(RepTop::new(reputation.clone(), api.clone())),
        MinerSelectorStrategy::Sr2 => {
            let url = config
                .miner_selector
                .sr2_url
                .as_deref()
                .context("sr2 selector without url")?;
            Arc::new(Sr2::new(url, api.clone(), Some(asks.clone())).await?)
        }
    };

    let ipfs = Arc::new(IpfsHttpClient::new(
        &config.ipfs.api_url,
        Duration::from_secs(config.ipfs.add_timeout_seconds),
    )?);
    let pinstore = Pinstore::new(ds.clone()).await?;
    let hot: SharedHotStorage = Arc::new(CoreIpfs::new(ipfs.clone(), pinstore));
    let cold: SharedColdStorage = Arc::new(FilCold::new(
        api.clone(),
        selector.clone(),
        ipfs,
        Arc::new(DealRecordStore::new(ds.clone())),
        Duration::from_millis(config.scheduler.deal_watch_poll_ms),
    ));

    let notifier = Notifier::new(&config.notifier, base_dir)?;
    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        config.wallet_address.clone(),
        SchedulerDeps {
            ds: ds.clone(),
            hot,
            cold,
            selector,
            notifier: notifier.clone(),
            faults: config.faults_index.enabled.then(|| faults.clone()),
        },
    )
    .await?;
    scheduler.start().await?;

    let shutdown = CancellationToken::new();
    let addr = config.bind_addr()?;
    let server = tokio::spawn(run_server(addr, AppState { ds: ds.clone() }, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();
    match server.await {
        Ok(Err(err)) => error!(error = ?err, "Health server failed"),
        Err(err) => error!(error = ?err, "Health server task panicked"),
        Ok(Ok(())) => {}
    }

    scheduler.close().await;
    notifier.close().await;
    reputation.close().await;
    faults.close().await;
    miners.close().await;
    asks.close().await;
    ds.close().await?;
    info!("Powergate stopped");
    Ok(())
}

async fn open_datastore(config: &AppConfig) -> Result<SharedDatastore> {
    if config.datastore_url.starts_with("memory://") {
        info!("Using in-memory datastore");
        return Ok(Arc::new(MemoryDatastore::new()));
    }
    let conn = db::init_pool(config).await?;
    db::migrate(&conn).await?;
    Ok(Arc::new(SqlDatastore::new(conn)))
}
