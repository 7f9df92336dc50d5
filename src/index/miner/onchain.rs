use std::collections::BTreeMap;

use futures::StreamExt;
use futures::stream;
use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lotus::{LotusError, SharedLotus, TipSetKey};

use super::{ChainIndex, OnChainMinerData};

/// Builds a fresh on-chain snapshot of every listed miner at the current head.
pub(super) async fn build(
    api: &SharedLotus,
    max_parallel: usize,
    shutdown: &CancellationToken,
) -> Result<ChainIndex> {
    let head = api.chain_head().await?;
    let miners = api.state_list_miners(&TipSetKey::default()).await?;
    let total = miners.len().max(1) as f64;

    let mut index = ChainIndex {
        last_updated: head.height,
        miners: BTreeMap::new(),
    };
    let mut results = stream::iter(miners)
        .map(|addr| {
            let api = api.clone();
            async move {
                let data = fetch(&api, &addr).await;
                (addr, data)
            }
        })
        .buffer_unordered(max_parallel.max(1));

    let mut done = 0usize;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Err(Error::Canceled),
            next = results.next() => {
                let Some((addr, data)) = next else { break };
                done += 1;
                gauge!("miner_index_progress", "subindex" => "onchain").set(done as f64 / total);
                match data {
                    Ok(data) => {
                        index.miners.insert(addr, data);
                    }
                    Err(err) => debug!(miner = %addr, error = %err, "Getting on-chain data failed"),
                }
            }
        }
    }
    gauge!("miner_index_progress", "subindex" => "onchain").set(1.0);
    Ok(index)
}

async fn fetch(api: &SharedLotus, addr: &str) -> Result<OnChainMinerData, LotusError> {
    let head = TipSetKey::default();
    let power = api.state_miner_power(addr, &head).await?;
    let info = api.state_miner_info(addr, &head).await?;
    let sectors = api.state_miner_sector_count(addr, &head).await?;

    let raw = power.miner_power.raw_byte_power;
    let total = power.total_power.raw_byte_power;
    let relative_power = if total == 0 {
        0.0
    } else {
        raw as f64 / total as f64
    };
    Ok(OnChainMinerData {
        power: raw,
        relative_power,
        sector_size: info.sector_size,
        sectors_live: sectors.live,
        sectors_active: sectors.active,
        sectors_faulty: sectors.faulty,
    })
}
