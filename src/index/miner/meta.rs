use std::collections::BTreeMap;

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::iplocation::SharedLocationResolver;
use crate::lotus::{LotusError, SharedLotus, TipSetKey};

use super::{Meta, MetaIndex};

/// Resolves fresh metadata for `addrs`, coalescing with `previous`.
pub(super) async fn build(
    api: &SharedLotus,
    resolver: Option<&SharedLocationResolver>,
    addrs: Vec<String>,
    previous: &MetaIndex,
    max_parallel: usize,
    shutdown: &CancellationToken,
) -> Result<MetaIndex> {
    let total = addrs.len().max(1) as f64;
    let mut results = stream::iter(addrs)
        .map(|addr| {
            let api = api.clone();
            let resolver = resolver.cloned();
            async move {
                let meta = fetch(&api, resolver.as_ref(), &addr).await;
                (addr, meta)
            }
        })
        .buffer_unordered(max_parallel.max(1));

    let mut info = BTreeMap::new();
    let mut done = 0usize;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Err(Error::Canceled),
            next = results.next() => {
                let Some((addr, meta)) = next else { break };
                done += 1;
                gauge!("miner_index_progress", "subindex" => "meta").set(done as f64 / total);
                match meta {
                    Ok(meta) => {
                        let merged = merge(previous.info.get(&addr), meta);
                        info.insert(addr, merged);
                    }
                    Err(err) => debug!(miner = %addr, error = %err, "Getting miner metadata failed"),
                }
            }
        }
    }
    gauge!("miner_index_progress", "subindex" => "meta").set(1.0);
    Ok(MetaIndex { info })
}

async fn fetch(
    api: &SharedLotus,
    resolver: Option<&SharedLocationResolver>,
    addr: &str,
) -> Result<Meta, LotusError> {
    let mut meta = Meta {
        last_updated: Some(Utc::now()),
        ..Meta::default()
    };
    let info = api.state_miner_info(addr, &TipSetKey::default()).await?;

    if let Some(peer_id) = &info.peer_id
        && let Ok(agent) = api.net_agent_version(peer_id).await
        && !agent.is_empty()
    {
        meta.user_agent = agent;
        meta.online = true;
    }

    if info.multiaddrs.is_empty() {
        return Ok(meta);
    }
    if let Some(resolver) = resolver {
        match resolver.resolve(&info.multiaddrs).await {
            Ok(location) => meta.location = location,
            Err(err) => debug!(miner = %addr, error = %err, "Location unresolved"),
        }
    }
    Ok(meta)
}

/// Keeps previously resolved location fields the new lookup left empty.
pub fn merge(old: Option<&Meta>, mut update: Meta) -> Meta {
    let Some(old) = old else {
        return update;
    };
    if update.location.country.is_empty() {
        update.location.country = old.location.country.clone();
    }
    if update.location.latitude == 0.0 {
        update.location.latitude = old.location.latitude;
    }
    if update.location.longitude == 0.0 {
        update.location.longitude = old.location.longitude;
    }
    if update.user_agent.is_empty() {
        update.user_agent = old.user_agent.clone();
    }
    update
}
