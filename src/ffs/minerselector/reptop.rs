use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{QUERY_ASK_TIMEOUT, ask_price, fits_piece_size, query_ask};
use crate::error::{Error, Result};
use crate::ffs::interfaces::{MinerProposal, MinerSelector, MinerSelectorFilter};
use crate::lotus::SharedLotus;
use crate::reputation::Reputation;

/// Picks the best-ranked miners of the reputation module, validating each
/// one with a live query-ask.
pub struct RepTop {
    reputation: Arc<Reputation>,
    api: SharedLotus,
    ask_timeout: Duration,
}

impl RepTop {
    pub fn new(reputation: Arc<Reputation>, api: SharedLotus) -> Self {
        Self {
            reputation,
            api,
            ask_timeout: QUERY_ASK_TIMEOUT,
        }
    }

    pub fn with_ask_timeout(mut self, ask_timeout: Duration) -> Self {
        self.ask_timeout = ask_timeout;
        self
    }

    async fn proposal(&self, filter: &MinerSelectorFilter, miner: &str) -> Result<MinerProposal> {
        let ask = query_ask(&self.api, miner, self.ask_timeout).await?;
        let price = ask_price(&ask, filter.verified_deal);
        if filter.max_price > 0 && price > filter.max_price {
            return Err(Error::Internal(format!(
                "price {price} above max price {}",
                filter.max_price
            )));
        }
        if !fits_piece_size(&ask, filter.piece_size) {
            return Err(Error::Internal(format!(
                "piece size {} outside ({}, {})",
                filter.piece_size, ask.min_piece_size, ask.max_piece_size
            )));
        }
        Ok(MinerProposal {
            addr: miner.to_string(),
            epoch_price: price,
        })
    }
}

#[async_trait]
impl MinerSelector for RepTop {
    async fn get_miners(
        &self,
        n: usize,
        filter: &MinerSelectorFilter,
    ) -> Result<Vec<MinerProposal>> {
        if n == 0 {
            return Err(Error::InvalidConfig(
                "the number of miners should be greater than zero".to_string(),
            ));
        }

        // Trusted miners skip the reputation index, which ignores zero-power miners.
        let mut selected = Vec::with_capacity(n);
        for miner in &filter.trusted_miners {
            if selected.len() == n {
                break;
            }
            if filter.excluded_miners.contains(miner) {
                continue;
            }
            match self.proposal(filter, miner).await {
                Ok(proposal) => selected.push(proposal),
                Err(err) => warn!(miner = %miner, error = %err, "Trusted miner query-ask failed"),
            }
        }

        let mut skip = filter.excluded_miners.clone();
        skip.extend(filter.trusted_miners.iter().cloned());
        let ranked = self
            .reputation
            .query_miners(&skip, &filter.country_codes, &[]);
        for score in ranked {
            if selected.len() == n {
                break;
            }
            match self.proposal(filter, &score.addr).await {
                Ok(proposal) => selected.push(proposal),
                Err(err) => debug!(miner = %score.addr, error = %err, "Skipping ranked miner"),
            }
        }

        if selected.len() < n {
            return Err(Error::NotEnoughMiners {
                wanted: n,
                found: selected.len(),
            });
        }
        Ok(selected)
    }
}
