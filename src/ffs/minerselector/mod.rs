//! # Miner selectors
//!
//! Strategies implementing [`MinerSelector`](super::MinerSelector):
//!
//! - [`RepTop`]: trusted miners first, then the reputation ranking
//! - [`Sr2`]: miners drawn from remotely published buckets

use std::time::Duration;

use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::lotus::{QueryAsk, SharedLotus, TipSetKey};

pub mod reptop;
pub mod sr2;

pub use reptop::RepTop;
pub use sr2::Sr2;

pub const QUERY_ASK_TIMEOUT: Duration = Duration::from_secs(10);

/// Queries the current storage ask of `miner` through its peer id.
pub(crate) async fn query_ask(api: &SharedLotus, miner: &str, limit: Duration) -> Result<QueryAsk> {
    let ask = async {
        let info = api.state_miner_info(miner, &TipSetKey::default()).await?;
        let peer_id = info
            .peer_id
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::NotFound(format!("peer id of miner {miner}")))?;
        Ok::<_, Error>(api.client_query_ask(&peer_id, miner).await?)
    };
    timeout(limit, ask).await.map_err(|_| Error::Timeout)?
}

/// Price the client pays per epoch under `ask`.
pub(crate) fn ask_price(ask: &QueryAsk, verified_deal: bool) -> u64 {
    if verified_deal {
        ask.verified_price
    } else {
        ask.price
    }
}

pub(crate) fn fits_piece_size(ask: &QueryAsk, piece_size: u64) -> bool {
    piece_size >= ask.min_piece_size && (ask.max_piece_size == 0 || piece_size <= ask.max_piece_size)
}
