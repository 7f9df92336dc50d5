//! Chain ordering helpers built on `ChainGetPath`.

use async_trait::async_trait;

use crate::lotus::{HeadChangeKind, LotusError, SharedLotus, TipSet, TipSetKey};

/// Decides whether one tipset is an ancestor of (or equal to) another on the
/// canonical chain.
#[async_trait]
pub trait TipsetOrderer: Send + Sync {
    async fn precedes(&self, from: &TipSetKey, to: &TipSetKey) -> Result<bool, LotusError>;
}

/// Applied tipsets between a base and a target.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPath {
    /// Parent key of the first applied tipset, if anything was applied.
    pub base: Option<TipSetKey>,
    pub path: Vec<TipSet>,
}

#[derive(Clone)]
pub struct ChainSync {
    api: SharedLotus,
}

impl ChainSync {
    pub fn new(api: SharedLotus) -> Self {
        Self { api }
    }

    /// Resolves the applied path from `from` (or genesis) to `to`.
    pub async fn resolve_base(
        &self,
        from: Option<&TipSetKey>,
        to: &TipSetKey,
    ) -> Result<ResolvedPath, LotusError> {
        let mut resolved = ResolvedPath::default();
        let from = match from {
            Some(key) => key.clone(),
            None => {
                let genesis = self.api.chain_get_genesis().await?;
                let key = genesis.key.clone();
                resolved.path.push(genesis);
                key
            }
        };
        let changes = self.api.chain_get_path(&from, to).await?;
        for change in changes {
            if change.kind != HeadChangeKind::Apply {
                continue;
            }
            if resolved.base.is_none() {
                resolved.base = Some(change.tipset.parents.clone());
            }
            resolved.path.push(change.tipset);
        }
        Ok(resolved)
    }
}

#[async_trait]
impl TipsetOrderer for ChainSync {
    async fn precedes(&self, from: &TipSetKey, to: &TipSetKey) -> Result<bool, LotusError> {
        if from == to {
            return Ok(true);
        }
        let changes = self.api.chain_get_path(from, to).await?;
        Ok(match changes.first() {
            None => true,
            Some(first) => first.kind == HeadChangeKind::Apply,
        })
    }
}
