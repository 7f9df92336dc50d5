//! External reputation sources.
//!
//! A source is a JSON document served over HTTP mapping miner addresses to
//! scores in `0..=1`. Sources are persisted under `/reputation/sources/<id>`
//! and refreshed periodically.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::datastore::{DatastoreError, Key, SharedDatastore, Txn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {0} already exists")]
    AlreadyExists(String),
    #[error("source {0} doesn't exist")]
    DoesntExist(String),
    #[error("source weight must be within 0..=1, got {0}")]
    InvalidWeight(f64),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
    #[error("source encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("refreshing source failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub url: String,
    pub weight: f64,
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
}

impl Source {
    pub fn new(id: impl Into<String>, url: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            weight,
            scores: BTreeMap::new(),
        }
    }

    /// Downloads the latest scores, clamping each into `0..=1`.
    pub async fn refresh(&mut self, http: &reqwest::Client) -> Result<(), SourceError> {
        let scores: BTreeMap<String, f64> = http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.scores = scores
            .into_iter()
            .map(|(addr, score)| (addr, score.clamp(0.0, 1.0)))
            .collect();
        Ok(())
    }
}

pub struct SourceStore {
    ds: SharedDatastore,
}

fn base_key() -> Key {
    Key::new("/reputation/sources")
}

impl SourceStore {
    pub fn new(ds: SharedDatastore) -> Self {
        Self { ds }
    }

    pub async fn add(&self, source: &Source) -> Result<(), SourceError> {
        if !(0.0..=1.0).contains(&source.weight) {
            return Err(SourceError::InvalidWeight(source.weight));
        }
        let key = base_key().child(&source.id);
        let mut txn = Txn::new(self.ds.clone(), false);
        if txn.has(&key).await? {
            return Err(SourceError::AlreadyExists(source.id.clone()));
        }
        txn.put(key, serde_json::to_vec(source)?)?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn update(&self, source: &Source) -> Result<(), SourceError> {
        let key = base_key().child(&source.id);
        let mut txn = Txn::new(self.ds.clone(), false);
        if !txn.has(&key).await? {
            return Err(SourceError::DoesntExist(source.id.clone()));
        }
        txn.put(key, serde_json::to_vec(source)?)?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn get_all(&self) -> Result<Vec<Source>, SourceError> {
        self.ds
            .query(&base_key())
            .await?
            .into_iter()
            .map(|entry| serde_json::from_slice(&entry.value).map_err(SourceError::from))
            .collect()
    }
}
