//! # Datastore
//!
//! Key/value persistence contract shared by every store of the daemon.
//! Keys are `/`-delimited paths; values are opaque bytes. Implementations
//! only need to provide point reads, prefix queries and an atomic commit of a
//! write set; [`Txn`] layers read-your-writes transactions on top.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod namespace;
pub mod sql;

pub use memory::MemoryDatastore;
pub use namespace::NamespacedDatastore;
pub use sql::SqlDatastore;

/// Errors surfaced by datastore implementations.
#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("write attempted on a read-only transaction")]
    ReadOnlyTransaction,
    #[error("datastore is closed")]
    Closed,
}

/// A `/`-delimited hierarchical key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(String);

impl Key {
    /// Builds a key from a raw path, normalising slashes.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let mut clean = String::with_capacity(raw.as_ref().len() + 1);
        for segment in raw.as_ref().split('/').filter(|s| !s.is_empty()) {
            clean.push('/');
            clean.push_str(segment);
        }
        if clean.is_empty() {
            clean.push('/');
        }
        Self(clean)
    }

    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Appends a single path segment (which may itself contain `/`).
    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        if self.is_root() {
            Self::new(segment)
        } else {
            Self::new(format!("{}/{}", self.0, segment.as_ref()))
        }
    }

    pub fn child_key(&self, other: &Key) -> Self {
        self.child(other.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    pub fn segments(&self) -> Vec<&str> {
        self.0.split('/').filter(|s| !s.is_empty()).collect()
    }

    pub fn parent(&self) -> Self {
        match self.0.rfind('/') {
            Some(0) | None => Self::root(),
            Some(idx) => Self(self.0[..idx].to_string()),
        }
    }

    /// Returns true if `other` lives strictly below this key.
    pub fn is_ancestor_of(&self, other: &Key) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Removes `prefix` from the front of the key.
    pub fn strip_prefix(&self, prefix: &Key) -> Option<Key> {
        if prefix.is_root() {
            return Some(self.clone());
        }
        if prefix == self {
            return Some(Key::root());
        }
        prefix
            .is_ancestor_of(self)
            .then(|| Key::new(&self.0[prefix.0.len()..]))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::new(value)
    }
}

/// Key/value pair returned by prefix queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub value: Vec<u8>,
}

/// A buffered mutation applied by [`Datastore::commit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Put(Key, Vec<u8>),
    Delete(Key),
}

/// Storage backend contract.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError>;

    async fn has(&self, key: &Key) -> Result<bool, DatastoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn put(&self, key: &Key, value: Vec<u8>) -> Result<(), DatastoreError> {
        self.commit(vec![Op::Put(key.clone(), value)]).await
    }

    async fn delete(&self, key: &Key) -> Result<(), DatastoreError> {
        self.commit(vec![Op::Delete(key.clone())]).await
    }

    /// Returns every entry strictly below `prefix`, ascending by key.
    async fn query(&self, prefix: &Key) -> Result<Vec<Entry>, DatastoreError>;

    /// Applies all operations atomically, in order.
    async fn commit(&self, ops: Vec<Op>) -> Result<(), DatastoreError>;

    async fn close(&self) -> Result<(), DatastoreError> {
        Ok(())
    }
}

pub type SharedDatastore = Arc<dyn Datastore>;

/// Read-your-writes transaction over any [`Datastore`].
///
/// Writes are buffered in memory and only reach the backend on
/// [`Txn::commit`]; dropping the transaction discards them.
pub struct Txn {
    ds: SharedDatastore,
    read_only: bool,
    pending: BTreeMap<Key, Option<Vec<u8>>>,
    ops: Vec<Op>,
}

impl Txn {
    pub fn new(ds: SharedDatastore, read_only: bool) -> Self {
        Self {
            ds,
            read_only,
            pending: BTreeMap::new(),
            ops: Vec::new(),
        }
    }

    pub async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError> {
        if let Some(buffered) = self.pending.get(key) {
            return Ok(buffered.clone());
        }
        self.ds.get(key).await
    }

    pub async fn has(&self, key: &Key) -> Result<bool, DatastoreError> {
        Ok(self.get(key).await?.is_some())
    }

    pub fn put(&mut self, key: Key, value: Vec<u8>) -> Result<(), DatastoreError> {
        if self.read_only {
            return Err(DatastoreError::ReadOnlyTransaction);
        }
        self.pending.insert(key.clone(), Some(value.clone()));
        self.ops.push(Op::Put(key, value));
        Ok(())
    }

    pub fn delete(&mut self, key: Key) -> Result<(), DatastoreError> {
        if self.read_only {
            return Err(DatastoreError::ReadOnlyTransaction);
        }
        self.pending.insert(key.clone(), None);
        self.ops.push(Op::Delete(key));
        Ok(())
    }

    /// Prefix query merged with the buffered writes of this transaction.
    pub async fn query(&self, prefix: &Key) -> Result<Vec<Entry>, DatastoreError> {
        let mut merged: BTreeMap<Key, Vec<u8>> = self
            .ds
            .query(prefix)
            .await?
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();
        for (key, value) in &self.pending {
            if !prefix.is_ancestor_of(key) {
                continue;
            }
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged
            .into_iter()
            .map(|(key, value)| Entry { key, value })
            .collect())
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub async fn commit(self) -> Result<(), DatastoreError> {
        if self.ops.is_empty() {
            return Ok(());
        }
        if self.read_only {
            return Err(DatastoreError::ReadOnlyTransaction);
        }
        self.ds.commit(self.ops).await
    }

    pub fn discard(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_normalisation() {
        assert_eq!(Key::new("a//b/").as_str(), "/a/b");
        assert_eq!(Key::new("").as_str(), "/");
        assert_eq!(Key::root().child("x").as_str(), "/x");
        assert_eq!(Key::new("/a").child("b/c").as_str(), "/a/b/c");
        assert_eq!(Key::new("/a/b/c").name(), "c");
        assert_eq!(Key::new("/a/b/c").parent().as_str(), "/a/b");
        assert_eq!(Key::new("/a").parent(), Key::root());
    }

    #[test]
    fn ancestry_respects_segment_boundaries() {
        let base = Key::new("/sjstore/job");
        assert!(base.is_ancestor_of(&Key::new("/sjstore/job/1")));
        assert!(!base.is_ancestor_of(&Key::new("/sjstore/jobs/1")));
        assert!(!base.is_ancestor_of(&base));
        assert_eq!(
            Key::new("/a/b/c").strip_prefix(&Key::new("/a")),
            Some(Key::new("/b/c"))
        );
        assert_eq!(Key::new("/ab/c").strip_prefix(&Key::new("/a")), None);
    }

    #[tokio::test]
    async fn txn_reads_its_own_writes_and_discards() {
        let ds: SharedDatastore = Arc::new(MemoryDatastore::new());
        ds.put(&Key::new("/p/a"), b"1".to_vec()).await.unwrap();
        ds.put(&Key::new("/p/b"), b"2".to_vec()).await.unwrap();

        let mut txn = Txn::new(ds.clone(), false);
        txn.put(Key::new("/p/c"), b"3".to_vec()).unwrap();
        txn.delete(Key::new("/p/a")).unwrap();
        let keys: Vec<_> = txn
            .query(&Key::new("/p"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key.to_string())
            .collect();
        assert_eq!(keys, vec!["/p/b", "/p/c"]);
        txn.discard();
        assert!(ds.has(&Key::new("/p/a")).await.unwrap());

        let mut txn = Txn::new(ds.clone(), false);
        txn.delete(Key::new("/p/a")).unwrap();
        txn.commit().await.unwrap();
        assert!(!ds.has(&Key::new("/p/a")).await.unwrap());
    }

    #[tokio::test]
    async fn read_only_txn_rejects_writes() {
        let ds: SharedDatastore = Arc::new(MemoryDatastore::new());
        let mut txn = Txn::new(ds, true);
        assert!(matches!(
            txn.put(Key::new("/x"), vec![]),
            Err(DatastoreError::ReadOnlyTransaction)
        ));
    }
}
