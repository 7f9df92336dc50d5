//! In-memory ordered datastore, used for tests and ephemeral deployments.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Datastore, DatastoreError, Entry, Key, Op};

#[derive(Default)]
pub struct MemoryDatastore {
    entries: RwLock<BTreeMap<Key, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn ensure_open(&self) -> Result<(), DatastoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DatastoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError> {
        self.ensure_open()?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn query(&self, prefix: &Key) -> Result<Vec<Entry>, DatastoreError> {
        self.ensure_open()?;
        let entries = self.entries.read();
        Ok(entries
            .range((Bound::Excluded(prefix.clone()), Bound::Unbounded))
            .take_while(|(key, _)| prefix.is_root() || key.as_str().starts_with(prefix.as_str()))
            .filter(|(key, _)| prefix.is_ancestor_of(key))
            .map(|(key, value)| Entry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn commit(&self, ops: Vec<Op>) -> Result<(), DatastoreError> {
        self.ensure_open()?;
        let mut entries = self.entries.write();
        for op in ops {
            match op {
                Op::Put(key, value) => {
                    entries.insert(key, value);
                }
                Op::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DatastoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_returns_only_children_in_order() {
        let ds = MemoryDatastore::new();
        for key in ["/a/2", "/a/1", "/ab/1", "/a", "/b/1", "/a/1/x"] {
            ds.put(&Key::new(key), key.as_bytes().to_vec()).await.unwrap();
        }
        let keys: Vec<_> = ds
            .query(&Key::new("/a"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key.to_string())
            .collect();
        assert_eq!(keys, vec!["/a/1", "/a/1/x", "/a/2"]);
        assert_eq!(ds.query(&Key::root()).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let ds = MemoryDatastore::new();
        ds.close().await.unwrap();
        assert!(matches!(
            ds.get(&Key::new("/a")).await,
            Err(DatastoreError::Closed)
        ));
    }
}
