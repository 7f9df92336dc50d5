//! Datastore view rooted under a fixed key prefix.

use async_trait::async_trait;

use super::{Datastore, DatastoreError, Entry, Key, Op, SharedDatastore};

/// Wraps a datastore so that every key is transparently prefixed.
///
/// Query results are returned with the prefix stripped.
#[derive(Clone)]
pub struct NamespacedDatastore {
    inner: SharedDatastore,
    prefix: Key,
}

impl NamespacedDatastore {
    pub fn new(inner: SharedDatastore, prefix: Key) -> Self {
        Self { inner, prefix }
    }

    pub fn prefix(&self) -> &Key {
        &self.prefix
    }

    fn wrap(&self, key: &Key) -> Key {
        self.prefix.child_key(key)
    }
}

#[async_trait]
impl Datastore for NamespacedDatastore {
    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError> {
        self.inner.get(&self.wrap(key)).await
    }

    async fn query(&self, prefix: &Key) -> Result<Vec<Entry>, DatastoreError> {
        let entries = self.inner.query(&self.wrap(prefix)).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                entry.key.strip_prefix(&self.prefix).map(|key| Entry {
                    key,
                    value: entry.value,
                })
            })
            .collect())
    }

    async fn commit(&self, ops: Vec<Op>) -> Result<(), DatastoreError> {
        let ops = ops
            .into_iter()
            .map(|op| match op {
                Op::Put(key, value) => Op::Put(self.wrap(&key), value),
                Op::Delete(key) => Op::Delete(self.wrap(&key)),
            })
            .collect();
        self.inner.commit(ops).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::datastore::MemoryDatastore;

    #[tokio::test]
    async fn keys_are_prefixed_and_stripped() {
        let root: SharedDatastore = Arc::new(MemoryDatastore::new());
        let ns = NamespacedDatastore::new(root.clone(), Key::new("/chainstore/ask"));
        ns.put(&Key::new("/id/1"), vec![7]).await.unwrap();

        assert!(root.has(&Key::new("/chainstore/ask/id/1")).await.unwrap());
        let entries = ns.query(&Key::new("/id")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, Key::new("/id/1"));
    }
}
