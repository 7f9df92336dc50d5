//! SeaORM-backed datastore over the `kv_entries` table.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use tracing::error;

use super::{Datastore, DatastoreError, Entry, Key, Op};
use crate::models::kv_entry::{ActiveModel, Column, Entity};

#[derive(Clone)]
pub struct SqlDatastore {
    db: DatabaseConnection,
}

impl SqlDatastore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn map_db_err(context: &'static str, err: sea_orm::DbErr) -> DatastoreError {
    error!(error = ?err, context, "Datastore query failed");
    DatastoreError::Db(err)
}

#[async_trait]
impl Datastore for SqlDatastore {
    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError> {
        let row = Entity::find_by_id(key.as_str().to_string())
            .one(&self.db)
            .await
            .map_err(|err| map_db_err("get", err))?;
        Ok(row.map(|model| model.value))
    }

    async fn query(&self, prefix: &Key) -> Result<Vec<Entry>, DatastoreError> {
        let mut select = Entity::find().order_by_asc(Column::Key);
        if !prefix.is_root() {
            select = select.filter(Column::Key.starts_with(format!("{}/", prefix.as_str())));
        }
        let rows = select
            .all(&self.db)
            .await
            .map_err(|err| map_db_err("query", err))?;

        // LIKE treats `_` as a wildcard, so re-check ancestry on the decoded key.
        let mut entries: Vec<Entry> = rows
            .into_iter()
            .map(|row| Entry {
                key: Key::new(row.key),
                value: row.value,
            })
            .filter(|entry| prefix.is_ancestor_of(&entry.key))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn commit(&self, ops: Vec<Op>) -> Result<(), DatastoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("begin", err))?;
        for op in ops {
            match op {
                Op::Put(key, value) => {
                    let row = ActiveModel {
                        key: Set(key.as_str().to_string()),
                        value: Set(value),
                        updated_at: Set(Utc::now().fixed_offset()),
                    };
                    Entity::insert(row)
                        .on_conflict(
                            OnConflict::column(Column::Key)
                                .update_columns([Column::Value, Column::UpdatedAt])
                                .to_owned(),
                        )
                        .exec(&txn)
                        .await
                        .map_err(|err| map_db_err("put", err))?;
                }
                Op::Delete(key) => {
                    Entity::delete_by_id(key.as_str().to_string())
                        .exec(&txn)
                        .await
                        .map_err(|err| map_db_err("delete", err))?;
                }
            }
        }
        txn.commit()
            .await
            .map_err(|err| map_db_err("commit", err))
    }

    async fn close(&self) -> Result<(), DatastoreError> {
        self.db
            .clone()
            .close()
            .await
            .map_err(|err| map_db_err("close", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn store() -> SqlDatastore {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        SqlDatastore::new(db)
    }

    #[tokio::test]
    async fn put_get_overwrite_delete() {
        let ds = store().await;
        let key = Key::new("/sjstore/job/1");
        ds.put(&key, b"a".to_vec()).await.unwrap();
        ds.put(&key, b"b".to_vec()).await.unwrap();
        assert_eq!(ds.get(&key).await.unwrap(), Some(b"b".to_vec()));
        ds.delete(&key).await.unwrap();
        assert_eq!(ds.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn prefix_query_ignores_like_wildcards() {
        let ds = store().await;
        for key in ["/a_b/1", "/axb/1", "/a_b/2", "/a_bc/1"] {
            ds.put(&Key::new(key), vec![1]).await.unwrap();
        }
        let keys: Vec<_> = ds
            .query(&Key::new("/a_b"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key.to_string())
            .collect();
        assert_eq!(keys, vec!["/a_b/1", "/a_b/2"]);
    }

    #[tokio::test]
    async fn commit_applies_ops_in_order() {
        let ds = store().await;
        let key = Key::new("/x");
        ds.commit(vec![
            Op::Put(key.clone(), vec![1]),
            Op::Delete(key.clone()),
            Op::Put(key.clone(), vec![2]),
        ])
        .await
        .unwrap();
        assert_eq!(ds.get(&key).await.unwrap(), Some(vec![2]));
    }
}
