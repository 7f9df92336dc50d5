//! KvEntry entity model
//!
//! Row type of the `kv_entries` table backing [`crate::datastore::SqlDatastore`].

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "kv_entries")]
pub struct Model {
    /// `/`-delimited datastore key
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub key: String,

    /// Opaque value bytes
    pub value: Vec<u8>,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
