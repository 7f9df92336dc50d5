//! Database migrations for the Powergate daemon.
//!
//! The relational schema is intentionally tiny: a single key/value table that
//! backs the datastore abstraction. Versioning of the data stored inside that
//! table is handled by the daemon's own datastore migration runner.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_000001_create_kv_entries;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m2025_12_01_000001_create_kv_entries::Migration)]
    }
}
