//! # Data Models
//!
//! SeaORM entities backing the SQL datastore.

pub mod kv_entry;
