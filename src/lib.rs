//! # Powergate
//!
//! Multi-tenant storage orchestration over a hot (IPFS) and a cold
//! (Filecoin) layer. Users declare a storage config per cid; the FFS
//! scheduler turns every declaration into a storage job and keeps the
//! stored data aligned with it through repair and renewal, while the chain
//! indices feed miner selection.

pub mod chainstore;
pub mod chainsync;
pub mod config;
pub mod datastore;
pub mod db;
pub mod deals;
pub mod error;
pub mod ffs;
pub mod index;
pub mod iplocation;
pub mod lotus;
pub mod migrations;
pub mod models;
pub mod notifications;
pub mod reputation;
pub mod server;
pub mod signaler;
pub mod telemetry;
pub use migration;
