//! # Chain indices
//!
//! Background-refreshed views over chain and market state that feed miner
//! selection and reputation: the ask index, the miner index and the faults
//! index. Each owns a [`crate::signaler::Signaler`] so dependents can react to
//! rebuilds.

pub mod ask;
pub mod faults;
pub mod miner;

pub use ask::{AskIndex, AskRunner, StorageAsk};
pub use faults::{FaultsIndex, FaultsRunner};
pub use miner::{MinerIndex, MinerRunner};
