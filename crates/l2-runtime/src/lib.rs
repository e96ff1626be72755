//! L2 Runtime - chain state engine
//!
//! This crate provides the core of the 01A L2 node:
//! - Ledger store on sled (blocks, transactions, receipts, accounts, events, validators)
//! - Account state application with gas accounting
//! - Mempool admission of signed raw transactions
//! - Timer-driven block production

pub mod block_producer;
pub mod error;
pub mod genesis;
pub mod mempool;
pub mod params;
pub mod persistence;
pub mod primitives;
pub mod state;
pub mod transaction;
pub mod types;

#[cfg(test)]
mod tests;

pub use block_producer::{BlockProducer, BlockProducerConfig, BlockUpdate, ProducerSchedule};
pub use error::{ChainError, ChainResult};
pub use genesis::GenesisConfig;
pub use mempool::Mempool;
pub use params::{ChainParams, SignatureMode};
pub use persistence::{BlockCommit, LedgerStore};
pub use primitives::{Address, Bytes, H256};
pub use types::{Account, Block, Event, Receipt, Transaction, TxStatus, Validator};

/// Chain identifier ("01A" -> 0x1a)
pub const CHAIN_ID: u64 = 0x1a;

/// Block time in seconds
pub const BLOCK_TIME_SECS: u64 = 3;

/// Maximum transactions per block
pub const MAX_TXS_PER_BLOCK: usize = 100;

/// Network gas limit, per transaction and per block
pub const BLOCK_GAS_LIMIT: u64 = 30_000_000;

/// Minimum gas price (1 gwei)
pub const MIN_GAS_PRICE: u128 = 1_000_000_000;

/// Gas for a transaction without payload
pub const TRANSFER_GAS: u64 = 21_000;

/// Gas for a transaction carrying payload data
pub const DATA_TX_GAS: u64 = 100_000;
