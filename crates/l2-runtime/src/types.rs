//! Chain data model: blocks, transactions, receipts, events, accounts, validators

use crate::primitives::{Address, Bytes, H256};
use borsh::BorshSerialize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A committed block. Immutable once written to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub height: u64,
    pub hash: H256,
    pub parent_hash: H256,
    /// Seconds since the unix epoch
    pub timestamp: i64,
    /// Included transaction hashes, in inclusion order
    pub transactions: Vec<H256>,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub producer: Address,
    pub extra_data: Bytes,
    /// Byte length of the canonical header encoding
    pub size: u64,
}

/// Canonical encoding used to derive the block hash
#[derive(BorshSerialize)]
struct HeaderPreimage<'a> {
    height: u64,
    parent_hash: &'a H256,
    timestamp: i64,
    transactions: &'a [H256],
    gas_used: u64,
    gas_limit: u64,
    producer: &'a Address,
    extra_data: &'a Bytes,
}

impl Block {
    /// Assemble a block, computing its size and hash
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        height: u64,
        parent_hash: H256,
        timestamp: i64,
        transactions: Vec<H256>,
        gas_used: u64,
        gas_limit: u64,
        producer: Address,
        extra_data: Bytes,
    ) -> Self {
        let encoded = borsh::to_vec(&HeaderPreimage {
            height,
            parent_hash: &parent_hash,
            timestamp,
            transactions: &transactions,
            gas_used,
            gas_limit,
            producer: &producer,
            extra_data: &extra_data,
        })
        .unwrap_or_default();

        Self {
            height,
            hash: H256::digest(&encoded),
            parent_hash,
            timestamp,
            transactions,
            gas_used,
            gas_limit,
            producer,
            extra_data,
            size: encoded.len() as u64,
        }
    }

    /// Recompute the hash from the header fields
    pub fn compute_hash(&self) -> H256 {
        Self::assemble(
            self.height,
            self.parent_hash,
            self.timestamp,
            self.transactions.clone(),
            self.gas_used,
            self.gas_limit,
            self.producer,
            self.extra_data.clone(),
        )
        .hash
    }
}

/// A transaction as known to the node, pending or included
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: H256,
    pub from: Address,
    /// `None` creates a contract
    pub to: Option<Address>,
    pub value: u128,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub nonce: u64,
    pub data: Bytes,
    /// `None` while pending
    pub block_height: Option<u64>,
    pub transaction_index: Option<u32>,
}

impl Transaction {
    /// Worst-case cost the sender must be able to cover
    pub fn max_cost(&self) -> Option<u128> {
        (self.gas_limit as u128)
            .checked_mul(self.gas_price)?
            .checked_add(self.value)
    }

    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Success,
    Failure,
}

/// Outcome of a transaction's application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: H256,
    pub block_height: u64,
    pub transaction_index: u32,
    pub from: Address,
    pub to: Option<Address>,
    pub contract_address: Option<Address>,
    pub gas_used: u64,
    /// Fee actually charged, `gas_used * gas_price`
    pub fee: u128,
    pub status: TxStatus,
    pub error: Option<String>,
    pub logs: Vec<Event>,
}

impl Receipt {
    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }
}

/// Log emitted during transaction application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub block_height: u64,
    pub transaction_hash: H256,
    /// Emitting contract, `None` for native transfers
    pub address: Option<Address>,
    pub name: String,
    pub data: Bytes,
    pub topics: Vec<H256>,
    /// Position within the block
    pub log_index: u64,
}

impl Event {
    /// First topic of every event: digest of its name
    pub fn signature(name: &str) -> H256 {
        H256::digest(name.as_bytes())
    }
}

/// Balance and sequence state of an address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub balance: u128,
    /// Next expected transaction nonce
    pub nonce: u64,
    #[serde(default)]
    pub code: Option<Bytes>,
    #[serde(default)]
    pub storage: BTreeMap<H256, H256>,
}

impl Account {
    pub fn with_balance(balance: u128) -> Self {
        Self {
            balance,
            ..Default::default()
        }
    }

    pub fn is_contract(&self) -> bool {
        self.code.is_some()
    }
}

/// Member of the authority set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validator {
    pub address: Address,
    pub name: String,
    pub stake: u128,
    /// Percentage, 0-100
    pub commission_rate: f64,
    pub subnet: String,
    pub active: bool,
    /// Percentage, 0-100
    pub uptime: f64,
    pub rewards: u128,
    pub blocks_produced: u64,
    pub registered_at: i64,
    /// Position in registration order; rotation is sorted by this
    pub registration_index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_covers_header() {
        let a = Block::assemble(1, H256::zero(), 10, vec![], 0, 30_000_000, Address::zero(), Bytes::default());
        let b = Block::assemble(1, H256::zero(), 11, vec![], 0, 30_000_000, Address::zero(), Bytes::default());
        assert_ne!(a.hash, b.hash);
        assert_eq!(a.compute_hash(), a.hash);
        assert!(a.size > 0);
    }

    #[test]
    fn test_max_cost_overflow() {
        let tx = Transaction {
            hash: H256::zero(),
            from: Address::zero(),
            to: None,
            value: u128::MAX,
            gas_price: 1,
            gas_limit: 21_000,
            nonce: 0,
            data: Bytes::default(),
            block_height: None,
            transaction_index: None,
        };
        assert_eq!(tx.max_cost(), None);
    }

    #[test]
    fn test_account_json_shape() {
        let account = Account::with_balance(5);
        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["balance"], 5);
        assert_eq!(json["nonce"], 0);
    }
}
