//! JSON shapes returned by the RPC and REST layers
//!
//! JSON-RPC results follow the Ethereum conventions: quantities are `0x`-hex
//! strings. REST views use decimal strings for amounts, which can exceed what
//! a JSON number holds.

use l2_runtime::{Account, Address, Block, Bytes, Event, Receipt, Transaction, Validator, H256};
use serde::Serialize;
use std::fmt::LowerHex;

/// `0x`-hex quantity without leading zeros
pub fn quantity<T: LowerHex>(value: T) -> String {
    format!("0x{:x}", value)
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BlockTransactions {
    Hashes(Vec<H256>),
    Full(Vec<RpcTransaction>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: String,
    pub hash: H256,
    pub parent_hash: H256,
    pub timestamp: String,
    pub transactions: BlockTransactions,
    pub gas_used: String,
    pub gas_limit: String,
    pub miner: Address,
    pub extra_data: Bytes,
    pub size: String,
}

impl RpcBlock {
    pub fn new(block: &Block, transactions: BlockTransactions) -> Self {
        Self {
            number: quantity(block.height),
            hash: block.hash,
            parent_hash: block.parent_hash,
            timestamp: quantity(block.timestamp.max(0) as u64),
            transactions,
            gas_used: quantity(block.gas_used),
            gas_limit: quantity(block.gas_limit),
            miner: block.producer,
            extra_data: block.extra_data.clone(),
            size: quantity(block.size),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub value: String,
    pub gas_price: String,
    pub gas: String,
    pub nonce: String,
    pub input: Bytes,
    pub block_number: Option<String>,
    pub block_hash: Option<H256>,
    pub transaction_index: Option<String>,
}

impl RpcTransaction {
    /// `block_hash` is `None` for pending transactions
    pub fn new(tx: &Transaction, block_hash: Option<H256>) -> Self {
        Self {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            value: quantity(tx.value),
            gas_price: quantity(tx.gas_price),
            gas: quantity(tx.gas_limit),
            nonce: quantity(tx.nonce),
            input: tx.data.clone(),
            block_number: tx.block_height.map(quantity),
            block_hash,
            transaction_index: tx.transaction_index.map(quantity),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Option<Address>,
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub block_number: String,
    pub transaction_hash: H256,
    pub log_index: String,
    /// Event name, e.g. `Transfer`
    pub event: String,
}

impl From<&Event> for RpcLog {
    fn from(event: &Event) -> Self {
        Self {
            address: event.address,
            topics: event.topics.clone(),
            data: event.data.clone(),
            block_number: quantity(event.block_height),
            transaction_hash: event.transaction_hash,
            log_index: quantity(event.log_index),
            event: event.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: H256,
    pub transaction_index: String,
    pub block_number: String,
    pub block_hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub contract_address: Option<Address>,
    pub gas_used: String,
    pub fee: String,
    /// `0x1` on success, `0x0` on failure
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<RpcLog>,
}

impl RpcReceipt {
    pub fn new(receipt: &Receipt, block_hash: H256) -> Self {
        Self {
            transaction_hash: receipt.transaction_hash,
            transaction_index: quantity(receipt.transaction_index),
            block_number: quantity(receipt.block_height),
            block_hash,
            from: receipt.from,
            to: receipt.to,
            contract_address: receipt.contract_address,
            gas_used: quantity(receipt.gas_used),
            fee: quantity(receipt.fee),
            status: if receipt.is_success() { "0x1" } else { "0x0" }.to_string(),
            error: receipt.error.clone(),
            logs: receipt.logs.iter().map(RpcLog::from).collect(),
        }
    }
}

// ============ REST views ============

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub address: Address,
    pub balance: String,
    pub nonce: u64,
    pub is_contract: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<Bytes>,
    pub pending_transactions: usize,
}

impl AccountView {
    pub fn new(address: Address, account: &Account, pending_transactions: usize) -> Self {
        Self {
            address,
            balance: account.balance.to_string(),
            nonce: account.nonce,
            is_contract: account.is_contract(),
            code: account.code.clone(),
            pending_transactions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorView {
    pub address: Address,
    pub name: String,
    pub stake: String,
    pub commission_rate: f64,
    pub subnet: String,
    pub active: bool,
    pub uptime: f64,
    pub rewards: String,
    pub blocks_produced: u64,
    pub registered_at: i64,
}

impl From<&Validator> for ValidatorView {
    fn from(v: &Validator) -> Self {
        Self {
            address: v.address,
            name: v.name.clone(),
            stake: v.stake.to_string(),
            commission_rate: v.commission_rate,
            subnet: v.subnet.clone(),
            active: v.active,
            uptime: v.uptime,
            rewards: v.rewards.to_string(),
            blocks_produced: v.blocks_produced,
            registered_at: v.registered_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkView {
    pub chain_id: u64,
    pub block_height: u64,
    pub block_time: u64,
    pub validator_count: usize,
    pub active_validators: usize,
    pub total_staked: String,
    pub min_gas_price: String,
    pub gas_limit: u64,
    pub pending_transactions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionView {
    pub transaction: RpcTransaction,
    pub receipt: Option<RpcReceipt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantity_encoding() {
        assert_eq!(quantity(0u64), "0x0");
        assert_eq!(quantity(26u64), "0x1a");
        assert_eq!(quantity(u128::MAX), format!("0x{}", "f".repeat(32)));
    }

    #[test]
    fn test_receipt_status() {
        let receipt = Receipt {
            transaction_hash: H256([1u8; 32]),
            block_height: 3,
            transaction_index: 0,
            from: Address([2u8; 20]),
            to: None,
            contract_address: Some(Address([3u8; 20])),
            gas_used: 100_000,
            fee: 0,
            status: l2_runtime::TxStatus::Failure,
            error: Some("NonceGap".to_string()),
            logs: vec![],
        };
        let view = serde_json::to_value(RpcReceipt::new(&receipt, H256::zero())).unwrap();
        assert_eq!(view["status"], "0x0");
        assert_eq!(view["blockNumber"], "0x3");
        assert_eq!(view["gasUsed"], "0x186a0");
        assert_eq!(view["error"], "NonceGap");
    }
}
