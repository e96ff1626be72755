//! Genesis: the initial validator set and balance allocations.
//!
//! Allocations are the only minting path; every later balance change moves
//! value between accounts or burns it as a fee.

use crate::{
    error::ChainResult,
    params::ChainParams,
    persistence::{BlockCommit, LedgerStore},
    primitives::{Address, Bytes, H256},
    types::{Account, Block, Validator},
};
use ed25519_dalek::SigningKey;
use serde::{de, Deserialize, Deserializer, Serialize};

/// One ether-style unit, 10^18 base units
pub const UNIT: u128 = 1_000_000_000_000_000_000;

/// Accept amounts either as integers or as decimal strings (TOML integers stop at i64)
fn amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Amount {
        Int(u64),
        Str(String),
    }
    match Amount::deserialize(deserializer)? {
        Amount::Int(v) => Ok(v as u128),
        Amount::Str(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub address: Address,
    pub name: String,
    #[serde(deserialize_with = "amount")]
    pub stake: u128,
    #[serde(default = "default_commission")]
    pub commission_rate: f64,
    #[serde(default)]
    pub subnet: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_commission() -> f64 {
    5.0
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub address: Address,
    #[serde(deserialize_with = "amount")]
    pub balance: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Genesis timestamp, defaults to the time of initialization
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub allocations: Vec<GenesisAllocation>,
}

/// Deterministic key for development account `index`
pub fn development_key(index: u8) -> SigningKey {
    let mut seed = [0u8; 32];
    seed[0] = 0x01;
    seed[1] = 0xa0;
    seed[31] = index;
    SigningKey::from_bytes(&seed)
}

pub fn development_address(index: u8) -> Address {
    Address::from_public_key(&development_key(index).verifying_key().to_bytes())
}

impl GenesisConfig {
    /// Three validators and four funded development accounts
    pub fn development() -> Self {
        let validators = [
            ("Cortex", "inference"),
            ("Synapse", "training"),
            ("Axon", "data"),
        ]
        .iter()
        .enumerate()
        .map(|(i, (name, subnet))| GenesisValidator {
            address: development_address(100 + i as u8),
            name: name.to_string(),
            stake: 100_000 * UNIT,
            commission_rate: default_commission(),
            subnet: subnet.to_string(),
            active: true,
        })
        .collect();

        let allocations = (0..4)
            .map(|i| GenesisAllocation {
                address: development_address(i),
                balance: 1_000_000 * UNIT,
            })
            .collect();

        Self {
            timestamp: None,
            validators,
            allocations,
        }
    }
}

/// Write the genesis block, allocations and validators into an empty store.
///
/// Returns `None` when the store already holds a chain.
pub fn initialize(
    store: &LedgerStore,
    genesis: &GenesisConfig,
    params: &ChainParams,
) -> ChainResult<Option<Block>> {
    if !store.is_empty() {
        return Ok(None);
    }

    let timestamp = genesis
        .timestamp
        .unwrap_or_else(|| chrono::Utc::now().timestamp());
    let producer = genesis
        .validators
        .iter()
        .find(|v| v.active)
        .map(|v| v.address)
        .unwrap_or_default();

    let block = Block::assemble(
        0,
        H256::zero(),
        timestamp,
        Vec::new(),
        0,
        params.block_gas_limit,
        producer,
        Bytes(b"01A genesis".to_vec()),
    );

    let mut commit = BlockCommit::new(block.clone());
    for alloc in &genesis.allocations {
        commit
            .accounts
            .push((alloc.address, Account::with_balance(alloc.balance)));
    }
    store.commit_block(commit)?;

    for (index, v) in genesis.validators.iter().enumerate() {
        store.upsert_validator(&Validator {
            address: v.address,
            name: v.name.clone(),
            stake: v.stake,
            commission_rate: v.commission_rate,
            subnet: v.subnet.clone(),
            active: v.active,
            uptime: 100.0,
            rewards: 0,
            blocks_produced: 0,
            registered_at: timestamp,
            registration_index: index as u64,
        })?;
    }

    tracing::info!(
        "Initialized genesis {} with {} validators and {} allocations",
        block.hash,
        genesis.validators.len(),
        genesis.allocations.len()
    );
    Ok(Some(block))
}
