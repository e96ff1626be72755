//! Network parameters shared by admission, production and the RPC layer

use crate::{
    BLOCK_GAS_LIMIT, BLOCK_TIME_SECS, CHAIN_ID, DATA_TX_GAS, MAX_TXS_PER_BLOCK, MIN_GAS_PRICE,
    TRANSFER_GAS,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How transaction signatures are checked at admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureMode {
    /// Full ed25519 verification over the transaction body
    #[default]
    Strict,
    /// Development only: the public key must be well-formed, the signature is not checked
    Structural,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainParams {
    pub chain_id: u64,
    /// Per-transaction and per-block gas ceiling
    pub block_gas_limit: u64,
    pub min_gas_price: u128,
    pub block_time_secs: u64,
    pub max_txs_per_block: usize,
    pub signature_mode: SignatureMode,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            chain_id: CHAIN_ID,
            block_gas_limit: BLOCK_GAS_LIMIT,
            min_gas_price: MIN_GAS_PRICE,
            block_time_secs: BLOCK_TIME_SECS,
            max_txs_per_block: MAX_TXS_PER_BLOCK,
            signature_mode: SignatureMode::Strict,
        }
    }
}

impl ChainParams {
    pub fn block_time(&self) -> Duration {
        Duration::from_secs(self.block_time_secs.max(1))
    }
}

/// Gas consumed by a transaction, independent of its outcome.
///
/// There is no VM: a plain transfer costs a flat fee and anything carrying a
/// payload costs a higher flat fee.
pub fn intrinsic_gas(data: &[u8]) -> u64 {
    if data.is_empty() {
        TRANSFER_GAS
    } else {
        DATA_TX_GAS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrinsic_gas() {
        assert_eq!(intrinsic_gas(&[]), 21_000);
        assert_eq!(intrinsic_gas(&[0x01]), 100_000);
    }

    #[test]
    fn test_signature_mode_serde() {
        let mode: SignatureMode = serde_json::from_str("\"structural\"").unwrap();
        assert_eq!(mode, SignatureMode::Structural);
    }
}
