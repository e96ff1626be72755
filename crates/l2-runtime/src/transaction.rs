//! Signed raw transaction codec
//!
//! A raw transaction is `0x` + hex(borsh(`SignedTransaction`)). The hash of a
//! transaction is the blake3 digest of those raw bytes, so resubmitting the
//! same payload always yields the same hash.

use crate::{
    error::{ChainError, ChainResult},
    params::SignatureMode,
    primitives::{decode_prefixed, encode_prefixed, Address, Bytes, H256},
    types::Transaction,
};
use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Unsigned transaction fields covered by the signature
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TransactionBody {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: u128,
    pub data: Bytes,
}

/// Wire form of a client transaction
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedTransaction {
    pub body: TransactionBody,
    pub public_key: [u8; 32],
    pub signature: [u8; 64],
}

impl SignedTransaction {
    /// Sign a body with an ed25519 key
    pub fn sign(body: TransactionBody, key: &SigningKey) -> Self {
        let message = borsh::to_vec(&body).unwrap_or_default();
        let signature = key.sign(&message);
        Self {
            body,
            public_key: key.verifying_key().to_bytes(),
            signature: signature.to_bytes(),
        }
    }

    pub fn sender(&self) -> Address {
        Address::from_public_key(&self.public_key)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).unwrap_or_default()
    }

    /// Hex encoding accepted by `eth_sendRawTransaction`
    pub fn encode(&self) -> String {
        encode_prefixed(&self.to_bytes())
    }

    pub fn hash(&self) -> H256 {
        H256::digest(&self.to_bytes())
    }

    /// Check the signature according to the configured mode
    pub fn verify(&self, mode: SignatureMode) -> ChainResult<()> {
        let key = VerifyingKey::from_bytes(&self.public_key).map_err(|_| ChainError::InvalidSignature)?;
        match mode {
            SignatureMode::Structural => Ok(()),
            SignatureMode::Strict => {
                let message = borsh::to_vec(&self.body).map_err(|e| ChainError::Codec(e.to_string()))?;
                let signature = Signature::from_bytes(&self.signature);
                key.verify(&message, &signature)
                    .map_err(|_| ChainError::InvalidSignature)
            }
        }
    }

    /// Project into the node's transaction record
    pub fn to_transaction(&self, hash: H256) -> Transaction {
        Transaction {
            hash,
            from: self.sender(),
            to: self.body.to,
            value: self.body.value,
            gas_price: self.body.gas_price,
            gas_limit: self.body.gas_limit,
            nonce: self.body.nonce,
            data: self.body.data.clone(),
            block_height: None,
            transaction_index: None,
        }
    }
}

/// A raw transaction after decoding, before validation
#[derive(Debug, Clone)]
pub struct DecodedTransaction {
    pub signed: SignedTransaction,
    pub tx: Transaction,
}

/// Decode a hex raw transaction for the given chain
pub fn decode_raw(raw: &str, chain_id: u64) -> ChainResult<DecodedTransaction> {
    let bytes = decode_prefixed(raw.trim()).map_err(|e| ChainError::MalformedTransaction(e.to_string()))?;
    let signed = SignedTransaction::try_from_slice(&bytes)
        .map_err(|e| ChainError::MalformedTransaction(e.to_string()))?;

    if signed.body.chain_id != chain_id {
        return Err(ChainError::MalformedTransaction(format!(
            "wrong chain id {} (expected {})",
            signed.body.chain_id, chain_id
        )));
    }

    let hash = H256::digest(&bytes);
    let tx = signed.to_transaction(hash);
    Ok(DecodedTransaction { signed, tx })
}
