//! Chain errors

use crate::primitives::H256;
use thiserror::Error;

/// Errors raised by admission, application and the ledger store
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Gas limit {gas_limit} exceeds network limit {max}")]
    GasLimitExceeded { gas_limit: u64, max: u64 },

    #[error("Intrinsic gas too low: limit {gas_limit}, required {required}")]
    IntrinsicGasTooLow { gas_limit: u64, required: u64 },

    #[error("Gas price {gas_price} below minimum {min}")]
    GasPriceTooLow { gas_price: u128, min: u128 },

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u128, available: u128 },

    #[error("Nonce too low: expected {expected}, got {got}")]
    NonceTooLow { expected: u64, got: u64 },

    #[error("Nonce gap: expected {expected}, got {got}")]
    NonceGap { expected: u64, got: u64 },

    #[error("Duplicate transaction {0}")]
    DuplicateTransaction(H256),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Block height {0} already exists")]
    DuplicateHeight(u64),

    #[error("Parent mismatch at height {height}: expected {expected}, got {got}")]
    ParentMismatch { height: u64, expected: H256, got: H256 },

    #[error("Store I/O error: {0}")]
    StoreIo(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    Codec(String),

    #[error("Stored data is corrupt: {0}")]
    Corruption(String),

    #[error("No active validator available for height {0}")]
    NoActiveValidator(u64),
}

impl ChainError {
    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            ChainError::MalformedTransaction(_) => "MalformedTransaction",
            ChainError::InvalidSignature => "InvalidSignature",
            ChainError::GasLimitExceeded { .. } => "GasLimitExceeded",
            ChainError::IntrinsicGasTooLow { .. } => "IntrinsicGasTooLow",
            ChainError::GasPriceTooLow { .. } => "GasPriceTooLow",
            ChainError::InsufficientBalance { .. } => "InsufficientBalance",
            ChainError::NonceTooLow { .. } => "NonceTooLow",
            ChainError::NonceGap { .. } => "NonceGap",
            ChainError::DuplicateTransaction(_) => "DuplicateTransaction",
            ChainError::NotFound(_) => "NotFound",
            ChainError::DuplicateHeight(_) => "DuplicateHeight",
            ChainError::ParentMismatch { .. } => "ParentMismatch",
            ChainError::StoreIo(_) => "StoreIOError",
            ChainError::Codec(_) => "CodecError",
            ChainError::Corruption(_) => "StorageCorruption",
            ChainError::NoActiveValidator(_) => "NoActiveValidator",
        }
    }

    /// Whether the node cannot keep producing blocks after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::Corruption(_))
    }
}

pub type ChainResult<T> = Result<T, ChainError>;
