//! Shared fixtures for server tests

use crate::methods::RpcContext;
use ed25519_dalek::SigningKey;
use l2_consensus::{UptimePolicy, ValidatorRegistry};
use l2_runtime::{
    genesis::{self, development_address, development_key},
    Address, ChainParams, GenesisConfig, LedgerStore, Mempool,
};
use std::sync::Arc;
use tempfile::TempDir;

/// A store initialized with the development genesis, wrapped in a context
pub fn test_context() -> (TempDir, Arc<RpcContext>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LedgerStore::open(dir.path()).unwrap());
    let params = ChainParams::default();
    genesis::initialize(&store, &GenesisConfig::development(), &params).unwrap();

    let registry = Arc::new(ValidatorRegistry::load(store.clone(), UptimePolicy::default()).unwrap());
    let mempool = Arc::new(Mempool::new(store.clone(), params.clone()));
    let context = RpcContext {
        store,
        mempool,
        registry,
        params,
    };
    (dir, Arc::new(context))
}

/// A development key funded at genesis
pub fn funded_key() -> (SigningKey, Address) {
    (development_key(0), development_address(0))
}
