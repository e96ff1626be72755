//! Node Configuration
//!
//! Command-line flags with environment fallbacks, and the optional TOML
//! genesis file.

use clap::{Parser, ValueEnum};
use l2_runtime::{
    Address, ChainParams, GenesisConfig, SignatureMode, BLOCK_GAS_LIMIT, BLOCK_TIME_SECS,
    CHAIN_ID, MAX_TXS_PER_BLOCK, MIN_GAS_PRICE,
};
use rpc_server::RpcServerConfig;
use std::{path::Path, path::PathBuf, time::Duration};

/// Node mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Produce blocks and serve RPC
    Node,
    /// Follow a node's block stream and vote on each block
    Validator,
}

/// Signature checking at admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SignatureCheck {
    Strict,
    /// Development only: signatures are not verified
    Structural,
}

impl From<SignatureCheck> for SignatureMode {
    fn from(check: SignatureCheck) -> Self {
        match check {
            SignatureCheck::Strict => SignatureMode::Strict,
            SignatureCheck::Structural => SignatureMode::Structural,
        }
    }
}

/// 01A L2 node
#[derive(Parser, Debug)]
#[command(name = "l2-node")]
#[command(about = "Single-authority L2 node: ledger, mempool, block producer and JSON-RPC", long_about = None)]
pub struct Args {
    /// Run mode (node or validator)
    #[arg(long, value_enum, default_value = "node", env = "L2_MODE")]
    pub mode: Mode,

    /// HTTP RPC bind address
    #[arg(long, default_value = "127.0.0.1:8545", env = "L2_RPC_ADDR")]
    pub rpc_addr: String,

    /// WebSocket bind address
    #[arg(long, default_value = "127.0.0.1:8546", env = "L2_WS_ADDR")]
    pub ws_addr: String,

    /// Path JSON-RPC requests are posted to
    #[arg(long, default_value = "/", env = "L2_RPC_PATH")]
    pub rpc_path: String,

    /// Seconds a single HTTP request may take
    #[arg(long, default_value = "10", env = "L2_RPC_TIMEOUT_SECS")]
    pub rpc_timeout_secs: u64,

    /// Block time in seconds
    #[arg(long, default_value_t = BLOCK_TIME_SECS, env = "L2_BLOCK_TIME_SECS")]
    pub block_time_secs: u64,

    /// Chain identifier
    #[arg(long, default_value_t = CHAIN_ID, env = "L2_CHAIN_ID")]
    pub chain_id: u64,

    /// Minimum gas price accepted at admission
    #[arg(long, default_value_t = MIN_GAS_PRICE, env = "L2_MIN_GAS_PRICE")]
    pub min_gas_price: u128,

    /// Gas ceiling per transaction and per block
    #[arg(long, default_value_t = BLOCK_GAS_LIMIT, env = "L2_BLOCK_GAS_LIMIT")]
    pub block_gas_limit: u64,

    /// Maximum transactions per block
    #[arg(long, default_value_t = MAX_TXS_PER_BLOCK, env = "L2_MAX_TXS_PER_BLOCK")]
    pub max_txs_per_block: usize,

    /// Signature verification mode
    #[arg(long, value_enum, default_value = "strict", env = "L2_SIGNATURE_MODE")]
    pub signature_mode: SignatureCheck,

    /// Data directory for the ledger
    #[arg(long, default_value = "./data", env = "L2_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Genesis TOML file; the development genesis is used when absent
    #[arg(long, env = "L2_GENESIS")]
    pub genesis: Option<PathBuf>,

    /// Per-subscriber backlog on the streaming channel
    #[arg(long, default_value = "256", env = "L2_NOTIFICATION_BUFFER")]
    pub notification_buffer: usize,

    /// Validator address (validator mode)
    #[arg(long, env = "L2_VALIDATOR_ADDRESS")]
    pub validator_address: Option<Address>,

    /// Validator display name (validator mode)
    #[arg(long, env = "L2_VALIDATOR_NAME")]
    pub validator_name: Option<String>,

    /// Node WebSocket URL (validator mode)
    #[arg(long, default_value = "ws://127.0.0.1:8546", env = "L2_NODE_WS_URL")]
    pub node_ws_url: String,

    /// Seconds to wait before reconnecting (validator mode)
    #[arg(long, default_value = "3")]
    pub reconnect_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "L2_LOG_LEVEL")]
    pub log_level: String,
}

impl Args {
    pub fn chain_params(&self) -> ChainParams {
        ChainParams {
            chain_id: self.chain_id,
            block_gas_limit: self.block_gas_limit,
            min_gas_price: self.min_gas_price,
            block_time_secs: self.block_time_secs,
            max_txs_per_block: self.max_txs_per_block,
            signature_mode: self.signature_mode.into(),
        }
    }

    pub fn rpc_config(&self) -> RpcServerConfig {
        RpcServerConfig {
            http_addr: self.rpc_addr.clone(),
            ws_addr: self.ws_addr.clone(),
            rpc_path: self.rpc_path.clone(),
            request_timeout: Duration::from_secs(self.rpc_timeout_secs),
            ..Default::default()
        }
    }
}

/// Read the genesis file, or fall back to the development genesis
pub fn load_genesis(path: Option<&Path>) -> anyhow::Result<GenesisConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            let genesis: GenesisConfig = toml::from_str(&text)?;
            tracing::info!(
                "Loaded genesis from {:?}: {} validators, {} allocations",
                path,
                genesis.validators.len(),
                genesis.allocations.len()
            );
            Ok(genesis)
        }
        None => {
            tracing::info!("No genesis file given, using the development genesis");
            Ok(GenesisConfig::development())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["l2-node"]).unwrap();
        assert_eq!(args.mode, Mode::Node);

        let params = args.chain_params();
        assert_eq!(params.chain_id, 0x1a);
        assert_eq!(params.block_time_secs, 3);
        assert_eq!(params.min_gas_price, 1_000_000_000);
        assert_eq!(params.signature_mode, SignatureMode::Strict);
        assert_eq!(args.rpc_config().request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_validator_flags() {
        let addr = Address([7u8; 20]);
        let args = Args::try_parse_from([
            "l2-node",
            "--mode",
            "validator",
            "--validator-address",
            &addr.to_string(),
            "--signature-mode",
            "structural",
        ])
        .unwrap();
        assert_eq!(args.mode, Mode::Validator);
        assert_eq!(args.validator_address, Some(addr));
        assert_eq!(args.chain_params().signature_mode, SignatureMode::Structural);
    }

    #[test]
    fn test_genesis_toml() {
        let toml = r#"
            timestamp = 1700000000

            [[validators]]
            address = "0x1111111111111111111111111111111111111111"
            name = "Cortex"
            stake = "100000000000000000000000"
            subnet = "inference"

            [[validators]]
            address = "0x2222222222222222222222222222222222222222"
            name = "Synapse"
            stake = 5000
            active = false

            [[allocations]]
            address = "0x3333333333333333333333333333333333333333"
            balance = "1000000000000000000000000"
        "#;
        let genesis: GenesisConfig = toml::from_str(toml).unwrap();
        assert_eq!(genesis.timestamp, Some(1_700_000_000));
        assert_eq!(genesis.validators.len(), 2);
        assert_eq!(genesis.validators[0].stake, 100_000 * 10u128.pow(18));
        assert_eq!(genesis.validators[0].commission_rate, 5.0);
        assert!(!genesis.validators[1].active);
        assert_eq!(genesis.allocations[0].balance, 10u128.pow(24));
    }

    #[test]
    fn test_missing_genesis_file() {
        assert!(load_genesis(Some(Path::new("/nonexistent/genesis.toml"))).is_err());
        assert_eq!(load_genesis(None).unwrap().validators.len(), 3);
    }
}
