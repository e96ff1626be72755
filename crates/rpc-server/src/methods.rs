//! RPC Methods - typed JSON-RPC requests and their handlers
//!
//! Requests are decoded from `method` + `params` into [`RpcRequest`] before
//! anything touches the ledger, so handlers only ever see validated input.

use crate::views::{quantity, BlockTransactions, RpcBlock, RpcLog, RpcReceipt, RpcTransaction};
use l2_consensus::ValidatorRegistry;
use l2_runtime::{
    params::intrinsic_gas, Address, Block, Bytes, ChainError, ChainParams, LedgerStore, Mempool,
    H256,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::{str::FromStr, sync::Arc};

/// RPC context shared across handlers
pub struct RpcContext {
    pub store: Arc<LedgerStore>,
    pub mempool: Arc<Mempool>,
    pub registry: Arc<ValidatorRegistry>,
    pub params: ChainParams,
}

impl RpcContext {
    pub fn head_height(&self) -> Result<u64, RpcError> {
        Ok(self.store.head_height()?.unwrap_or(0))
    }

    /// Resolve a block tag to a concrete height; `pending` reads as `latest`
    pub fn resolve(&self, tag: BlockTag) -> Result<u64, RpcError> {
        match tag {
            BlockTag::Earliest => Ok(0),
            BlockTag::Latest | BlockTag::Pending => self.head_height(),
            BlockTag::Number(n) => Ok(n),
        }
    }
}

// ============ Request Types ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockTag {
    #[default]
    Latest,
    Earliest,
    Pending,
    Number(u64),
}

impl FromStr for BlockTag {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" | "safe" | "finalized" => Ok(BlockTag::Latest),
            "earliest" => Ok(BlockTag::Earliest),
            "pending" => Ok(BlockTag::Pending),
            other => parse_quantity(other).map(BlockTag::Number),
        }
    }
}

impl<'de> Deserialize<'de> for BlockTag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => s.parse().map_err(serde::de::Error::custom),
            Value::Number(n) => n
                .as_u64()
                .map(BlockTag::Number)
                .ok_or_else(|| serde::de::Error::custom("block number out of range")),
            other => Err(serde::de::Error::custom(format!("invalid block tag: {}", other))),
        }
    }
}

/// Parse a `0x`-hex quantity
pub fn parse_quantity(s: &str) -> Result<u64, RpcError> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::InvalidParams(format!("expected 0x-prefixed quantity, got {}", s)))?;
    u64::from_str_radix(digits, 16)
        .map_err(|_| RpcError::InvalidParams(format!("invalid quantity {}", s)))
}

/// Call object for `eth_estimateGas`; only the payload matters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallRequest {
    #[serde(default)]
    pub from: Option<Address>,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default, alias = "input")]
    pub data: Option<Bytes>,
}

/// One topic position: a single value or any of several
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TopicFilter {
    One(H256),
    Any(Vec<H256>),
}

impl TopicFilter {
    fn matches(&self, topic: &H256) -> bool {
        match self {
            TopicFilter::One(t) => t == topic,
            TopicFilter::Any(ts) => ts.is_empty() || ts.contains(topic),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    #[serde(default)]
    pub from_block: Option<BlockTag>,
    #[serde(default)]
    pub to_block: Option<BlockTag>,
    #[serde(default)]
    pub address: Option<Address>,
    /// Positional topic filters; `null` matches anything
    #[serde(default)]
    pub topics: Vec<Option<TopicFilter>>,
}

impl LogFilter {
    pub fn matches_topics(&self, topics: &[H256]) -> bool {
        self.topics.iter().enumerate().all(|(i, filter)| match filter {
            None => true,
            Some(f) => topics.get(i).is_some_and(|t| f.matches(t)),
        })
    }
}

/// The supported method set, with decoded parameters
#[derive(Debug, Clone)]
pub enum RpcRequest {
    ChainId,
    NetVersion,
    NetListening,
    ClientVersion,
    BlockNumber,
    GasPrice,
    GetBalance { address: Address, block: BlockTag },
    GetTransactionCount { address: Address, block: BlockTag },
    GetBlockByNumber { block: BlockTag, full: bool },
    GetBlockByHash { hash: H256, full: bool },
    SendRawTransaction { raw: String },
    GetTransactionByHash { hash: H256 },
    GetTransactionReceipt { hash: H256 },
    EstimateGas { call: CallRequest },
    GetLogs { filter: LogFilter },
}

/// Positional params of a request
struct Params(Vec<Value>);

impl Params {
    fn new(params: Value) -> Result<Self, RpcError> {
        match params {
            Value::Null => Ok(Self(Vec::new())),
            Value::Array(values) => Ok(Self(values)),
            _ => Err(RpcError::InvalidParams("params must be an array".to_string())),
        }
    }

    fn required<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, RpcError> {
        let value = self
            .0
            .get(index)
            .cloned()
            .ok_or_else(|| RpcError::InvalidParams(format!("missing {}", name)))?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::InvalidParams(format!("invalid {}: {}", name, e)))
    }

    fn optional<T: DeserializeOwned + Default>(&self, index: usize, name: &str) -> Result<T, RpcError> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(_) => self.required(index, name),
        }
    }
}

impl RpcRequest {
    pub fn parse(method: &str, params: Value) -> Result<Self, RpcError> {
        let p = Params::new(params)?;
        let request = match method {
            "eth_chainId" => RpcRequest::ChainId,
            "net_version" => RpcRequest::NetVersion,
            "net_listening" => RpcRequest::NetListening,
            "web3_clientVersion" => RpcRequest::ClientVersion,
            "eth_blockNumber" => RpcRequest::BlockNumber,
            "eth_gasPrice" => RpcRequest::GasPrice,
            "eth_getBalance" => RpcRequest::GetBalance {
                address: p.required(0, "address")?,
                block: p.optional(1, "block")?,
            },
            "eth_getTransactionCount" => RpcRequest::GetTransactionCount {
                address: p.required(0, "address")?,
                block: p.optional(1, "block")?,
            },
            "eth_getBlockByNumber" => RpcRequest::GetBlockByNumber {
                block: p.required(0, "block")?,
                full: p.optional(1, "full transactions flag")?,
            },
            "eth_getBlockByHash" => RpcRequest::GetBlockByHash {
                hash: p.required(0, "block hash")?,
                full: p.optional(1, "full transactions flag")?,
            },
            "eth_sendRawTransaction" => RpcRequest::SendRawTransaction {
                raw: p.required(0, "raw transaction")?,
            },
            "eth_getTransactionByHash" => RpcRequest::GetTransactionByHash {
                hash: p.required(0, "transaction hash")?,
            },
            "eth_getTransactionReceipt" => RpcRequest::GetTransactionReceipt {
                hash: p.required(0, "transaction hash")?,
            },
            "eth_estimateGas" => RpcRequest::EstimateGas {
                call: p.optional(0, "call")?,
            },
            "eth_getLogs" => RpcRequest::GetLogs {
                filter: p.optional(0, "filter")?,
            },
            _ => return Err(RpcError::MethodNotFound(method.to_string())),
        };
        Ok(request)
    }
}

// ============ RPC Handlers ============

/// Execute a decoded request against the node
pub fn dispatch(ctx: &RpcContext, request: RpcRequest) -> Result<Value, RpcError> {
    match request {
        RpcRequest::ChainId => Ok(json!(quantity(ctx.params.chain_id))),
        RpcRequest::NetVersion => Ok(json!(ctx.params.chain_id.to_string())),
        RpcRequest::NetListening => Ok(json!(true)),
        RpcRequest::ClientVersion => Ok(json!(format!("01a-l2/v{}", env!("CARGO_PKG_VERSION")))),
        RpcRequest::BlockNumber => Ok(json!(quantity(ctx.head_height()?))),
        RpcRequest::GasPrice => Ok(json!(quantity(ctx.params.min_gas_price))),

        RpcRequest::GetBalance { address, .. } => {
            let account = ctx.store.get_account(&address)?;
            Ok(json!(quantity(account.balance)))
        }

        RpcRequest::GetTransactionCount { address, block } => {
            let nonce = match block {
                BlockTag::Pending => ctx.mempool.next_nonce(&address)?,
                _ => ctx.store.get_account(&address)?.nonce,
            };
            Ok(json!(quantity(nonce)))
        }

        RpcRequest::GetBlockByNumber { block, full } => {
            let height = ctx.resolve(block)?;
            let block = ctx.store.get_block(height)?;
            to_json(block_view(ctx, &block, full)?)
        }

        RpcRequest::GetBlockByHash { hash, full } => {
            let block = ctx.store.get_block_by_hash(&hash)?;
            to_json(block_view(ctx, &block, full)?)
        }

        RpcRequest::SendRawTransaction { raw } => {
            let hash = ctx.mempool.submit(&raw)?;
            Ok(json!(hash))
        }

        RpcRequest::GetTransactionByHash { hash } => to_json(transaction_view(ctx, &hash)?),

        RpcRequest::GetTransactionReceipt { hash } => to_json(receipt_view(ctx, &hash)?),

        RpcRequest::EstimateGas { call } => {
            let data = call.data.map(|d| d.0).unwrap_or_default();
            Ok(json!(quantity(intrinsic_gas(&data))))
        }

        RpcRequest::GetLogs { filter } => to_json(query_logs(ctx, &filter)?),
    }
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::InternalError(e.to_string()))
}

pub fn block_view(ctx: &RpcContext, block: &Block, full: bool) -> Result<RpcBlock, RpcError> {
    let transactions = if full {
        let txs = block
            .transactions
            .iter()
            .map(|hash| {
                ctx.store
                    .get_transaction(hash)
                    .map(|tx| RpcTransaction::new(&tx, Some(block.hash)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        BlockTransactions::Full(txs)
    } else {
        BlockTransactions::Hashes(block.transactions.clone())
    };
    Ok(RpcBlock::new(block, transactions))
}

/// Included transactions first, then the mempool
pub fn transaction_view(ctx: &RpcContext, hash: &H256) -> Result<RpcTransaction, RpcError> {
    match ctx.store.get_transaction(hash) {
        Ok(tx) => {
            let block_hash = match tx.block_height {
                Some(height) => Some(ctx.store.get_block(height)?.hash),
                None => None,
            };
            Ok(RpcTransaction::new(&tx, block_hash))
        }
        Err(ChainError::NotFound(what)) => ctx
            .mempool
            .pending(hash)
            .map(|tx| RpcTransaction::new(&tx, None))
            .ok_or(RpcError::Chain(ChainError::NotFound(what))),
        Err(e) => Err(e.into()),
    }
}

pub fn receipt_view(ctx: &RpcContext, hash: &H256) -> Result<RpcReceipt, RpcError> {
    let receipt = ctx.store.get_receipt(hash)?;
    let block = ctx.store.get_block(receipt.block_height)?;
    Ok(RpcReceipt::new(&receipt, block.hash))
}

pub fn query_logs(ctx: &RpcContext, filter: &LogFilter) -> Result<Vec<RpcLog>, RpcError> {
    let from = ctx.resolve(filter.from_block.unwrap_or(BlockTag::Latest))?;
    let to = ctx.resolve(filter.to_block.unwrap_or(BlockTag::Latest))?;
    let events = ctx.store.query_events(filter.address.as_ref(), from, to)?;
    Ok(events
        .iter()
        .filter(|e| filter.matches_topics(&e.topics))
        .map(RpcLog::from)
        .collect())
}

// ============ Error Types ============

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl RpcError {
    /// JSON-RPC error code
    pub fn code(&self) -> i32 {
        match self {
            RpcError::Parse(_) => -32700,
            RpcError::InvalidRequest(_) => -32600,
            RpcError::MethodNotFound(_) => -32601,
            RpcError::InvalidParams(_) => -32602,
            RpcError::InternalError(_) => -32603,
            RpcError::Chain(e) => match e {
                ChainError::NotFound(_) => -32001,
                ChainError::MalformedTransaction(_) => -32010,
                ChainError::InvalidSignature => -32011,
                ChainError::GasLimitExceeded { .. } => -32012,
                ChainError::IntrinsicGasTooLow { .. } => -32013,
                ChainError::GasPriceTooLow { .. } => -32014,
                ChainError::InsufficientBalance { .. } => -32015,
                ChainError::NonceTooLow { .. } => -32016,
                ChainError::NonceGap { .. } => -32017,
                ChainError::DuplicateTransaction(_) => -32018,
                _ => -32603,
            },
        }
    }

    /// Machine-readable error kind carried in `error.data`
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Parse(_) => "ParseError",
            RpcError::InvalidRequest(_) => "InvalidRequest",
            RpcError::MethodNotFound(_) => "MethodNotFound",
            RpcError::InvalidParams(_) => "InvalidParams",
            RpcError::InternalError(_) => "InternalError",
            RpcError::Chain(e) => e.kind(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::Chain(ChainError::NotFound(_)))
    }
}
