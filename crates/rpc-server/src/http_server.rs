//! HTTP JSON-RPC Server
//!
//! JSON-RPC over POST (single and batch requests) plus a read-only REST
//! mirror of the ledger under `/api`.

use crate::{
    methods::{
        dispatch, query_logs, receipt_view, transaction_view, BlockTag, LogFilter, RpcContext,
        RpcError, RpcRequest,
    },
    views::{
        AccountView, BlockTransactions, NetworkView, RpcBlock, RpcLog, TransactionView,
        ValidatorView,
    },
    RpcServerConfig,
};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use l2_runtime::{Address, ChainError, H256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{str::FromStr, sync::Arc};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};

/// JSON-RPC request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    /// Error kind, e.g. `NonceTooLow`
    pub data: String,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, error: &RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code: error.code(),
                message: error.to_string(),
                data: error.kind().to_string(),
            }),
        }
    }
}

/// HTTP RPC Server
pub struct HttpRpcServer {
    context: Arc<RpcContext>,
    config: RpcServerConfig,
}

impl HttpRpcServer {
    pub fn new(context: Arc<RpcContext>, config: RpcServerConfig) -> Self {
        Self { context, config }
    }

    /// Create the Axum router
    pub fn router(self) -> Router {
        // CORS layer to allow browser clients
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

        let middleware = ServiceBuilder::new()
            .layer(cors)
            .layer(TimeoutLayer::new(self.config.request_timeout))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes));

        Router::new()
            .route(&self.config.rpc_path, post(handle_rpc))
            .route("/health", get(handle_health))
            .route("/api/blocks/:id", get(handle_get_block))
            .route("/api/transactions/:hash", get(handle_get_transaction))
            .route("/api/accounts/:address", get(handle_get_account))
            .route("/api/network", get(handle_network))
            .route("/api/validators", get(handle_validators))
            .route("/api/events", get(handle_events))
            .layer(middleware)
            .with_state(self.context)
    }

    /// Run the server
    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("HTTP RPC server listening on {}", addr);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

// ============ JSON-RPC ============

/// Handle a JSON-RPC body: a single request or a batch
async fn handle_rpc(State(context): State<Arc<RpcContext>>, body: Bytes) -> Json<Value> {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let error = RpcError::Parse(e.to_string());
            return Json(to_value(JsonRpcResponse::failure(Value::Null, &error)));
        }
    };

    match payload {
        Value::Array(requests) if requests.is_empty() => {
            let error = RpcError::InvalidRequest("empty batch".to_string());
            Json(to_value(JsonRpcResponse::failure(Value::Null, &error)))
        }
        Value::Array(requests) => {
            let responses: Vec<Value> = requests
                .into_iter()
                .map(|request| to_value(handle_single(&context, request)))
                .collect();
            Json(Value::Array(responses))
        }
        request => Json(to_value(handle_single(&context, request))),
    }
}

fn to_value(response: JsonRpcResponse) -> Value {
    serde_json::to_value(response).unwrap_or(Value::Null)
}

fn handle_single(context: &RpcContext, payload: Value) -> JsonRpcResponse {
    let id = payload.get("id").cloned().unwrap_or(Value::Null);

    let request: JsonRpcRequest = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::failure(id, &RpcError::InvalidRequest(e.to_string())),
    };
    if request.jsonrpc != "2.0" {
        let error = RpcError::InvalidRequest(format!("unsupported jsonrpc version {}", request.jsonrpc));
        return JsonRpcResponse::failure(id, &error);
    }

    tracing::debug!("RPC method called: {}", request.method);
    let result = RpcRequest::parse(&request.method, request.params)
        .and_then(|parsed| dispatch(context, parsed));

    match result {
        Ok(value) => JsonRpcResponse::success(request.id, value),
        Err(e) => {
            if let RpcError::Chain(chain) = &e {
                if !e.is_not_found() {
                    tracing::warn!("{} failed: {}", request.method, chain);
                }
            }
            JsonRpcResponse::failure(request.id, &e)
        }
    }
}

// ============ REST ============

/// REST error body with an HTTP status derived from the error kind
pub struct ApiError(RpcError);

impl From<RpcError> for ApiError {
    fn from(e: RpcError) -> Self {
        ApiError(e)
    }
}

impl From<ChainError> for ApiError {
    fn from(e: ChainError) -> Self {
        ApiError(RpcError::Chain(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            RpcError::InvalidParams(_) | RpcError::InvalidRequest(_) | RpcError::Parse(_) => {
                StatusCode::BAD_REQUEST
            }
            RpcError::Chain(_) if self.0.code() != -32603 => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_path<T: FromStr>(value: &str, what: &str) -> Result<T, ApiError> {
    value
        .parse()
        .map_err(|_| ApiError(RpcError::InvalidParams(format!("invalid {}: {}", what, value))))
}

async fn handle_health(State(ctx): State<Arc<RpcContext>>) -> ApiResult<Value> {
    Ok(Json(json!({
        "status": "ok",
        "blockHeight": ctx.head_height()?,
    })))
}

/// `/api/blocks/{height|latest}`
async fn handle_get_block(
    State(ctx): State<Arc<RpcContext>>,
    Path(id): Path<String>,
) -> ApiResult<RpcBlock> {
    let tag = match id.as_str() {
        "latest" => BlockTag::Latest,
        other => BlockTag::Number(parse_path(other, "block height")?),
    };
    let block = ctx.store.get_block(ctx.resolve(tag)?)?;
    Ok(Json(RpcBlock::new(
        &block,
        BlockTransactions::Hashes(block.transactions.clone()),
    )))
}

async fn handle_get_transaction(
    State(ctx): State<Arc<RpcContext>>,
    Path(hash): Path<String>,
) -> ApiResult<TransactionView> {
    let hash: H256 = parse_path(&hash, "transaction hash")?;
    let transaction = transaction_view(&ctx, &hash)?;
    let receipt = match receipt_view(&ctx, &hash) {
        Ok(r) => Some(r),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };
    Ok(Json(TransactionView {
        transaction,
        receipt,
    }))
}

async fn handle_get_account(
    State(ctx): State<Arc<RpcContext>>,
    Path(address): Path<String>,
) -> ApiResult<AccountView> {
    let address: Address = parse_path(&address, "address")?;
    let account = ctx.store.get_account(&address)?;
    let pending = ctx.mempool.pending_for(&address).len();
    Ok(Json(AccountView::new(address, &account, pending)))
}

async fn handle_network(State(ctx): State<Arc<RpcContext>>) -> ApiResult<NetworkView> {
    Ok(Json(NetworkView {
        chain_id: ctx.params.chain_id,
        block_height: ctx.head_height()?,
        block_time: ctx.params.block_time_secs,
        validator_count: ctx.registry.list().len(),
        active_validators: ctx.registry.active_count(),
        total_staked: ctx.registry.total_staked().to_string(),
        min_gas_price: ctx.params.min_gas_price.to_string(),
        gas_limit: ctx.params.block_gas_limit,
        pending_transactions: ctx.mempool.len(),
    }))
}

async fn handle_validators(State(ctx): State<Arc<RpcContext>>) -> ApiResult<Vec<ValidatorView>> {
    Ok(Json(ctx.registry.list().iter().map(ValidatorView::from).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventQuery {
    contract: Option<String>,
    from_block: Option<u64>,
    to_block: Option<u64>,
}

async fn handle_events(
    State(ctx): State<Arc<RpcContext>>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Vec<RpcLog>> {
    let address = match query.contract.as_deref() {
        Some(s) => Some(parse_path::<Address>(s, "contract address")?),
        None => None,
    };
    let filter = LogFilter {
        from_block: Some(BlockTag::Number(query.from_block.unwrap_or(0))),
        to_block: Some(query.to_block.map_or(BlockTag::Latest, BlockTag::Number)),
        address,
        topics: Vec::new(),
    };
    Ok(Json(query_logs(&ctx, &filter)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{funded_key, test_context};
    use axum::{body::Body, http::Request};
    use l2_runtime::{
        transaction::{SignedTransaction, TransactionBody},
        Bytes as TxBytes,
    };
    use tower::ServiceExt;

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn rpc(body: Value) -> Request<Body> {
        Request::post("/")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn router(ctx: Arc<RpcContext>) -> Router {
        HttpRpcServer::new(ctx, RpcServerConfig::default()).router()
    }

    #[tokio::test]
    async fn test_basic_methods() {
        let (_dir, ctx) = test_context();

        let (status, body) = call(
            router(ctx.clone()),
            rpc(json!({"jsonrpc": "2.0", "id": 1, "method": "eth_chainId", "params": []})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "0x1a");
        assert_eq!(body["id"], 1);

        let (_, body) = call(
            router(ctx.clone()),
            rpc(json!({"jsonrpc": "2.0", "id": 2, "method": "eth_blockNumber"})),
        )
        .await;
        assert_eq!(body["result"], "0x0");

        let (_, body) = call(
            router(ctx.clone()),
            rpc(json!({"jsonrpc": "2.0", "id": 3, "method": "eth_getBlockByNumber", "params": ["0x5", false]})),
        )
        .await;
        assert_eq!(body["error"]["code"], -32001);
        assert_eq!(body["error"]["data"], "NotFound");

        let (_, body) = call(
            router(ctx),
            rpc(json!({"jsonrpc": "2.0", "id": 4, "method": "eth_mine"})),
        )
        .await;
        assert_eq!(body["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_malformed_and_batch_requests() {
        let (_dir, ctx) = test_context();

        let request = Request::post("/").body(Body::from("{not json")).unwrap();
        let (status, body) = call(router(ctx.clone()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"]["code"], -32700);

        let (_, body) = call(router(ctx.clone()), rpc(json!({"id": 9, "method": 5}))).await;
        assert_eq!(body["error"]["code"], -32600);
        assert_eq!(body["id"], 9);

        let (_, body) = call(
            router(ctx),
            rpc(json!([
                {"jsonrpc": "2.0", "id": 1, "method": "net_version"},
                {"jsonrpc": "2.0", "id": 2, "method": "eth_estimateGas", "params": [{"data": "0x01"}]},
            ])),
        )
        .await;
        assert_eq!(body[0]["result"], "26");
        assert_eq!(body[1]["result"], "0x186a0");
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (_dir, ctx) = test_context();
        let config = RpcServerConfig {
            max_body_bytes: 64,
            ..Default::default()
        };
        let request = rpc(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_sendRawTransaction",
            "params": [format!("0x{}", "ab".repeat(128))],
        }));
        let response = HttpRpcServer::new(ctx.clone(), config.clone())
            .router()
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let (status, body) = call(
            HttpRpcServer::new(ctx, config).router(),
            rpc(json!({"jsonrpc": "2.0", "id": 2, "method": "eth_chainId"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "0x1a");
    }

    #[tokio::test]
    async fn test_send_raw_transaction() {
        let (_dir, ctx) = test_context();
        let (key, sender) = funded_key();

        let raw = SignedTransaction::sign(
            TransactionBody {
                chain_id: ctx.params.chain_id,
                nonce: 0,
                gas_price: ctx.params.min_gas_price,
                gas_limit: 21_000,
                to: Some(Address([0xcc; 20])),
                value: 10,
                data: TxBytes::default(),
            },
            &key,
        )
        .encode();

        let send = json!({"jsonrpc": "2.0", "id": 1, "method": "eth_sendRawTransaction", "params": [raw]});
        let (_, body) = call(router(ctx.clone()), rpc(send.clone())).await;
        let hash = body["result"].as_str().unwrap().to_string();
        assert!(ctx.mempool.contains(&hash.parse::<H256>().unwrap()));

        let (_, body) = call(router(ctx.clone()), rpc(send)).await;
        assert_eq!(body["error"]["code"], -32018);
        assert_eq!(body["error"]["data"], "DuplicateTransaction");

        // pending transactions are visible with a null block number
        let (_, body) = call(
            router(ctx.clone()),
            rpc(json!({"jsonrpc": "2.0", "id": 2, "method": "eth_getTransactionByHash", "params": [hash]})),
        )
        .await;
        assert_eq!(body["result"]["from"], sender.to_string());
        assert!(body["result"]["blockNumber"].is_null());

        let (_, body) = call(
            router(ctx),
            rpc(json!({"jsonrpc": "2.0", "id": 3, "method": "eth_getTransactionCount", "params": [sender.to_string(), "pending"]})),
        )
        .await;
        assert_eq!(body["result"], "0x1");
    }

    #[tokio::test]
    async fn test_rest_endpoints() {
        let (_dir, ctx) = test_context();

        let get = |path: &str| Request::get(path).body(Body::empty()).unwrap();

        let (status, body) = call(router(ctx.clone()), get("/api/blocks/latest")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["number"], "0x0");

        let (status, _) = call(router(ctx.clone()), get("/api/blocks/42")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(router(ctx.clone()), get("/api/accounts/0x12")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(router(ctx.clone()), get("/api/network")).await;
        assert_eq!(body["chainId"], 26);
        assert_eq!(body["validatorCount"], 3);
        assert_eq!(body["totalStaked"], ctx.registry.total_staked().to_string());

        let (_, body) = call(router(ctx.clone()), get("/api/validators")).await;
        assert_eq!(body.as_array().unwrap().len(), 3);
        assert_eq!(body[0]["name"], "Cortex");

        let (_, body) = call(router(ctx.clone()), get("/api/events?fromBlock=0")).await;
        assert!(body.as_array().unwrap().is_empty());

        let (_, body) = call(router(ctx), get("/health")).await;
        assert_eq!(body["status"], "ok");
    }
}
