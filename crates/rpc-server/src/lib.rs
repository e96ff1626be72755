//! RPC Server - JSON-RPC, REST and WebSocket for the L2 node
//!
//! - HTTP JSON-RPC: Ethereum-style `eth_*` / `net_*` / `web3_*` subset, batches
//! - REST: read-only mirror of blocks, transactions, accounts, validators, events
//! - WebSocket: `blocks` and `validations` channels, validator votes

pub mod http_server;
pub mod methods;
pub mod subscriptions;
pub mod views;
pub mod ws_server;

#[cfg(test)]
mod test_utils;

pub use http_server::HttpRpcServer;
pub use methods::{RpcContext, RpcError, RpcRequest};
pub use subscriptions::NotificationBus;
pub use ws_server::WebSocketServer;

use std::{sync::Arc, time::Duration};

/// RPC Server configuration
#[derive(Clone, Debug)]
pub struct RpcServerConfig {
    /// HTTP RPC bind address
    pub http_addr: String,
    /// WebSocket bind address
    pub ws_addr: String,
    /// Path JSON-RPC requests are posted to
    pub rpc_path: String,
    /// Upper bound on handling one HTTP request
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8545".to_string(),
            ws_addr: "127.0.0.1:8546".to_string(),
            rpc_path: "/".to_string(),
            request_timeout: Duration::from_secs(10),
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Combined RPC server (HTTP + WebSocket)
pub struct RpcServer {
    config: RpcServerConfig,
    context: Arc<RpcContext>,
    bus: Arc<NotificationBus>,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig, context: Arc<RpcContext>, bus: Arc<NotificationBus>) -> Self {
        Self {
            config,
            context,
            bus,
        }
    }

    /// Get the HTTP address
    pub fn http_addr(&self) -> &str {
        &self.config.http_addr
    }

    /// Get the WebSocket address
    pub fn ws_addr(&self) -> &str {
        &self.config.ws_addr
    }

    /// Serve HTTP and WebSocket until either fails
    pub async fn run(self) -> anyhow::Result<()> {
        let http = HttpRpcServer::new(self.context.clone(), self.config.clone());
        let ws = WebSocketServer::new(self.context, self.bus);
        tokio::try_join!(
            http.run(&self.config.http_addr),
            ws.run(&self.config.ws_addr)
        )?;
        Ok(())
    }
}
