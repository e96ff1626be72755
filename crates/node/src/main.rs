//! 01A L2 Node
//!
//! Main entry point for the single-authority L2 node.
//! Node mode produces blocks and serves JSON-RPC, REST and WebSocket.
//! Validator mode follows a node's block stream and votes on every block.

use anyhow::Result;
use clap::Parser;
use l2_consensus::{UptimePolicy, ValidatorClientBuilder, ValidatorRegistry};
use l2_runtime::{
    genesis, BlockProducer, BlockProducerConfig, LedgerStore, Mempool,
};
use rpc_server::{NotificationBus, RpcContext, RpcServer};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{Args, Mode};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.mode {
        Mode::Node => run_node(args).await,
        Mode::Validator => run_validator(args).await,
    }
}

/// Run in node mode - admit transactions, produce blocks, serve RPC
async fn run_node(args: Args) -> Result<()> {
    let params = args.chain_params();
    let rpc_config = args.rpc_config();

    tracing::info!("Starting 01A L2 node (chain id {:#x})", params.chain_id);
    tracing::info!("  HTTP RPC: {}", rpc_config.http_addr);
    tracing::info!("  WebSocket: {}", rpc_config.ws_addr);
    tracing::info!("  Block time: {}s", params.block_time_secs);
    tracing::info!("  Data directory: {:?}", args.data_dir);
    tracing::info!("  Signature mode: {:?}", params.signature_mode);

    std::fs::create_dir_all(&args.data_dir)?;
    let store = Arc::new(LedgerStore::open(&args.data_dir)?);

    let genesis_config = config::load_genesis(args.genesis.as_deref())?;
    match genesis::initialize(&store, &genesis_config, &params)? {
        Some(block) => tracing::info!("Initialized genesis block {}", block.hash),
        None => tracing::info!(
            "Resuming from height {}",
            store.head_height()?.unwrap_or(0)
        ),
    }

    let registry = Arc::new(ValidatorRegistry::load(store.clone(), UptimePolicy::default())?);
    tracing::info!(
        "{} validators, {} active",
        registry.list().len(),
        registry.active_count()
    );

    let mempool = Arc::new(Mempool::new(store.clone(), params.clone()));
    let producer = Arc::new(BlockProducer::new(
        store.clone(),
        mempool.clone(),
        registry.clone(),
        BlockProducerConfig {
            params: params.clone(),
            verbose: args.verbose,
            ..Default::default()
        },
    ));

    let bus = Arc::new(NotificationBus::new(args.notification_buffer));

    // Forward committed blocks to streaming subscribers
    let mut block_updates = producer.subscribe();
    let forward_bus = bus.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match block_updates.recv().await {
                Ok(update) => {
                    let delivered = forward_bus.publish_block(&update.block);
                    tracing::debug!(
                        "Block {} pushed to {} subscribers",
                        update.block.height,
                        delivered
                    );
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Block forwarder lagged, skipped {} blocks", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let context = Arc::new(RpcContext {
        store: store.clone(),
        mempool,
        registry,
        params,
    });
    let mut server = tokio::spawn(RpcServer::new(rpc_config, context, bus).run());

    let run_producer = producer.clone();
    let mut production = tokio::spawn(async move { run_producer.run().await });

    tracing::info!("L2 node running. Press Ctrl+C to stop.");

    let outcome: Result<()> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
            Ok(())
        }
        result = &mut production => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::anyhow!("block production halted: {}", e)),
            Err(e) => Err(e.into()),
        },
        result = &mut server => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.context("RPC server failed")),
            Err(e) => Err(e.into()),
        },
    };

    producer.stop();
    production.abort();
    server.abort();
    forwarder.abort();

    if let Err(e) = store.flush() {
        tracing::error!("Failed to flush ledger: {}", e);
    }

    tracing::info!("Node stopped");
    outcome
}

/// Run in validator mode - follow the block stream and vote
async fn run_validator(args: Args) -> Result<()> {
    let address = args
        .validator_address
        .unwrap_or_else(|| genesis::development_address(100));
    let name = args
        .validator_name
        .clone()
        .unwrap_or_else(|| address.to_string());

    tracing::info!("Starting 01A L2 validator {} ({})", name, address);
    tracing::info!("  Node: {}", args.node_ws_url);

    let mut client = ValidatorClientBuilder::new(address)
        .name(name)
        .node_url(args.node_ws_url.clone())
        .build();
    let reconnect = Duration::from_secs(args.reconnect_secs.max(1));

    tracing::info!("Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            result = client.run() => {
                match result {
                    Ok(()) => tracing::warn!("Node closed the connection"),
                    Err(e) => tracing::error!("Validator error: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down validator...");
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down validator...");
                break;
            }
        }
        tracing::info!("Reconnecting to {}", args.node_ws_url);
    }

    tracing::info!("Validator stopped, {} votes sent", client.votes_sent());
    Ok(())
}
