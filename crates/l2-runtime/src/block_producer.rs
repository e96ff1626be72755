//! Block Producer
//!
//! On every tick: drain a batch from the mempool, apply it in arrival order,
//! commit the block atomically, then notify subscribers and the producer
//! schedule. Empty ticks produce nothing.

use crate::{
    error::{ChainError, ChainResult},
    mempool::Mempool,
    params::ChainParams,
    persistence::{BlockCommit, LedgerStore},
    primitives::{Address, Bytes},
    state::{apply_transaction, ApplyContext, StateOverlay},
    types::{Block, Receipt, Transaction},
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::broadcast;

/// Decides who produces each height and tracks how producers fare
pub trait ProducerSchedule: Send + Sync {
    /// Producer for `height`, `None` when no validator is active
    fn producer_for(&self, height: u64) -> Option<Address>;

    /// Called after a block has been committed
    fn block_produced(&self, producer: &Address, block: &Block, fees: u128);

    /// Called when the tick assigned to `producer` was abandoned
    fn production_failed(&self, producer: &Address, height: u64);
}

/// Block update event sent to subscribers
#[derive(Clone, Debug)]
pub struct BlockUpdate {
    pub block: Block,
    pub receipts: Vec<Receipt>,
    /// Fees charged across the block
    pub fees: u128,
    /// Block production time in microseconds
    pub processing_time_us: u64,
}

/// Block producer configuration
#[derive(Clone, Debug)]
pub struct BlockProducerConfig {
    pub params: ChainParams,
    /// Capacity of the block update channel; lagging receivers lose the oldest updates
    pub update_buffer: usize,
    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for BlockProducerConfig {
    fn default() -> Self {
        Self {
            params: ChainParams::default(),
            update_buffer: 64,
            verbose: false,
        }
    }
}

/// Block Producer
///
/// The only writer of blocks, transactions, receipts, events and accounts.
pub struct BlockProducer {
    store: Arc<LedgerStore>,
    mempool: Arc<Mempool>,
    schedule: Arc<dyn ProducerSchedule>,
    /// Block update broadcaster
    update_sender: broadcast::Sender<BlockUpdate>,
    config: BlockProducerConfig,
    /// Running flag
    running: Arc<AtomicBool>,
    /// Held for the duration of a tick; a second concurrent tick is skipped
    tick_guard: Mutex<()>,
}

impl BlockProducer {
    pub fn new(
        store: Arc<LedgerStore>,
        mempool: Arc<Mempool>,
        schedule: Arc<dyn ProducerSchedule>,
        config: BlockProducerConfig,
    ) -> Self {
        let (update_sender, _) = broadcast::channel(config.update_buffer.max(1));

        Self {
            store,
            mempool,
            schedule,
            update_sender,
            config,
            running: Arc::new(AtomicBool::new(false)),
            tick_guard: Mutex::new(()),
        }
    }

    /// Subscribe to block updates
    pub fn subscribe(&self) -> broadcast::Receiver<BlockUpdate> {
        self.update_sender.subscribe()
    }

    /// Check if the block producer is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the block producer after the current tick
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run one production tick.
    ///
    /// Returns `Ok(None)` when the mempool is empty or another tick is in
    /// flight. On a failed commit the drained batch goes back to the front of
    /// the mempool and the error is returned.
    pub fn produce_block(&self) -> ChainResult<Option<BlockUpdate>> {
        let Some(_guard) = self.tick_guard.try_lock() else {
            tracing::debug!("Production tick already in flight, skipping");
            return Ok(None);
        };

        if self.mempool.is_empty() {
            return Ok(None);
        }

        let tick_start = Instant::now();
        let params = &self.config.params;
        let batch = self
            .mempool
            .drain_batch(params.max_txs_per_block, params.block_gas_limit);
        if batch.is_empty() {
            return Ok(None);
        }

        let mut producer = None;
        match self.build_and_commit(&batch, &mut producer) {
            Ok((block, receipts, fees)) => {
                self.mempool.finish_batch(&batch);
                if let Some(producer) = &producer {
                    self.schedule.block_produced(producer, &block, fees);
                }

                let processing_time = tick_start.elapsed();
                let update = BlockUpdate {
                    block,
                    receipts,
                    fees,
                    processing_time_us: processing_time.as_micros() as u64,
                };

                // Broadcast to subscribers (ignore errors if no subscribers)
                let _ = self.update_sender.send(update.clone());

                if self.config.verbose || !update.block.transactions.is_empty() {
                    tracing::info!(
                        "Block {} | {} txs | gas {} | {:.2}ms",
                        update.block.height,
                        update.block.transactions.len(),
                        update.block.gas_used,
                        processing_time.as_secs_f64() * 1000.0
                    );
                }

                if processing_time > params.block_time() {
                    tracing::warn!(
                        "Block {} took {:.2}ms (target: {}s)",
                        update.block.height,
                        processing_time.as_secs_f64() * 1000.0,
                        params.block_time_secs
                    );
                }

                Ok(Some(update))
            }
            Err(e) => {
                let count = batch.len();
                self.mempool.requeue_front(batch);
                if let Some(producer) = &producer {
                    self.schedule.production_failed(producer, self.next_height_hint());
                }
                tracing::error!("Block production abandoned, {} txs requeued: {}", count, e);
                Err(e)
            }
        }
    }

    fn next_height_hint(&self) -> u64 {
        self.store
            .head_height()
            .ok()
            .flatten()
            .map_or(0, |h| h + 1)
    }

    fn build_and_commit(
        &self,
        batch: &[Transaction],
        producer_out: &mut Option<Address>,
    ) -> ChainResult<(Block, Vec<Receipt>, u128)> {
        let params = &self.config.params;
        let parent = self
            .store
            .head()?
            .ok_or_else(|| ChainError::NotFound("genesis block".to_string()))?;
        let height = parent.height + 1;

        let producer = self
            .schedule
            .producer_for(height)
            .ok_or(ChainError::NoActiveValidator(height))?;
        *producer_out = Some(producer);

        let mut state = StateOverlay::new(&self.store);
        let mut receipts = Vec::with_capacity(batch.len());
        let mut transactions = Vec::with_capacity(batch.len());
        let mut events = Vec::new();
        let mut log_index = 0u64;

        for (index, tx) in batch.iter().enumerate() {
            let ctx = ApplyContext {
                block_height: height,
                transaction_index: index as u32,
                first_log_index: log_index,
            };
            let receipt = apply_transaction(&mut state, tx, ctx)?;
            if !receipt.is_success() {
                tracing::debug!(
                    "Transaction {} failed: {}",
                    tx.hash,
                    receipt.error.as_deref().unwrap_or("unknown")
                );
            }
            log_index += receipt.logs.len() as u64;
            events.extend(receipt.logs.iter().cloned());

            let mut included = tx.clone();
            included.block_height = Some(height);
            included.transaction_index = Some(index as u32);
            transactions.push(included);
            receipts.push(receipt);
        }

        let gas_used: u64 = receipts.iter().map(|r| r.gas_used).sum();
        let fees: u128 = receipts.iter().map(|r| r.fee).sum();
        let timestamp = chrono::Utc::now().timestamp().max(parent.timestamp);

        let block = Block::assemble(
            height,
            parent.hash,
            timestamp,
            batch.iter().map(|tx| tx.hash).collect(),
            gas_used,
            params.block_gas_limit,
            producer,
            Bytes::default(),
        );

        self.store.commit_block(BlockCommit {
            block: Some(block.clone()),
            transactions,
            receipts: receipts.clone(),
            events,
            accounts: state.into_dirty(),
        })?;

        Ok((block, receipts, fees))
    }

    /// Run the block producer on the tokio runtime until stopped.
    ///
    /// Ticks never overlap: each tick runs to completion inside this task and
    /// missed ticks are skipped. Returns an error only for failures that make
    /// further production unsafe.
    pub async fn run(&self) -> ChainResult<()> {
        self.running.store(true, Ordering::SeqCst);

        let block_duration = self.config.params.block_time();
        let mut interval = tokio::time::interval(block_duration);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            "Block producer started ({}s blocks, up to {} txs per block)",
            self.config.params.block_time_secs,
            self.config.params.max_txs_per_block
        );

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;

            match self.produce_block() {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!("Fatal storage error, stopping block producer: {}", e);
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
                Err(_) => {}
            }
        }

        tracing::info!("Block producer stopped");
        Ok(())
    }
}
