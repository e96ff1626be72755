//! Transaction admission
//!
//! Validates raw signed transactions against the committed ledger state and
//! queues them in arrival order for the block producer. The queue is drained,
//! not peeked: a drained batch either lands in a block or is put back at the
//! front of the queue. Until then it stays visible as in flight, so it can
//! be neither admitted again nor lost from pending lookups.

use crate::{
    error::{ChainError, ChainResult},
    params::{intrinsic_gas, ChainParams},
    persistence::LedgerStore,
    primitives::{Address, H256},
    transaction::decode_raw,
    types::Transaction,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

#[derive(Default)]
struct Queue {
    order: VecDeque<H256>,
    txs: HashMap<H256, Transaction>,
    /// Drained by a production tick, not yet committed or requeued
    in_flight: Vec<Transaction>,
}

impl Queue {
    fn knows(&self, hash: &H256) -> bool {
        self.txs.contains_key(hash) || self.in_flight.iter().any(|tx| &tx.hash == hash)
    }

    /// Queued and in-flight transactions of `sender`, oldest first
    fn from_sender<'a>(&'a self, sender: &'a Address) -> impl Iterator<Item = &'a Transaction> + 'a {
        self.in_flight
            .iter()
            .chain(self.order.iter().filter_map(move |h| self.txs.get(h)))
            .filter(move |tx| &tx.from == sender)
    }

    /// Next nonce `sender` may use given its committed nonce
    fn next_nonce(&self, sender: &Address, committed: u64) -> u64 {
        self.from_sender(sender)
            .map(|tx| tx.nonce)
            .filter(|n| *n >= committed)
            .max()
            .map_or(committed, |n| n + 1)
    }
}

/// Ordered queue of admitted, not yet included transactions
pub struct Mempool {
    store: Arc<LedgerStore>,
    params: ChainParams,
    queue: Mutex<Queue>,
}

impl Mempool {
    pub fn new(store: Arc<LedgerStore>, params: ChainParams) -> Self {
        Self {
            store,
            params,
            queue: Mutex::new(Queue::default()),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Validate and enqueue a raw transaction, returning its hash.
    ///
    /// Returns as soon as the transaction is queued; inclusion happens on a
    /// later production tick.
    pub fn submit(&self, raw: &str) -> ChainResult<H256> {
        let decoded = decode_raw(raw, self.params.chain_id)?;
        let tx = decoded.tx;

        if self.contains(&tx.hash) || self.store.contains_transaction(&tx.hash)? {
            return Err(ChainError::DuplicateTransaction(tx.hash));
        }

        if tx.gas_limit > self.params.block_gas_limit {
            return Err(ChainError::GasLimitExceeded {
                gas_limit: tx.gas_limit,
                max: self.params.block_gas_limit,
            });
        }
        let required = intrinsic_gas(&tx.data.0);
        if tx.gas_limit < required {
            return Err(ChainError::IntrinsicGasTooLow {
                gas_limit: tx.gas_limit,
                required,
            });
        }
        if tx.gas_price < self.params.min_gas_price {
            return Err(ChainError::GasPriceTooLow {
                gas_price: tx.gas_price,
                min: self.params.min_gas_price,
            });
        }

        let account = self.store.get_account(&tx.from)?;
        let max_cost = tx.max_cost().ok_or(ChainError::InsufficientBalance {
            required: u128::MAX,
            available: account.balance,
        })?;
        if account.balance < max_cost {
            return Err(ChainError::InsufficientBalance {
                required: max_cost,
                available: account.balance,
            });
        }
        if tx.nonce < account.nonce {
            return Err(ChainError::NonceTooLow {
                expected: account.nonce,
                got: tx.nonce,
            });
        }

        decoded.signed.verify(self.params.signature_mode)?;

        let hash = tx.hash;
        {
            let mut queue = self.queue.lock();
            // re-check under the lock so concurrent submits of one payload admit it once
            if queue.knows(&hash) {
                return Err(ChainError::DuplicateTransaction(hash));
            }
            let expected = queue.next_nonce(&tx.from, account.nonce);
            if tx.nonce > expected {
                return Err(ChainError::NonceGap {
                    expected,
                    got: tx.nonce,
                });
            }
            queue.order.push_back(hash);
            queue.txs.insert(hash, tx);
        }

        tracing::debug!("Admitted transaction {}", hash);
        Ok(hash)
    }

    /// Take up to `max_count` transactions in arrival order, stopping before
    /// the summed gas limits would exceed `gas_budget`.
    ///
    /// The batch stays in flight until `finish_batch` or `requeue_front`.
    pub fn drain_batch(&self, max_count: usize, gas_budget: u64) -> Vec<Transaction> {
        let mut queue = self.queue.lock();
        let mut batch = Vec::new();
        let mut gas = 0u64;

        while batch.len() < max_count {
            let Some(hash) = queue.order.front().copied() else {
                break;
            };
            let Some(gas_limit) = queue.txs.get(&hash).map(|tx| tx.gas_limit) else {
                queue.order.pop_front();
                continue;
            };
            if gas.saturating_add(gas_limit) > gas_budget {
                break;
            }
            gas += gas_limit;
            queue.order.pop_front();
            if let Some(tx) = queue.txs.remove(&hash) {
                batch.push(tx);
            }
        }
        queue.in_flight.extend(batch.iter().cloned());
        batch
    }

    /// Forget a batch once its block is committed
    pub fn finish_batch(&self, batch: &[Transaction]) {
        let mut queue = self.queue.lock();
        queue
            .in_flight
            .retain(|tx| !batch.iter().any(|done| done.hash == tx.hash));
    }

    /// Put an abandoned batch back ahead of everything queued since
    pub fn requeue_front(&self, batch: Vec<Transaction>) {
        let mut queue = self.queue.lock();
        queue
            .in_flight
            .retain(|tx| !batch.iter().any(|back| back.hash == tx.hash));
        for tx in batch.into_iter().rev() {
            if queue.txs.contains_key(&tx.hash) {
                continue;
            }
            queue.order.push_front(tx.hash);
            queue.txs.insert(tx.hash, tx);
        }
    }

    /// Queued or in flight
    pub fn contains(&self, hash: &H256) -> bool {
        self.queue.lock().knows(hash)
    }

    /// A not yet committed transaction by hash
    pub fn pending(&self, hash: &H256) -> Option<Transaction> {
        let queue = self.queue.lock();
        queue
            .txs
            .get(hash)
            .or_else(|| queue.in_flight.iter().find(|tx| &tx.hash == hash))
            .cloned()
    }

    /// Not yet committed transactions from one sender, in arrival order
    pub fn pending_for(&self, sender: &Address) -> Vec<Transaction> {
        self.queue.lock().from_sender(sender).cloned().collect()
    }

    /// Nonce the next transaction from `sender` must carry, counting
    /// everything admitted but not yet committed
    pub fn next_nonce(&self, sender: &Address) -> ChainResult<u64> {
        let committed = self.store.get_account(sender)?.nonce;
        Ok(self.queue.lock().next_nonce(sender, committed))
    }

    /// Number of queued transactions, excluding any batch in flight
    pub fn len(&self) -> usize {
        self.queue.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        params::SignatureMode,
        primitives::Bytes,
        transaction::{SignedTransaction, TransactionBody},
    };
    use ed25519_dalek::SigningKey;
    use tempfile::tempdir;

    fn params() -> ChainParams {
        ChainParams {
            chain_id: 26,
            min_gas_price: 10,
            block_gas_limit: 1_000_000,
            ..Default::default()
        }
    }

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn sender() -> Address {
        Address::from_public_key(&key().verifying_key().to_bytes())
    }

    fn body(nonce: u64) -> TransactionBody {
        TransactionBody {
            chain_id: 26,
            nonce,
            gas_price: 10,
            gas_limit: 21_000,
            to: Some(Address([3u8; 20])),
            value: 100,
            data: Bytes::default(),
        }
    }

    fn raw(body: TransactionBody) -> String {
        SignedTransaction::sign(body, &key()).encode()
    }

    fn mempool(balance: u128) -> (tempfile::TempDir, Mempool) {
        let dir = tempdir().unwrap();
        let store = Arc::new(LedgerStore::open(dir.path()).unwrap());
        store.upsert_account(&sender(), balance, 0).unwrap();
        (dir, Mempool::new(store, params()))
    }

    #[test]
    fn test_submit_returns_hash_and_queues() {
        let (_dir, pool) = mempool(10_000_000);
        let hash = pool.submit(&raw(body(0))).unwrap();
        assert!(pool.contains(&hash));
        assert_eq!(pool.pending(&hash).unwrap().block_height, None);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_duplicate_submission() {
        let (_dir, pool) = mempool(10_000_000);
        let tx = raw(body(0));
        let hash = pool.submit(&tx).unwrap();
        assert!(matches!(pool.submit(&tx), Err(ChainError::DuplicateTransaction(h)) if h == hash));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_rejections() {
        let (_dir, pool) = mempool(1_000_000);

        assert!(matches!(pool.submit("0x00"), Err(ChainError::MalformedTransaction(_))));

        let mut b = body(0);
        b.gas_limit = 2_000_000;
        assert!(matches!(pool.submit(&raw(b)), Err(ChainError::GasLimitExceeded { .. })));

        let mut b = body(0);
        b.gas_limit = 20_000;
        assert!(matches!(pool.submit(&raw(b)), Err(ChainError::IntrinsicGasTooLow { .. })));

        let mut b = body(0);
        b.gas_price = 9;
        assert!(matches!(pool.submit(&raw(b)), Err(ChainError::GasPriceTooLow { .. })));

        let mut b = body(0);
        b.value = 1_000_000;
        assert!(matches!(pool.submit(&raw(b)), Err(ChainError::InsufficientBalance { .. })));

        let mut signed = SignedTransaction::sign(body(0), &key());
        signed.body.value = 1;
        assert!(matches!(pool.submit(&signed.encode()), Err(ChainError::InvalidSignature)));

        assert!(pool.is_empty());
    }

    #[test]
    fn test_nonce_too_low() {
        let (_dir, pool) = mempool(10_000_000);
        pool.store.upsert_account(&sender(), 10_000_000, 2).unwrap();
        assert!(matches!(
            pool.submit(&raw(body(1))),
            Err(ChainError::NonceTooLow { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_nonce_gap_rejected() {
        let (_dir, pool) = mempool(10_000_000);
        assert!(matches!(
            pool.submit(&raw(body(1))),
            Err(ChainError::NonceGap { expected: 0, got: 1 })
        ));
        assert!(pool.is_empty());

        pool.submit(&raw(body(0))).unwrap();
        pool.submit(&raw(body(1))).unwrap();
        assert_eq!(pool.next_nonce(&sender()).unwrap(), 2);
        assert!(matches!(
            pool.submit(&raw(body(3))),
            Err(ChainError::NonceGap { expected: 2, got: 3 })
        ));

        // the rejected payload is admissible once the gap closes
        pool.submit(&raw(body(2))).unwrap();
        pool.submit(&raw(body(3))).unwrap();
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_in_flight_batch_blocks_resubmission() {
        let (_dir, pool) = mempool(10_000_000);
        let tx = raw(body(0));
        let hash = pool.submit(&tx).unwrap();

        let batch = pool.drain_batch(10, u64::MAX);
        assert!(pool.is_empty());
        assert!(pool.contains(&hash));
        assert!(pool.pending(&hash).is_some());
        assert_eq!(pool.pending_for(&sender()).len(), 1);
        assert!(matches!(pool.submit(&tx), Err(ChainError::DuplicateTransaction(h)) if h == hash));
        // the next nonce follows the in-flight one
        pool.submit(&raw(body(1))).unwrap();

        pool.finish_batch(&batch);
        assert!(!pool.contains(&hash));
        assert!(pool.pending(&hash).is_none());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_structural_mode_skips_signature_check() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LedgerStore::open(dir.path()).unwrap());
        store.upsert_account(&sender(), 10_000_000, 0).unwrap();
        let pool = Mempool::new(
            store,
            ChainParams {
                signature_mode: SignatureMode::Structural,
                ..params()
            },
        );
        let mut signed = SignedTransaction::sign(body(0), &key());
        signed.signature = [0u8; 64];
        pool.submit(&signed.encode()).unwrap();
    }

    #[test]
    fn test_drain_in_arrival_order_and_requeue() {
        let (_dir, pool) = mempool(10_000_000);
        let hashes: Vec<_> = (0..5).map(|n| pool.submit(&raw(body(n))).unwrap()).collect();

        let batch = pool.drain_batch(3, u64::MAX);
        assert_eq!(batch.iter().map(|t| t.hash).collect::<Vec<_>>(), hashes[..3]);
        assert_eq!(pool.len(), 2);

        pool.requeue_front(batch);
        assert_eq!(pool.pending_for(&sender()).len(), 5);
        let all = pool.drain_batch(100, u64::MAX);
        assert_eq!(all.iter().map(|t| t.hash).collect::<Vec<_>>(), hashes);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_drain_respects_gas_budget() {
        let (_dir, pool) = mempool(10_000_000);
        for n in 0..4 {
            pool.submit(&raw(body(n))).unwrap();
        }
        let batch = pool.drain_batch(100, 50_000);
        assert_eq!(batch.len(), 2);
        assert_eq!(pool.len(), 2);
        // two in flight, two queued
        assert_eq!(pool.pending_for(&sender()).len(), 4);
    }
}
