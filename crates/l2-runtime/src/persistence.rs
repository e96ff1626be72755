//! Ledger Store
//!
//! Uses the sled embedded database as the single durable source of truth for
//! blocks, transactions, receipts, accounts, events and validators. A block and
//! everything it contains is written in one multi-tree transaction and flushed
//! before the call returns, so readers never observe a partial block.

use crate::{
    error::{ChainError, ChainResult},
    primitives::{Address, H256},
    types::{Account, Block, Event, Receipt, Transaction, Validator},
};
use serde::{de::DeserializeOwned, Serialize};
use sled::{
    transaction::{ConflictableTransactionError, TransactionError, TransactionalTree},
    Db, Transactional,
};
use std::path::Path;

const HEAD_KEY: &[u8] = b"head";

/// Everything written when a block is committed
#[derive(Debug, Clone, Default)]
pub struct BlockCommit {
    pub block: Option<Block>,
    pub transactions: Vec<Transaction>,
    pub receipts: Vec<Receipt>,
    pub events: Vec<Event>,
    pub accounts: Vec<(Address, Account)>,
}

impl BlockCommit {
    pub fn new(block: Block) -> Self {
        Self {
            block: Some(block),
            ..Default::default()
        }
    }
}

/// Persistent storage for chain state
pub struct LedgerStore {
    /// Sled database instance
    db: Db,
    /// height (BE) -> block
    blocks: sled::Tree,
    /// block hash -> height (BE)
    block_hashes: sled::Tree,
    /// tx hash -> transaction
    transactions: sled::Tree,
    /// tx hash -> receipt
    receipts: sled::Tree,
    /// address -> account
    accounts: sled::Tree,
    /// height (BE) ++ log index (BE) -> event
    events: sled::Tree,
    /// address ++ height (BE) ++ log index (BE) -> ()
    contract_events: sled::Tree,
    /// address -> validator
    validators: sled::Tree,
    /// chain metadata (head height)
    metadata: sled::Tree,
}

fn encode<T: Serialize>(value: &T) -> ChainResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ChainError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ChainResult<T> {
    bincode::deserialize(bytes).map_err(|e| ChainError::Corruption(e.to_string()))
}

fn decode_height(bytes: &[u8]) -> ChainResult<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ChainError::Corruption("invalid height encoding".to_string()))?;
    Ok(u64::from_be_bytes(arr))
}

fn event_key(height: u64, log_index: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&height.to_be_bytes());
    key[8..].copy_from_slice(&log_index.to_be_bytes());
    key
}

fn contract_event_key(address: &Address, height: u64, log_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(20 + 16);
    key.extend_from_slice(address.as_bytes());
    key.extend_from_slice(&event_key(height, log_index));
    key
}

fn abort(e: ChainError) -> ConflictableTransactionError<ChainError> {
    ConflictableTransactionError::Abort(e)
}

impl LedgerStore {
    /// Open or create a ledger store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> ChainResult<Self> {
        let db = sled::open(&path)?;
        let store = Self::from_db(db)?;
        tracing::info!("Opened ledger store at {:?}", path.as_ref());
        Ok(store)
    }

    fn from_db(db: Db) -> ChainResult<Self> {
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            block_hashes: db.open_tree("block_hashes")?,
            transactions: db.open_tree("transactions")?,
            receipts: db.open_tree("receipts")?,
            accounts: db.open_tree("accounts")?,
            events: db.open_tree("events")?,
            contract_events: db.open_tree("contract_events")?,
            validators: db.open_tree("validators")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    /// True until the genesis block has been written
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    // ============ Blocks ============

    /// Height of the chain head, `None` before genesis
    pub fn head_height(&self) -> ChainResult<Option<u64>> {
        match self.metadata.get(HEAD_KEY)? {
            Some(bytes) => Ok(Some(decode_height(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The chain head block, `None` before genesis
    pub fn head(&self) -> ChainResult<Option<Block>> {
        match self.head_height()? {
            Some(height) => self.get_block(height).map(Some),
            None => Ok(None),
        }
    }

    /// Append a block with no contents
    pub fn put_block(&self, block: &Block) -> ChainResult<()> {
        self.commit_block(BlockCommit::new(block.clone()))
    }

    /// Atomically write a block together with its transactions, receipts,
    /// events and the accounts they touched.
    ///
    /// Fails with `DuplicateHeight` if the height is taken, `ParentMismatch`
    /// if the block does not extend the current head, and
    /// `DuplicateTransaction` if any transaction was already included.
    pub fn commit_block(&self, commit: BlockCommit) -> ChainResult<()> {
        let block = commit
            .block
            .as_ref()
            .ok_or_else(|| ChainError::Codec("commit without a block".to_string()))?;

        let block_bytes = encode(block)?;
        let tx_rows = commit
            .transactions
            .iter()
            .map(|tx| Ok((tx.hash, encode(tx)?)))
            .collect::<ChainResult<Vec<_>>>()?;
        let receipt_rows = commit
            .receipts
            .iter()
            .map(|r| Ok((r.transaction_hash, encode(r)?)))
            .collect::<ChainResult<Vec<_>>>()?;
        let event_rows = commit
            .events
            .iter()
            .map(|e| Ok((e, encode(e)?)))
            .collect::<ChainResult<Vec<_>>>()?;
        let account_rows = commit
            .accounts
            .iter()
            .map(|(addr, acc)| Ok((*addr, encode(acc)?)))
            .collect::<ChainResult<Vec<_>>>()?;

        let height_key = block.height.to_be_bytes();

        let result = (
            &self.blocks,
            &self.block_hashes,
            &self.transactions,
            &self.receipts,
            &self.accounts,
            &self.events,
            &self.contract_events,
            &self.metadata,
        )
            .transaction(
                |(blocks, block_hashes, transactions, receipts, accounts_tree, events_tree, contract_events, metadata)| {
                    check_extends_head(blocks, metadata, block)?;

                    blocks.insert(&height_key[..], block_bytes.as_slice())?;
                    block_hashes.insert(block.hash.as_bytes(), &height_key[..])?;

                    for (hash, bytes) in &tx_rows {
                        // an included transaction is never rewritten
                        if transactions.insert(hash.as_bytes(), bytes.as_slice())?.is_some() {
                            return Err(abort(ChainError::DuplicateTransaction(*hash)));
                        }
                    }
                    for (hash, bytes) in &receipt_rows {
                        if receipts.insert(hash.as_bytes(), bytes.as_slice())?.is_some() {
                            return Err(abort(ChainError::DuplicateTransaction(*hash)));
                        }
                    }
                    for (event, bytes) in &event_rows {
                        let key = event_key(event.block_height, event.log_index);
                        events_tree.insert(&key[..], bytes.as_slice())?;
                        if let Some(address) = &event.address {
                            let index_key = contract_event_key(address, event.block_height, event.log_index);
                            contract_events.insert(index_key, &[] as &[u8])?;
                        }
                    }
                    for (address, bytes) in &account_rows {
                        accounts_tree.insert(address.as_bytes(), bytes.as_slice())?;
                    }

                    metadata.insert(HEAD_KEY, &height_key[..])?;
                    Ok(())
                },
            );

        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(ChainError::StoreIo(e)),
        }

        self.flush()?;
        tracing::debug!(
            "Committed block {} ({} txs, {} events)",
            block.height,
            commit.transactions.len(),
            commit.events.len()
        );
        Ok(())
    }

    /// Get a block by height
    pub fn get_block(&self, height: u64) -> ChainResult<Block> {
        match self.blocks.get(height.to_be_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(ChainError::NotFound(format!("block {}", height))),
        }
    }

    /// Get a block by hash
    pub fn get_block_by_hash(&self, hash: &H256) -> ChainResult<Block> {
        match self.block_hashes.get(hash.as_bytes())? {
            Some(bytes) => self.get_block(decode_height(&bytes)?),
            None => Err(ChainError::NotFound(format!("block {}", hash))),
        }
    }

    // ============ Transactions & receipts ============

    /// Store a transaction as included at `height`
    pub fn put_transaction(&self, tx: &Transaction, height: u64) -> ChainResult<()> {
        let mut tx = tx.clone();
        tx.block_height = Some(height);
        self.transactions.insert(tx.hash.as_bytes(), encode(&tx)?)?;
        self.flush()
    }

    pub fn get_transaction(&self, hash: &H256) -> ChainResult<Transaction> {
        match self.transactions.get(hash.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(ChainError::NotFound(format!("transaction {}", hash))),
        }
    }

    pub fn contains_transaction(&self, hash: &H256) -> ChainResult<bool> {
        Ok(self.transactions.contains_key(hash.as_bytes())?)
    }

    pub fn put_receipt(&self, receipt: &Receipt) -> ChainResult<()> {
        self.receipts
            .insert(receipt.transaction_hash.as_bytes(), encode(receipt)?)?;
        self.flush()
    }

    pub fn get_receipt(&self, tx_hash: &H256) -> ChainResult<Receipt> {
        match self.receipts.get(tx_hash.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(ChainError::NotFound(format!("receipt {}", tx_hash))),
        }
    }

    // ============ Accounts ============

    /// Write an account's balance and nonce, keeping any code/storage
    pub fn upsert_account(&self, address: &Address, balance: u128, nonce: u64) -> ChainResult<()> {
        let mut account = self.get_account(address)?;
        account.balance = balance;
        account.nonce = nonce;
        self.put_account(address, &account)
    }

    pub fn put_account(&self, address: &Address, account: &Account) -> ChainResult<()> {
        self.accounts.insert(address.as_bytes(), encode(account)?)?;
        self.flush()
    }

    /// Get an account; unknown addresses read as the zero account
    pub fn get_account(&self, address: &Address) -> ChainResult<Account> {
        match self.accounts.get(address.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(Account::default()),
        }
    }

    /// All stored accounts
    pub fn accounts(&self) -> ChainResult<Vec<(Address, Account)>> {
        let mut out = Vec::new();
        for entry in self.accounts.iter() {
            let (key, value) = entry?;
            let address = Address::from_slice(&key).map_err(|e| ChainError::Corruption(e.to_string()))?;
            out.push((address, decode(&value)?));
        }
        Ok(out)
    }

    // ============ Events ============

    pub fn append_event(&self, event: &Event) -> ChainResult<()> {
        let key = event_key(event.block_height, event.log_index);
        self.events.insert(&key[..], encode(event)?)?;
        if let Some(address) = &event.address {
            self.contract_events.insert(
                contract_event_key(address, event.block_height, event.log_index),
                &[] as &[u8],
            )?;
        }
        self.flush()
    }

    /// Events in `[from_height, to_height]`, optionally restricted to one contract
    pub fn query_events(
        &self,
        contract: Option<&Address>,
        from_height: u64,
        to_height: u64,
    ) -> ChainResult<Vec<Event>> {
        if from_height > to_height {
            return Ok(Vec::new());
        }

        let start = event_key(from_height, 0);
        let end = event_key(to_height, u64::MAX);

        let mut out = Vec::new();
        match contract {
            Some(address) => {
                let lo = contract_event_key(address, from_height, 0);
                let hi = contract_event_key(address, to_height, u64::MAX);
                for entry in self.contract_events.range(lo..=hi) {
                    let (key, _) = entry?;
                    let event_part = &key[Address::LEN..];
                    if let Some(bytes) = self.events.get(event_part)? {
                        out.push(decode(&bytes)?);
                    }
                }
            }
            None => {
                for entry in self.events.range(start..=end) {
                    let (_, bytes) = entry?;
                    out.push(decode(&bytes)?);
                }
            }
        }
        Ok(out)
    }

    // ============ Validators ============

    /// All validators, in registration order
    pub fn list_validators(&self) -> ChainResult<Vec<Validator>> {
        let mut out = Vec::new();
        for entry in self.validators.iter() {
            let (_, bytes) = entry?;
            out.push(decode::<Validator>(&bytes)?);
        }
        out.sort_by_key(|v| v.registration_index);
        Ok(out)
    }

    pub fn upsert_validator(&self, validator: &Validator) -> ChainResult<()> {
        self.validators
            .insert(validator.address.as_bytes(), encode(validator)?)?;
        self.flush()
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> ChainResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Reject a block that does not directly extend the stored head
fn check_extends_head(
    blocks: &TransactionalTree,
    metadata: &TransactionalTree,
    block: &Block,
) -> Result<(), ConflictableTransactionError<ChainError>> {
    if blocks.get(&block.height.to_be_bytes()[..])?.is_some() {
        return Err(abort(ChainError::DuplicateHeight(block.height)));
    }

    let head_height = match metadata.get(HEAD_KEY)? {
        Some(bytes) => Some(decode_height(&bytes).map_err(abort)?),
        None => None,
    };

    let expected_parent = match head_height {
        None => H256::zero(),
        Some(height) => {
            let bytes = blocks
                .get(&height.to_be_bytes()[..])?
                .ok_or_else(|| abort(ChainError::Corruption(format!("head block {} missing", height))))?;
            let head: Block = decode(&bytes).map_err(abort)?;
            head.hash
        }
    };
    let expected_height = head_height.map_or(0, |h| h + 1);

    if block.parent_hash != expected_parent || block.height != expected_height {
        return Err(abort(ChainError::ParentMismatch {
            height: block.height,
            expected: expected_parent,
            got: block.parent_hash,
        }));
    }
    Ok(())
}
