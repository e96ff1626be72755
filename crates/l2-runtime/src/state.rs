//! Account State
//!
//! Applies transactions to account balances and nonces on top of a
//! block-scoped overlay of the ledger. Transactions inside one block see each
//! other's effects through the overlay; the dirty accounts are handed to the
//! ledger in the same atomic commit as the block.

use crate::{
    error::{ChainError, ChainResult},
    params::intrinsic_gas,
    persistence::LedgerStore,
    primitives::{Address, Bytes},
    types::{Account, Event, Receipt, Transaction, TxStatus},
};
use std::collections::{BTreeSet, HashMap};

pub const TRANSFER_EVENT: &str = "Transfer";
pub const CONTRACT_EXECUTION_EVENT: &str = "ContractExecution";

/// Cached view of accounts for one block
pub struct StateOverlay<'a> {
    store: &'a LedgerStore,
    accounts: HashMap<Address, Account>,
    dirty: BTreeSet<Address>,
}

impl<'a> StateOverlay<'a> {
    pub fn new(store: &'a LedgerStore) -> Self {
        Self {
            store,
            accounts: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Current account state, loading from the ledger on first access
    pub fn account(&mut self, address: &Address) -> ChainResult<Account> {
        if let Some(account) = self.accounts.get(address) {
            return Ok(account.clone());
        }
        let account = self.store.get_account(address)?;
        self.accounts.insert(*address, account.clone());
        Ok(account)
    }

    fn set(&mut self, address: Address, account: Account) {
        self.accounts.insert(address, account);
        self.dirty.insert(address);
    }

    fn debit(&mut self, address: &Address, amount: u128) -> ChainResult<()> {
        let mut account = self.account(address)?;
        account.balance = account
            .balance
            .checked_sub(amount)
            .ok_or(ChainError::InsufficientBalance {
                required: amount,
                available: account.balance,
            })?;
        self.set(*address, account);
        Ok(())
    }

    fn credit(&mut self, address: &Address, amount: u128) -> ChainResult<()> {
        let mut account = self.account(address)?;
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| ChainError::Codec(format!("balance overflow for {}", address)))?;
        self.set(*address, account);
        Ok(())
    }

    /// Accounts modified since the overlay was created
    pub fn into_dirty(self) -> Vec<(Address, Account)> {
        let Self { accounts, dirty, .. } = self;
        dirty
            .into_iter()
            .filter_map(|addr| accounts.get(&addr).map(|acc| (addr, acc.clone())))
            .collect()
    }
}

/// Position of a transaction within the block being built
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext {
    pub block_height: u64,
    pub transaction_index: u32,
    /// Log index assigned to the first event this transaction emits
    pub first_log_index: u64,
}

/// Apply one transaction and produce its receipt.
///
/// Balance and nonce violations yield a failure receipt and leave the overlay
/// untouched. Running out of gas charges the full gas limit and consumes the
/// nonce. Only storage errors are returned as `Err`.
pub fn apply_transaction(
    state: &mut StateOverlay<'_>,
    tx: &Transaction,
    ctx: ApplyContext,
) -> ChainResult<Receipt> {
    let sender = state.account(&tx.from)?;

    let failure = |error: ChainError, gas_used: u64| Receipt {
        transaction_hash: tx.hash,
        block_height: ctx.block_height,
        transaction_index: ctx.transaction_index,
        from: tx.from,
        to: tx.to,
        contract_address: None,
        gas_used,
        fee: gas_used as u128 * tx.gas_price,
        status: TxStatus::Failure,
        error: Some(error.to_string()),
        logs: Vec::new(),
    };

    let max_cost = match tx.max_cost() {
        Some(cost) => cost,
        None => {
            return Ok(failure(
                ChainError::InsufficientBalance {
                    required: u128::MAX,
                    available: sender.balance,
                },
                0,
            ))
        }
    };
    if sender.balance < max_cost {
        return Ok(failure(
            ChainError::InsufficientBalance {
                required: max_cost,
                available: sender.balance,
            },
            0,
        ));
    }
    if tx.nonce < sender.nonce {
        return Ok(failure(
            ChainError::NonceTooLow {
                expected: sender.nonce,
                got: tx.nonce,
            },
            0,
        ));
    }
    if tx.nonce > sender.nonce {
        return Ok(failure(
            ChainError::NonceGap {
                expected: sender.nonce,
                got: tx.nonce,
            },
            0,
        ));
    }

    let required_gas = intrinsic_gas(&tx.data.0);
    if tx.gas_limit < required_gas {
        let fee = tx.gas_limit as u128 * tx.gas_price;
        let mut account = sender;
        account.balance -= fee;
        account.nonce += 1;
        state.set(tx.from, account);
        return Ok(failure(
            ChainError::IntrinsicGasTooLow {
                gas_limit: tx.gas_limit,
                required: required_gas,
            },
            tx.gas_limit,
        ));
    }

    let fee = required_gas as u128 * tx.gas_price;

    // Recipient, creating the contract account when there is none
    let (recipient, contract_address) = match tx.to {
        Some(to) => (to, None),
        None => {
            let created = Address::contract_address(&tx.from, tx.nonce);
            (created, Some(created))
        }
    };

    state.debit(&tx.from, tx.value + fee)?;
    state.credit(&recipient, tx.value)?;

    if contract_address.is_some() {
        let mut contract = state.account(&recipient)?;
        contract.code = Some(tx.data.clone());
        state.set(recipient, contract);
    }

    let mut account = state.account(&tx.from)?;
    account.nonce += 1;
    state.set(tx.from, account);

    let mut logs = Vec::new();
    let mut log_index = ctx.first_log_index;

    if !tx.data.is_empty() && tx.to.is_some() {
        logs.push(Event {
            block_height: ctx.block_height,
            transaction_hash: tx.hash,
            address: Some(recipient),
            name: CONTRACT_EXECUTION_EVENT.to_string(),
            data: tx.data.clone(),
            topics: vec![Event::signature(CONTRACT_EXECUTION_EVENT), tx.from.to_topic()],
            log_index,
        });
        log_index += 1;
    }

    logs.push(Event {
        block_height: ctx.block_height,
        transaction_hash: tx.hash,
        address: contract_address,
        name: TRANSFER_EVENT.to_string(),
        data: Bytes(tx.value.to_be_bytes().to_vec()),
        topics: vec![
            Event::signature(TRANSFER_EVENT),
            tx.from.to_topic(),
            recipient.to_topic(),
        ],
        log_index,
    });

    Ok(Receipt {
        transaction_hash: tx.hash,
        block_height: ctx.block_height,
        transaction_index: ctx.transaction_index,
        from: tx.from,
        to: tx.to,
        contract_address,
        gas_used: required_gas,
        fee,
        status: TxStatus::Success,
        error: None,
        logs,
    })
}
