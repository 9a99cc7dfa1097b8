use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::balances::{BalanceTable, NATIVE_ASSET};
use crate::block::Block;
use crate::contracts::ContractRuntime;
use crate::crypto::{Address, Hash};
use crate::merkle::state_root;
use crate::state::{StateBatch, StateStore};
use crate::transaction::{Transaction, TxType};
use crate::{Result, SynnergyError};

/// Per-account record persisted under `acct:<addr>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Account {
    pub balance: u64,
    pub nonce: u64,
}

/// Penalty bookkeeping persisted under `penalty:<addr>`
///
/// Shared with the authority set; the ledger only consults the suspension
/// flag when moving funds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PenaltyRecord {
    pub points: u64,
    pub suspended: bool,
    pub updated_at: i64,
}

pub fn acct_key(addr: &Address) -> Vec<u8> {
    format!("acct:{}", addr.to_hex()).into_bytes()
}

pub fn stake_key(addr: &Address) -> Vec<u8> {
    format!("stake:{}", addr.to_hex()).into_bytes()
}

pub fn penalty_key(addr: &Address) -> Vec<u8> {
    format!("penalty:{}", addr.to_hex()).into_bytes()
}

/// Zero-padded so lexicographic block-log iteration follows height order
pub fn block_key(height: u64) -> Vec<u8> {
    format!("block:{:020}", height).into_bytes()
}

/// Read-only account facts, the seam the transaction pool depends on
pub trait LedgerView: Send + Sync {
    fn nonce_of(&self, addr: &Address) -> u64;
    fn balance_of(&self, addr: &Address) -> u64;
}

/// Authority membership facts the ledger consults when executing
/// authority-gated transactions
pub trait AuthorityView: Send + Sync {
    fn is_authority(&self, addr: &Address) -> bool;
}

/// Chain mutation seam consumed by the consensus engine
pub trait ChainAppend: Send + Sync {
    /// Execute and atomically commit a sealed block
    fn append_block(&self, block: &Block) -> Result<()>;
    /// Execute transactions on a throwaway stage, returning the state root
    /// and the subset that executed successfully
    fn preview(&self, txs: &[Transaction]) -> Result<(Hash, Vec<Transaction>)>;
    fn last_height(&self) -> Option<u64>;
    fn last_hash(&self) -> Hash;
}

#[derive(Debug, Clone, Copy)]
struct Tip {
    height: u64,
    hash: Hash,
}

/// The ledger: block log, account records and gas accounting
///
/// All state mutation flows through the within-block staging scope; a block
/// either commits in full (state writes plus the block record, one atomic
/// batch) or leaves the store untouched. Fatal storage conditions latch the
/// ledger read-only and are surfaced on the recovery channel.
pub struct Ledger {
    store: Arc<StateStore>,
    write_gate: Mutex<()>,
    tip: RwLock<Option<Tip>>,
    tx_index: RwLock<HashMap<Hash, u64>>,
    runtime: ContractRuntime,
    /// Committed native-asset balances, reconciled on every commit;
    /// `balance_of` serves from here and falls through to the store on a
    /// miss
    balances: BalanceTable,
    authorities: Arc<dyn AuthorityView>,
    fee_sink: Address,
    fatal_tx: Sender<String>,
    fatal_rx: Receiver<String>,
}

impl Ledger {
    /// Open a ledger over a store, rebuilding the tip, transaction index
    /// and balance table from the persisted records
    pub fn new(
        store: Arc<StateStore>,
        fee_sink: Address,
        authorities: Arc<dyn AuthorityView>,
    ) -> Result<Self> {
        let (fatal_tx, fatal_rx) = unbounded();
        let ledger = Ledger {
            store,
            write_gate: Mutex::new(()),
            tip: RwLock::new(None),
            tx_index: RwLock::new(HashMap::new()),
            runtime: ContractRuntime::new(),
            balances: BalanceTable::new(),
            authorities,
            fee_sink,
            fatal_tx,
            fatal_rx,
        };
        ledger.rebuild_index()?;
        Ok(ledger)
    }

    fn rebuild_index(&self) -> Result<()> {
        let mut tip = None;
        let mut index = HashMap::new();
        for entry in self.store.prefix_iter(b"block:") {
            let (_, bytes) = entry.map_err(|e| {
                SynnergyError::IteratorInterrupted(e.to_string())
            })?;
            let block: Block = serde_json::from_slice(&bytes)
                .map_err(|e| self.fatal(format!("undecodable block record: {}", e)))?;
            for tx in &block.transactions {
                index.insert(tx.hash, block.header.height);
            }
            tip = Some(Tip {
                height: block.header.height,
                hash: block.hash(),
            });
        }
        if let Some(t) = tip {
            info!("ledger resumed at height {}", t.height);
        }
        *self.tip.write() = tip;
        *self.tx_index.write() = index;

        // warm the balance table from the committed account records
        let warm: Vec<(Vec<u8>, Vec<u8>)> = self
            .store
            .prefix_iter(b"acct:")
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SynnergyError::IteratorInterrupted(e.to_string()))?;
        self.reconcile_balances(&warm);
        Ok(())
    }

    /// Mirror written account records into the balance table
    fn reconcile_balances(&self, entries: &[(Vec<u8>, Vec<u8>)]) {
        for (key, value) in entries {
            if !key.starts_with(b"acct:") {
                continue;
            }
            let addr = match std::str::from_utf8(&key[5..])
                .ok()
                .and_then(|h| Address::from_hex(h).ok())
            {
                Some(a) => a,
                None => continue,
            };
            let balance = serde_json::from_slice::<Account>(value)
                .map(|a| a.balance)
                .unwrap_or(0);
            self.balances.set(NATIVE_ASSET, &addr, balance);
        }
    }

    /// Commit a staged scope, keeping the balance table reconciled with
    /// the account records it wrote
    pub fn commit_stage(&self, batch: StateBatch<'_>) -> Result<()> {
        let changed = batch.changed_entries();
        match self.store.commit(batch) {
            Ok(()) => {}
            Err(crate::state::StateError::Corruption(msg)) => return Err(self.fatal(msg)),
            Err(e) => return Err(e.into()),
        }
        self.reconcile_balances(&changed);
        Ok(())
    }

    /// Surface a fatal condition: latch the store and notify supervisors
    fn fatal(&self, msg: String) -> SynnergyError {
        self.store.mark_read_only();
        let _ = self.fatal_tx.send(msg.clone());
        SynnergyError::Corruption(msg)
    }

    /// Channel carrying fatal conditions; supervisors snapshot and restart
    pub fn recovery_watch(&self) -> Receiver<String> {
        self.fatal_rx.clone()
    }

    /// The fee sink account configured at genesis
    pub fn fee_sink(&self) -> Address {
        self.fee_sink
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Seed the chain with a genesis block carrying the initial allocation
    pub fn init_genesis(&self, alloc: &[(Address, u64)]) -> Result<Block> {
        if self.tip.read().is_some() {
            return Err(SynnergyError::DuplicateHeight(0));
        }
        let _gate = self.write_gate.lock();
        let mut batch = self.store.stage();
        for (addr, balance) in alloc {
            let account = Account {
                balance: *balance,
                nonce: 0,
            };
            batch
                .put_record(acct_key(addr), &account)
                .map_err(SynnergyError::from)?;
        }
        let root = state_root(&batch.changed_entries());
        let mut block =
            Block::new(0, Hash::zero(), root, Address::zero(), 0, Vec::new(), Vec::new());
        // genesis is time-independent: every node with the same allocation
        // derives the same block hash
        block.header.timestamp = 0;
        batch
            .put_record(block_key(0), &block)
            .map_err(SynnergyError::from)?;
        self.commit_stage(batch)?;
        *self.tip.write() = Some(Tip {
            height: 0,
            hash: block.hash(),
        });
        info!("genesis committed with {} allocations", alloc.len());
        Ok(block)
    }

    pub fn block_at(&self, height: u64) -> Result<Option<Block>> {
        Ok(self
            .store
            .get_record::<Block>(&block_key(height))
            .map_err(SynnergyError::from)?)
    }

    /// Locate a committed transaction by hash
    pub fn transaction_by_hash(&self, hash: &Hash) -> Result<Option<Transaction>> {
        let height = match self.tx_index.read().get(hash) {
            Some(h) => *h,
            None => return Ok(None),
        };
        let block = self.block_at(height)?.ok_or_else(|| {
            SynnergyError::NotFound(format!("indexed block {} missing", height))
        })?;
        Ok(block.transactions.into_iter().find(|tx| tx.hash == *hash))
    }

    fn account(batch: &StateBatch<'_>, addr: &Address) -> Result<Account> {
        Ok(batch
            .get_record::<Account>(&acct_key(addr))
            .map_err(SynnergyError::from)?
            .unwrap_or_default())
    }

    fn put_account(batch: &mut StateBatch<'_>, addr: &Address, account: &Account) -> Result<()> {
        batch
            .put_record(acct_key(addr), account)
            .map_err(SynnergyError::from)
    }

    fn is_suspended(batch: &StateBatch<'_>, addr: &Address) -> Result<bool> {
        Ok(batch
            .get_record::<PenaltyRecord>(&penalty_key(addr))
            .map_err(SynnergyError::from)?
            .map(|p| p.suspended)
            .unwrap_or(false))
    }

    /// Debit `from` and credit `to` inside a block stage
    ///
    /// Fails on insufficient balance or when either account is suspended by
    /// an active penalty; the caller's stage absorbs or discards the writes.
    pub fn transfer(
        &self,
        batch: &mut StateBatch<'_>,
        from: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<()> {
        Self::transfer_in(batch, from, to, amount)
    }

    /// Burn gas from `from` to the fee sink inside a block stage
    pub fn deduct_gas(&self, batch: &mut StateBatch<'_>, from: &Address, gas: u64) -> Result<()> {
        self.deduct_gas_in(batch, from, gas)
    }

    /// Move native value between accounts inside the current stage
    fn transfer_in(
        batch: &mut StateBatch<'_>,
        from: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<()> {
        if Self::is_suspended(batch, from)? {
            return Err(SynnergyError::AccountSuspended(from.to_hex()));
        }
        if Self::is_suspended(batch, to)? {
            return Err(SynnergyError::AccountSuspended(to.to_hex()));
        }
        let mut sender = Self::account(batch, from)?;
        if sender.balance < amount {
            return Err(SynnergyError::InsufficientBalance {
                address: from.to_hex(),
                balance: sender.balance,
                required: amount,
            });
        }
        sender.balance -= amount;
        Self::put_account(batch, from, &sender)?;
        let mut receiver = Self::account(batch, to)?;
        receiver.balance = receiver.balance.saturating_add(amount);
        Self::put_account(batch, to, &receiver)
    }

    /// Burn gas to the fee sink inside the current stage
    fn deduct_gas_in(&self, batch: &mut StateBatch<'_>, from: &Address, gas: u64) -> Result<()> {
        let mut sender = Self::account(batch, from)?;
        if sender.balance < gas {
            return Err(SynnergyError::InsufficientBalance {
                address: from.to_hex(),
                balance: sender.balance,
                required: gas,
            });
        }
        sender.balance -= gas;
        Self::put_account(batch, from, &sender)?;
        let mut sink = Self::account(batch, &self.fee_sink)?;
        sink.balance = sink.balance.saturating_add(gas);
        Self::put_account(batch, &self.fee_sink, &sink)
    }

    /// Execute one transaction inside the stage
    ///
    /// The debit, credit, fee and nonce bump are one atomic unit: any
    /// failure unwinds by simply not merging the temporary writes.
    fn apply_tx(&self, batch: &mut StateBatch<'_>, tx: &Transaction) -> Result<()> {
        tx.verify()?;
        let sender = Self::account(batch, &tx.from)?;
        if tx.nonce != sender.nonce {
            return Err(SynnergyError::NonceMismatch {
                expected: sender.nonce,
                found: tx.nonce,
            });
        }
        let fee = tx.fee();
        if sender.balance < tx.total_cost() {
            return Err(SynnergyError::InsufficientBalance {
                address: tx.from.to_hex(),
                balance: sender.balance,
                required: tx.total_cost(),
            });
        }

        match tx.tx_type {
            TxType::Payment => {
                self.deduct_gas_in(batch, &tx.from, fee)?;
                Self::transfer_in(batch, &tx.from, &tx.to, tx.value)?;
            }
            TxType::ContractCall => {
                self.deduct_gas_in(batch, &tx.from, fee)?;
                if tx.to.is_zero() {
                    self.runtime.deploy(batch, &tx.from, &tx.payload)?;
                } else {
                    if tx.value > 0 {
                        Self::transfer_in(batch, &tx.from, &tx.to, tx.value)?;
                    }
                    let receipt =
                        self.runtime
                            .invoke(batch, &tx.from, &tx.to, &tx.payload, tx.gas_limit)?;
                    debug!(
                        "contract {} used {} gas, status {:?}",
                        tx.to,
                        receipt.gas_used,
                        receipt.status
                    );
                }
            }
            TxType::Reversal => {
                let mut signers = std::collections::HashSet::new();
                for sig in &tx.auth_sigs {
                    if !sig.verify(tx.hash.as_bytes())? {
                        return Err(SynnergyError::InvalidSignature(
                            "reversal co-signature does not verify".to_string(),
                        ));
                    }
                    signers.insert(sig.signer()?);
                }
                let active = signers
                    .iter()
                    .filter(|s| self.authorities.is_authority(s))
                    .count();
                if active < crate::REVERSAL_AUTHORITY_QUORUM {
                    return Err(SynnergyError::ValidationFailed(format!(
                        "reversal carries {} distinct active-authority signatures, need {}",
                        active,
                        crate::REVERSAL_AUTHORITY_QUORUM
                    )));
                }
                let original_hash = tx.original_tx.ok_or_else(|| {
                    SynnergyError::MalformedPayload("reversal without original".to_string())
                })?;
                let original = self.transaction_by_hash(&original_hash)?.ok_or_else(|| {
                    SynnergyError::NotFound(format!(
                        "original transaction {} not committed",
                        original_hash.short()
                    ))
                })?;
                self.deduct_gas_in(batch, &tx.from, fee)?;
                // credit the debited party, debit the credited party
                Self::transfer_in(batch, &original.to, &original.from, original.value)?;
            }
        }

        let mut sender = Self::account(batch, &tx.from)?;
        sender.nonce += 1;
        Self::put_account(batch, &tx.from, &sender)
    }

    fn expected_link(&self) -> (u64, Hash) {
        match *self.tip.read() {
            Some(t) => (t.height + 1, t.hash),
            None => (0, Hash::zero()),
        }
    }

    fn check_link(&self, block: &Block) -> Result<()> {
        let (height, parent) = self.expected_link();
        if block.header.height < height {
            return Err(SynnergyError::DuplicateHeight(block.header.height));
        }
        if block.header.height > height {
            return Err(SynnergyError::ValidationFailed(format!(
                "non-monotonic height: expected {}, found {}",
                height, block.header.height
            )));
        }
        if block.header.parent_hash != parent {
            return Err(SynnergyError::ParentMismatch {
                expected: parent.to_hex(),
                found: block.header.parent_hash.to_hex(),
            });
        }
        Ok(())
    }
}

impl LedgerView for Ledger {
    fn nonce_of(&self, addr: &Address) -> u64 {
        self.store
            .get_record::<Account>(&acct_key(addr))
            .ok()
            .flatten()
            .map(|a| a.nonce)
            .unwrap_or(0)
    }

    fn balance_of(&self, addr: &Address) -> u64 {
        let cached = self.balances.get(NATIVE_ASSET, addr);
        if cached > 0 {
            return cached;
        }
        // miss (or zero) falls through to the committed record
        let stored = self
            .store
            .get_record::<Account>(&acct_key(addr))
            .ok()
            .flatten()
            .map(|a| a.balance)
            .unwrap_or(0);
        if stored > 0 {
            self.balances.set(NATIVE_ASSET, addr, stored);
        }
        stored
    }
}

impl ChainAppend for Ledger {
    fn append_block(&self, block: &Block) -> Result<()> {
        if self.store.is_read_only() {
            return Err(SynnergyError::RecoveryRequired);
        }
        let _gate = self.write_gate.lock();
        block.validate()?;
        self.check_link(block)?;

        let mut batch = self.store.stage();
        for tx in &block.transactions {
            self.apply_tx(&mut batch, tx)?;
        }
        let computed = state_root(&batch.changed_entries());
        if computed != block.header.state_root {
            return Err(SynnergyError::RootMismatch {
                expected: block.header.state_root.to_hex(),
                found: computed.to_hex(),
            });
        }

        batch
            .put_record(block_key(block.header.height), block)
            .map_err(SynnergyError::from)?;
        self.commit_stage(batch)?;

        *self.tip.write() = Some(Tip {
            height: block.header.height,
            hash: block.hash(),
        });
        let mut index = self.tx_index.write();
        for tx in &block.transactions {
            index.insert(tx.hash, block.header.height);
        }
        info!(
            "appended block {} ({} txs, root {})",
            block.header.height,
            block.transactions.len(),
            block.header.state_root.short()
        );
        Ok(())
    }

    fn preview(&self, txs: &[Transaction]) -> Result<(Hash, Vec<Transaction>)> {
        if self.store.is_read_only() {
            return Err(SynnergyError::RecoveryRequired);
        }
        let _gate = self.write_gate.lock();
        let mut batch = self.store.stage();
        let mut included = Vec::with_capacity(txs.len());
        for tx in txs {
            // stage a trial application; a failed transaction is dropped
            // from the proposal rather than aborting the block
            let mut trial = batch.fork();
            match self.apply_tx(&mut trial, tx) {
                Ok(()) => {
                    batch = trial;
                    included.push(tx.clone());
                }
                Err(e) => {
                    warn!("excluding {} from proposal: {}", tx.hash.short(), e);
                }
            }
        }
        let root = state_root(&batch.changed_entries());
        Ok((root, included))
    }

    fn last_height(&self) -> Option<u64> {
        self.tip.read().map(|t| t.height)
    }

    fn last_hash(&self) -> Hash {
        self.tip.read().map(|t| t.hash).unwrap_or_else(Hash::zero)
    }
}
