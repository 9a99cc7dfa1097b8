use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::crypto::Address;
use crate::{Result, SynnergyError};

/// Asset identifier; the native coin is asset 0
pub type AssetId = u32;

/// Asset id of the native Synnergy coin
pub const NATIVE_ASSET: AssetId = 0;

/// Registry boundary for every non-native asset
///
/// The core never dispatches over token standards; it reaches foreign
/// balances only through this trait, and only via the ledger's transfer
/// façade for the native asset.
pub trait TokenRegistry: Send + Sync {
    fn balance_of(&self, asset: AssetId, addr: &Address) -> u64;
    fn transfer(&self, asset: AssetId, from: &Address, to: &Address, amount: u64) -> Result<()>;
    fn mint(&self, asset: AssetId, to: &Address, amount: u64) -> Result<()>;
    fn burn(&self, asset: AssetId, from: &Address, amount: u64) -> Result<()>;
}

/// Per-asset per-account balance table
///
/// `sub` is the only operation that can fail; a missing pair reads as zero.
/// A single mutex serialises access, so callers batch their operations
/// rather than locking per unit of work.
#[derive(Debug, Default)]
pub struct BalanceTable {
    entries: Mutex<HashMap<(AssetId, Address), u64>>,
}

/// Snapshot row used by supply audits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalanceEntry {
    pub asset: AssetId,
    pub address: Address,
    pub amount: u64,
}

impl BalanceTable {
    pub fn new() -> Self {
        BalanceTable {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Read a balance; unknown pairs are zero
    pub fn get(&self, asset: AssetId, addr: &Address) -> u64 {
        *self.entries.lock().get(&(asset, *addr)).unwrap_or(&0)
    }

    /// Overwrite a balance
    pub fn set(&self, asset: AssetId, addr: &Address, amount: u64) {
        self.entries.lock().insert((asset, *addr), amount);
    }

    /// Credit an account; saturates rather than wraps on overflow
    pub fn add(&self, asset: AssetId, addr: &Address, amount: u64) {
        let mut entries = self.entries.lock();
        let slot = entries.entry((asset, *addr)).or_insert(0);
        *slot = slot.saturating_add(amount);
    }

    /// Debit an account; fails on underflow and changes nothing
    pub fn sub(&self, asset: AssetId, addr: &Address, amount: u64) -> Result<()> {
        let mut entries = self.entries.lock();
        let slot = entries.entry((asset, *addr)).or_insert(0);
        if *slot < amount {
            return Err(SynnergyError::InsufficientBalance {
                address: addr.to_hex(),
                balance: *slot,
                required: amount,
            });
        }
        *slot -= amount;
        Ok(())
    }

    /// Total supply of one asset across all accounts
    pub fn total(&self, asset: AssetId) -> u64 {
        self.entries
            .lock()
            .iter()
            .filter(|((a, _), _)| *a == asset)
            .map(|(_, amount)| *amount)
            .sum()
    }

    /// Stable snapshot of every non-zero entry
    pub fn snapshot(&self) -> Vec<BalanceEntry> {
        let mut rows: Vec<BalanceEntry> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, amount)| **amount > 0)
            .map(|((asset, address), amount)| BalanceEntry {
                asset: *asset,
                address: *address,
                amount: *amount,
            })
            .collect();
        rows.sort_by(|a, b| (a.asset, a.address).cmp(&(b.asset, b.address)));
        rows
    }
}

impl TokenRegistry for BalanceTable {
    fn balance_of(&self, asset: AssetId, addr: &Address) -> u64 {
        self.get(asset, addr)
    }

    fn transfer(&self, asset: AssetId, from: &Address, to: &Address, amount: u64) -> Result<()> {
        let mut entries = self.entries.lock();
        let from_slot = *entries.get(&(asset, *from)).unwrap_or(&0);
        if from_slot < amount {
            return Err(SynnergyError::InsufficientBalance {
                address: from.to_hex(),
                balance: from_slot,
                required: amount,
            });
        }
        entries.insert((asset, *from), from_slot - amount);
        let to_slot = entries.entry((asset, *to)).or_insert(0);
        *to_slot = to_slot.saturating_add(amount);
        debug!("asset {} transfer {} -> {}: {}", asset, from, to, amount);
        Ok(())
    }

    fn mint(&self, asset: AssetId, to: &Address, amount: u64) -> Result<()> {
        self.add(asset, to, amount);
        Ok(())
    }

    fn burn(&self, asset: AssetId, from: &Address, amount: u64) -> Result<()> {
        self.sub(asset, from, amount)
    }
}
