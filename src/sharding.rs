use dashmap::DashMap;
use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::crypto::{sha256, Address, Hash};
use crate::network::{Network, TOPIC_XS_RECEIPT};
use crate::state::StateStore;
use crate::{Result, SynnergyError, RESHARD_EPOCH, SHARD_BITS};

/// Upper bound on shard bits; 12 bits is 4096 shards
pub const MAX_SHARD_BITS: u8 = 12;

/// Samples kept per shard in the rolling load window
pub const LOAD_WINDOW: usize = 100;

/// Deterministic address-to-shard mapping
///
/// Takes the top 16 bits of SHA-256 over the address and keeps the
/// `shard_bits` most significant of them, so every address belongs to
/// exactly one shard at a given width and the mapping is stable across
/// runs.
pub fn shard_of(addr: &Address, shard_bits: u8) -> u16 {
    let digest = sha256(addr.as_bytes());
    let prefix = u16::from_be_bytes([digest.as_bytes()[0], digest.as_bytes()[1]]);
    prefix >> (16 - shard_bits as u16)
}

/// A cross-shard message produced in the origin shard and consumed in the
/// destination shard
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrossShardTx {
    pub hash: Hash,
    pub from_shard: u16,
    pub to_shard: u16,
    /// Destination address; receipts are re-routed by it on resharding
    pub to: Address,
    pub payload: Vec<u8>,
}

impl CrossShardTx {
    pub fn new(hash: Hash, from_shard: u16, to: Address, payload: Vec<u8>, shard_bits: u8) -> Self {
        CrossShardTx {
            hash,
            from_shard,
            to_shard: shard_of(&to, shard_bits),
            to,
            payload,
        }
    }
}

fn receipt_key(shard: u16, hash: &Hash) -> Vec<u8> {
    format!("xs:pending:{}:{}", shard, hash.to_hex()).into_bytes()
}

fn receipt_prefix(shard: u16) -> Vec<u8> {
    format!("xs:pending:{}:", shard).into_bytes()
}

/// One load observation for a shard
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LoadSample {
    /// CPU utilisation in [0, 1]
    pub cpu: f64,
    /// Transactions per second
    pub tx_rate: f64,
}

/// Shard selection policies; pure functions over a metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    RoundRobin,
    LeastLoaded,
    /// Moving average over the window, lowest predicted load wins
    Predictive,
}

/// Pick a shard under `policy` from a metrics snapshot
///
/// `cursor` only matters for round-robin; sorted iteration makes every
/// policy deterministic for a given snapshot.
pub fn select_shard(
    policy: SelectionPolicy,
    snapshot: &BTreeMap<u16, Vec<LoadSample>>,
    cursor: usize,
) -> Option<u16> {
    if snapshot.is_empty() {
        return None;
    }
    match policy {
        SelectionPolicy::RoundRobin => {
            snapshot.keys().nth(cursor % snapshot.len()).copied()
        }
        SelectionPolicy::LeastLoaded => snapshot
            .iter()
            .min_by(|(_, a), (_, b)| {
                let la = a.last().map(|s| s.cpu + s.tx_rate).unwrap_or(0.0);
                let lb = b.last().map(|s| s.cpu + s.tx_rate).unwrap_or(0.0);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(id, _)| *id),
        SelectionPolicy::Predictive => snapshot
            .iter()
            .min_by(|(_, a), (_, b)| {
                let avg = |w: &Vec<LoadSample>| {
                    if w.is_empty() {
                        0.0
                    } else {
                        w.iter().map(|s| s.cpu + s.tx_rate).sum::<f64>() / w.len() as f64
                    }
                };
                avg(a).partial_cmp(&avg(b)).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(id, _)| *id),
    }
}

/// Routes cross-shard receipts and tracks per-shard load
///
/// Receipts live under `xs:pending:<shard>:<hash>` and are drained in
/// lexicographic key order inside one transactional boundary, so a receipt
/// is applied at most once.
pub struct ShardCoordinator {
    store: Arc<StateStore>,
    network: Option<Arc<dyn Network>>,
    shard_bits: RwLock<u8>,
    metrics: DashMap<u16, VecDeque<LoadSample>>,
    rr_cursor: AtomicUsize,
}

impl ShardCoordinator {
    pub fn new(store: Arc<StateStore>) -> Self {
        ShardCoordinator {
            store,
            network: None,
            shard_bits: RwLock::new(SHARD_BITS),
            metrics: DashMap::new(),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub fn with_network(mut self, network: Arc<dyn Network>) -> Self {
        self.network = Some(network);
        self
    }

    /// Current shard width in bits
    pub fn shard_bits(&self) -> u8 {
        *self.shard_bits.read()
    }

    /// Number of shards at the current width
    pub fn shard_count(&self) -> u32 {
        1u32 << self.shard_bits()
    }

    /// Shard owning `addr` at the current width
    pub fn shard_of_addr(&self, addr: &Address) -> u16 {
        shard_of(addr, self.shard_bits())
    }

    /// Persist a receipt for a cross-shard transaction and gossip it
    ///
    /// Fails when origin and destination shard coincide; such transactions
    /// are ordinary local transfers.
    pub fn submit_cross_shard(&self, xs: &CrossShardTx) -> Result<()> {
        if xs.from_shard == xs.to_shard {
            return Err(SynnergyError::ShardingError(format!(
                "transaction {} is not cross-shard (shard {})",
                xs.hash.short(),
                xs.from_shard
            )));
        }
        let key = receipt_key(xs.to_shard, &xs.hash);
        if self.store.has(&key).map_err(SynnergyError::from)? {
            return Err(SynnergyError::DuplicateTransaction(xs.hash.to_hex()));
        }
        self.store.put_record(&key, xs).map_err(SynnergyError::from)?;

        if let Some(network) = &self.network {
            if let Ok(json) = serde_json::to_string(xs) {
                let _ = network.broadcast(TOPIC_XS_RECEIPT, json.as_bytes());
            }
        }
        debug!(
            "receipt {} queued for shard {}",
            xs.hash.short(),
            xs.to_shard
        );
        Ok(())
    }

    /// Drain up to `limit` pending receipts for shard `shard`
    ///
    /// Each receipt is deleted in the same staged batch that reads it, so a
    /// second drain cannot observe it again.
    pub fn pull_receipts(&self, shard: u16, limit: usize) -> Result<Vec<CrossShardTx>> {
        let prefix = receipt_prefix(shard);
        let mut batch = self.store.stage();
        let entries = batch.prefix_iter(&prefix).map_err(SynnergyError::from)?;

        let mut receipts = Vec::new();
        for (key, value) in entries.into_iter().take(limit) {
            let xs: CrossShardTx = serde_json::from_slice(&value)?;
            batch.delete(key);
            receipts.push(xs);
        }
        if !receipts.is_empty() {
            self.store.commit(batch).map_err(SynnergyError::from)?;
            debug!("drained {} receipts from shard {}", receipts.len(), shard);
        }
        Ok(receipts)
    }

    /// Count of receipts currently pending for a shard
    pub fn pending_count(&self, shard: u16) -> usize {
        self.store.prefix_iter(&receipt_prefix(shard)).count()
    }

    /// Widen the shard space at an epoch boundary
    ///
    /// Allowed only when `height` sits on the reshard epoch and
    /// `new_bits ∈ (current, 12]`. Every pending receipt is re-routed to
    /// the shard its destination address maps to at the new width; the
    /// migration commits as one batch or not at all.
    pub fn reshard(&self, new_bits: u8, height: u64) -> Result<()> {
        if height % RESHARD_EPOCH != 0 {
            return Err(SynnergyError::ShardingError(format!(
                "resharding only at epoch boundaries (height {} mod {} != 0)",
                height, RESHARD_EPOCH
            )));
        }
        let mut bits = self.shard_bits.write();
        if new_bits <= *bits || new_bits > MAX_SHARD_BITS {
            return Err(SynnergyError::ShardingError(format!(
                "new shard bits {} outside ({}, {}]",
                new_bits, *bits, MAX_SHARD_BITS
            )));
        }

        let mut batch = self.store.stage();
        let mut migrated = 0usize;
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .store
            .prefix_iter(b"xs:pending:")
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SynnergyError::IteratorInterrupted(e.to_string()))?;
        for (key, value) in entries {
            let mut xs: CrossShardTx = serde_json::from_slice(&value)?;
            let new_shard = shard_of(&xs.to, new_bits);
            if receipt_key(new_shard, &xs.hash) != key {
                batch.delete(key);
                xs.to_shard = new_shard;
                batch
                    .put_record(receipt_key(new_shard, &xs.hash), &xs)
                    .map_err(SynnergyError::from)?;
                migrated += 1;
            }
        }
        self.store.commit(batch).map_err(SynnergyError::from)?;
        info!(
            "resharded {} -> {} bits, migrated {} receipts",
            *bits, new_bits, migrated
        );
        *bits = new_bits;
        Ok(())
    }

    /// Record one load observation for a shard; the window keeps the last
    /// `LOAD_WINDOW` samples
    pub fn record_load(&self, shard: u16, sample: LoadSample) {
        let mut window = self.metrics.entry(shard).or_default();
        if window.len() == LOAD_WINDOW {
            window.pop_front();
        }
        window.push_back(sample);
    }

    /// Stable snapshot of every shard's load window
    pub fn metrics_snapshot(&self) -> BTreeMap<u16, Vec<LoadSample>> {
        self.metrics
            .iter()
            .map(|entry| (*entry.key(), entry.value().iter().copied().collect()))
            .collect()
    }

    /// Pick a shard under `policy`, advancing the round-robin cursor
    pub fn pick_shard(&self, policy: SelectionPolicy) -> Option<u16> {
        let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
        select_shard(policy, &self.metrics_snapshot(), cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    fn coordinator() -> ShardCoordinator {
        ShardCoordinator::new(Arc::new(StateStore::temporary().unwrap()))
    }

    /// Find an address in a different shard than `from` at 10 bits
    fn address_in_other_shard(from: &Address) -> Address {
        let home = shard_of(from, SHARD_BITS);
        for b in 0..=u8::MAX {
            let candidate = addr(b);
            if shard_of(&candidate, SHARD_BITS) != home {
                return candidate;
            }
        }
        unreachable!("256 addresses cannot all map to one of 1024 shards");
    }

    #[test]
    fn test_shard_of_pure_and_in_range() {
        for b in 0..32u8 {
            let a = addr(b);
            let s = shard_of(&a, SHARD_BITS);
            assert_eq!(s, shard_of(&a, SHARD_BITS));
            assert!(s < 1024);
        }
    }

    #[test]
    fn test_same_shard_submission_rejected() {
        let coord = coordinator();
        let origin = addr(1);
        let shard = coord.shard_of_addr(&origin);
        let xs = CrossShardTx {
            hash: sha256(b"tx"),
            from_shard: shard,
            to_shard: shard,
            to: origin,
            payload: Vec::new(),
        };
        assert!(coord.submit_cross_shard(&xs).is_err());
    }

    #[test]
    fn test_receipt_drained_exactly_once() {
        let coord = coordinator();
        let origin = addr(1);
        let dest = address_in_other_shard(&origin);
        let xs = CrossShardTx::new(
            sha256(b"payment"),
            coord.shard_of_addr(&origin),
            dest,
            b"value transfer".to_vec(),
            SHARD_BITS,
        );
        let dest_shard = xs.to_shard;
        coord.submit_cross_shard(&xs).unwrap();
        assert_eq!(coord.pending_count(dest_shard), 1);

        let drained = coord.pull_receipts(dest_shard, 16).unwrap();
        assert_eq!(drained, vec![xs]);

        // second drain finds nothing
        assert!(coord.pull_receipts(dest_shard, 16).unwrap().is_empty());
        assert_eq!(coord.pending_count(dest_shard), 0);
    }

    #[test]
    fn test_duplicate_receipt_rejected() {
        let coord = coordinator();
        let origin = addr(1);
        let dest = address_in_other_shard(&origin);
        let xs = CrossShardTx::new(
            sha256(b"payment"),
            coord.shard_of_addr(&origin),
            dest,
            Vec::new(),
            SHARD_BITS,
        );
        coord.submit_cross_shard(&xs).unwrap();
        assert!(matches!(
            coord.submit_cross_shard(&xs),
            Err(SynnergyError::DuplicateTransaction(_))
        ));
    }

    #[test]
    fn test_drain_respects_limit_and_lexicographic_order() {
        let coord = coordinator();
        let origin = addr(1);
        let dest = address_in_other_shard(&origin);
        let from_shard = coord.shard_of_addr(&origin);
        let dest_shard = shard_of(&dest, SHARD_BITS);

        let mut hashes = Vec::new();
        for i in 0..5u8 {
            let xs = CrossShardTx::new(
                sha256(&[i]),
                from_shard,
                dest,
                Vec::new(),
                SHARD_BITS,
            );
            hashes.push(xs.hash);
            coord.submit_cross_shard(&xs).unwrap();
        }
        hashes.sort_by_key(|h| h.to_hex());

        let first = coord.pull_receipts(dest_shard, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].hash, hashes[0]);
        assert_eq!(first[1].hash, hashes[1]);

        let rest = coord.pull_receipts(dest_shard, 16).unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[test]
    fn test_reshard_epoch_and_range_gates() {
        let coord = coordinator();
        assert!(coord.reshard(11, RESHARD_EPOCH + 1).is_err());
        assert!(coord.reshard(SHARD_BITS, RESHARD_EPOCH).is_err());
        assert!(coord.reshard(13, RESHARD_EPOCH).is_err());
        assert!(coord.reshard(11, RESHARD_EPOCH).is_ok());
        assert_eq!(coord.shard_bits(), 11);
        assert_eq!(coord.shard_count(), 2048);
    }

    #[test]
    fn test_reshard_preserves_routing_consistency() {
        let coord = coordinator();
        let origin = addr(1);
        let from_shard = coord.shard_of_addr(&origin);

        let mut receipts = Vec::new();
        for b in 2..12u8 {
            let dest = addr(b);
            if shard_of(&dest, SHARD_BITS) == from_shard {
                continue;
            }
            let xs = CrossShardTx::new(sha256(&[b]), from_shard, dest, Vec::new(), SHARD_BITS);
            coord.submit_cross_shard(&xs).unwrap();
            receipts.push(xs);
        }

        coord.reshard(12, RESHARD_EPOCH * 3).unwrap();

        // every receipt now sits under the shard its destination maps to
        // at the new width
        for xs in receipts {
            let expected = shard_of(&xs.to, 12);
            assert!(coord
                .store
                .has(&receipt_key(expected, &xs.hash))
                .unwrap());
        }
    }

    #[test]
    fn test_selection_policies() {
        let coord = coordinator();
        coord.record_load(1, LoadSample { cpu: 0.9, tx_rate: 0.9 });
        coord.record_load(2, LoadSample { cpu: 0.1, tx_rate: 0.1 });
        coord.record_load(3, LoadSample { cpu: 0.5, tx_rate: 0.5 });

        assert_eq!(coord.pick_shard(SelectionPolicy::LeastLoaded), Some(2));

        // predictive uses the whole window: shard 2 spikes now but its
        // average stays below shard 3
        coord.record_load(2, LoadSample { cpu: 0.6, tx_rate: 0.6 });
        let snap = coord.metrics_snapshot();
        assert_eq!(select_shard(SelectionPolicy::Predictive, &snap, 0), Some(2));
        // while least-loaded reacts to the newest sample only
        assert_eq!(select_shard(SelectionPolicy::LeastLoaded, &snap, 0), Some(3));

        // round-robin walks shard ids in order
        assert_eq!(select_shard(SelectionPolicy::RoundRobin, &snap, 0), Some(1));
        assert_eq!(select_shard(SelectionPolicy::RoundRobin, &snap, 1), Some(2));
        assert_eq!(select_shard(SelectionPolicy::RoundRobin, &snap, 3), Some(1));
    }

    #[test]
    fn test_load_window_bounded() {
        let coord = coordinator();
        for i in 0..(LOAD_WINDOW + 20) {
            coord.record_load(
                1,
                LoadSample {
                    cpu: i as f64 / 200.0,
                    tx_rate: 0.0,
                },
            );
        }
        let snap = coord.metrics_snapshot();
        assert_eq!(snap.get(&1).unwrap().len(), LOAD_WINDOW);
    }
}
