use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::authority::AuthoritySet;
use crate::crypto::{Address, Hash};
use crate::ledger::LedgerView;
use crate::network::{Network, TOPIC_TX_NEW};
use crate::state::StateStore;
use crate::transaction::{Transaction, TxType};
use crate::{Result, SynnergyError, REVERSAL_AUTHORITY_QUORUM};

/// Compliance boundary consulted during admission; rejection is final
pub trait ComplianceManager: Send + Sync {
    fn review_transaction(&self, tx: &Transaction) -> Result<()>;
}

/// Optional anomaly scorer; high scores flag the transaction in state but
/// never reject it
pub trait AnomalyService: Send + Sync {
    fn score(&self, tx: &Transaction) -> f32;
}

/// The seam the consensus engine uses to drain the pool
pub trait TxSource: Send + Sync {
    /// Atomically remove and return up to `max` transactions in priority order
    fn pick(&self, max: usize) -> Vec<Transaction>;
    /// Number of pending transactions
    fn size(&self) -> usize;
    /// Mempool pressure in [0, 1], byte-based
    fn pressure(&self) -> f64;
}

/// Admission ordering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolOrdering {
    /// Arrival order
    #[default]
    Fifo,
    /// Highest gas price first, arrival order within a price
    GasPrice,
}

/// Pool tuning knobs
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Byte bound over all pending transactions
    pub max_bytes: usize,
    pub ordering: PoolOrdering,
    /// Anomaly score above which a transaction is flagged in state
    pub anomaly_threshold: f32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_bytes: crate::MAX_POOL_BYTES,
            ordering: PoolOrdering::Fifo,
            anomaly_threshold: 0.9,
        }
    }
}

/// Anomaly flag persisted under `anomaly:<txHash>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyFlag {
    pub score: f32,
    pub flagged_at: i64,
}

#[derive(Default)]
struct PoolInner {
    lookup: HashMap<Hash, Transaction>,
    /// Priority key -> hash; iteration order is pick order
    queue: BTreeMap<(u64, u64), Hash>,
    bytes: usize,
    seq: u64,
}

/// Bounded, priority-ordered mempool
///
/// Admission verifies the signature, recomputes the hash, enforces nonce
/// and balance against the attached ledger view, and gates reversals behind
/// an active-authority quorum. Admitted transactions are gossiped on
/// `tx:new` exactly once. When the byte bound would be exceeded the
/// newcomer is rejected; existing entries are never evicted.
pub struct TxPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    ledger: Option<Arc<dyn LedgerView>>,
    authorities: Option<Arc<AuthoritySet>>,
    network: Option<Arc<dyn Network>>,
    compliance: Option<Arc<dyn ComplianceManager>>,
    anomaly: Option<Arc<dyn AnomalyService>>,
    store: Option<Arc<StateStore>>,
}

fn anomaly_key(hash: &Hash) -> Vec<u8> {
    format!("anomaly:{}", hash.to_hex()).into_bytes()
}

impl TxPool {
    pub fn new(config: PoolConfig) -> Self {
        TxPool {
            config,
            inner: Mutex::new(PoolInner::default()),
            ledger: None,
            authorities: None,
            network: None,
            compliance: None,
            anomaly: None,
            store: None,
        }
    }

    /// Attach the ledger view used for nonce and balance admission checks
    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerView>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Attach the authority set that gates reversal admission
    pub fn with_authorities(mut self, authorities: Arc<AuthoritySet>) -> Self {
        self.authorities = Some(authorities);
        self
    }

    /// Attach the gossip adapter; admissions publish on `tx:new`
    pub fn with_network(mut self, network: Arc<dyn Network>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_compliance(mut self, compliance: Arc<dyn ComplianceManager>) -> Self {
        self.compliance = Some(compliance);
        self
    }

    /// Attach the anomaly scorer and the store its flags land in
    pub fn with_anomaly(mut self, anomaly: Arc<dyn AnomalyService>, store: Arc<StateStore>) -> Self {
        self.anomaly = Some(anomaly);
        self.store = Some(store);
        self
    }

    fn priority_key(&self, tx: &Transaction, seq: u64) -> (u64, u64) {
        match self.config.ordering {
            PoolOrdering::Fifo => (0, seq),
            // invert so the BTreeMap iterates highest price first
            PoolOrdering::GasPrice => (u64::MAX - tx.gas_price, seq),
        }
    }

    fn check_reversal_quorum(&self, tx: &Transaction) -> Result<()> {
        let authorities = self.authorities.as_ref().ok_or_else(|| {
            SynnergyError::ValidationFailed(
                "reversal admission requires an authority set".to_string(),
            )
        })?;
        let mut signers: HashSet<Address> = HashSet::new();
        for sig in &tx.auth_sigs {
            if !sig.verify(tx.hash.as_bytes())? {
                return Err(SynnergyError::InvalidSignature(
                    "authority co-signature does not verify".to_string(),
                ));
            }
            let signer = sig.signer()?;
            if !authorities.is_authority(&signer) {
                return Err(SynnergyError::ValidationFailed(format!(
                    "co-signer {} is not an active authority",
                    signer
                )));
            }
            signers.insert(signer);
        }
        if signers.len() < REVERSAL_AUTHORITY_QUORUM {
            return Err(SynnergyError::ValidationFailed(format!(
                "reversal carries {} distinct authority signatures, need {}",
                signers.len(),
                REVERSAL_AUTHORITY_QUORUM
            )));
        }
        Ok(())
    }

    /// Validate and enqueue a transaction
    pub fn add_tx(&self, tx: Transaction) -> Result<Hash> {
        tx.verify()?;
        let hash = tx.hash;

        if self.inner.lock().lookup.contains_key(&hash) {
            return Err(SynnergyError::DuplicateTransaction(hash.to_hex()));
        }

        if let Some(ledger) = &self.ledger {
            let expected = ledger.nonce_of(&tx.from);
            if tx.nonce != expected {
                return Err(SynnergyError::NonceMismatch {
                    expected,
                    found: tx.nonce,
                });
            }
            let balance = ledger.balance_of(&tx.from);
            if balance < tx.total_cost() {
                return Err(SynnergyError::InsufficientBalance {
                    address: tx.from.to_hex(),
                    balance,
                    required: tx.total_cost(),
                });
            }
        }

        if tx.tx_type == TxType::Reversal {
            self.check_reversal_quorum(&tx)?;
        }

        if let Some(compliance) = &self.compliance {
            compliance.review_transaction(&tx)?;
        }

        if let Some(anomaly) = &self.anomaly {
            let score = anomaly.score(&tx);
            if score > self.config.anomaly_threshold {
                if let Some(store) = &self.store {
                    let flag = AnomalyFlag {
                        score,
                        flagged_at: chrono::Utc::now().timestamp(),
                    };
                    if let Err(e) = store.put_record(&anomaly_key(&hash), &flag) {
                        warn!("failed to persist anomaly flag for {}: {}", hash.short(), e);
                    } else {
                        info!("flagged anomalous transaction {} (score {:.2})", hash.short(), score);
                    }
                }
            }
        }

        let tx_bytes = tx.size();
        {
            let mut inner = self.inner.lock();
            if inner.bytes + tx_bytes > self.config.max_bytes {
                return Err(SynnergyError::PoolFull {
                    bytes: inner.bytes,
                    max_bytes: self.config.max_bytes,
                });
            }
            // re-check under the lock; a racer may have admitted the same hash
            if inner.lookup.contains_key(&hash) {
                return Err(SynnergyError::DuplicateTransaction(hash.to_hex()));
            }
            let seq = inner.seq;
            inner.seq += 1;
            let key = self.priority_key(&tx, seq);
            inner.queue.insert(key, hash);
            inner.lookup.insert(hash, tx.clone());
            inner.bytes += tx_bytes;
        }

        if let Some(network) = &self.network {
            if let Ok(json) = tx.to_json() {
                if let Err(e) = network.broadcast(TOPIC_TX_NEW, json.as_bytes()) {
                    warn!("gossip of {} failed: {}", hash.short(), e);
                }
            }
        }

        debug!("admitted {}", hash.short());
        Ok(hash)
    }

    /// Stable copy of pending transactions in priority order
    pub fn snapshot(&self) -> Vec<Transaction> {
        let inner = self.inner.lock();
        inner
            .queue
            .values()
            .filter_map(|h| inner.lookup.get(h).cloned())
            .collect()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.lock().lookup.contains_key(hash)
    }
}

impl TxSource for TxPool {
    fn pick(&self, max: usize) -> Vec<Transaction> {
        let mut inner = self.inner.lock();
        let keys: Vec<(u64, u64)> = inner.queue.keys().take(max).copied().collect();
        let mut picked = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(hash) = inner.queue.remove(&key) {
                if let Some(tx) = inner.lookup.remove(&hash) {
                    inner.bytes = inner.bytes.saturating_sub(tx.size());
                    picked.push(tx);
                }
            }
        }
        picked
    }

    fn size(&self) -> usize {
        self.inner.lock().lookup.len()
    }

    fn pressure(&self) -> f64 {
        let inner = self.inner.lock();
        (inner.bytes as f64 / self.config.max_bytes as f64).min(1.0)
    }
}
