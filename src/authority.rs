use chrono::Utc;
use log::{info, warn};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::crypto::{sha256, Address};
use crate::ledger::{penalty_key, stake_key, AuthorityView, PenaltyRecord};
use crate::state::StateStore;
use crate::{Result, SynnergyError, AUTHORITY_PENALTY_THRESHOLD};

/// Authority node roles with fixed vote thresholds and sampling weights
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AuthorityRole {
    Government,
    CentralBank,
    Regulation,
    StandardAuthority,
    Military,
    LargeCommerce,
}

impl AuthorityRole {
    /// Public and authority vote counts required for activation
    pub fn vote_thresholds(&self) -> (u64, u64) {
        match self {
            AuthorityRole::Government => (5_000, 20),
            AuthorityRole::CentralBank => (4_000, 18),
            AuthorityRole::Regulation => (3_000, 15),
            AuthorityRole::StandardAuthority => (500, 10),
            AuthorityRole::Military => (2_000, 12),
            AuthorityRole::LargeCommerce => (1_000, 8),
        }
    }

    /// Relative weight in electorate sampling
    pub fn sampling_weight(&self) -> u32 {
        match self {
            AuthorityRole::Government => 6,
            AuthorityRole::CentralBank => 5,
            AuthorityRole::Regulation => 4,
            AuthorityRole::StandardAuthority => 3,
            AuthorityRole::Military => 2,
            AuthorityRole::LargeCommerce => 2,
        }
    }
}

/// Membership record persisted under `authority:node:<addr>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthorityNode {
    pub addr: Address,
    pub wallet: Address,
    pub role: AuthorityRole,
    pub public_votes: u64,
    pub auth_votes: u64,
    pub active: bool,
    pub created_at: i64,
}

/// Vote receipt persisted under `authority:vote:<candidateHash>:<voter>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct VoteRecord {
    authority: bool,
    cast_at: i64,
}

/// Stake record persisted under `stake:<addr>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StakeRecord {
    pub amount: u64,
}

/// Collaborator notified when a penalty crosses the slashing threshold
pub trait PenaltyManager: Send + Sync {
    fn on_slash(&self, addr: &Address, slashed: u64, reason: &str);
}

fn node_key(addr: &Address) -> Vec<u8> {
    format!("authority:node:{}", addr.to_hex()).into_bytes()
}

fn candidate_hash(addr: &Address) -> String {
    sha256(addr.as_bytes()).to_hex()
}

fn vote_key(candidate: &Address, voter: &Address) -> Vec<u8> {
    format!(
        "authority:vote:{}:{}",
        candidate_hash(candidate),
        voter.to_hex()
    )
    .into_bytes()
}

fn vote_prefix(candidate: &Address) -> Vec<u8> {
    format!("authority:vote:{}:", candidate_hash(candidate)).into_bytes()
}

/// Role-weighted authority membership
///
/// Backed by the state store with a read-write-locked cache that is
/// reconciled on every write; a cache miss falls through to the store.
pub struct AuthoritySet {
    store: Arc<StateStore>,
    cache: RwLock<HashMap<Address, AuthorityNode>>,
}

impl AuthoritySet {
    /// Load the set, warming the cache from persisted records
    pub fn new(store: Arc<StateStore>) -> Result<Self> {
        let mut cache = HashMap::new();
        for entry in store.prefix_iter(b"authority:node:") {
            let (_, bytes) =
                entry.map_err(|e| SynnergyError::IteratorInterrupted(e.to_string()))?;
            let node: AuthorityNode = serde_json::from_slice(&bytes)?;
            cache.insert(node.addr, node);
        }
        Ok(AuthoritySet {
            store,
            cache: RwLock::new(cache),
        })
    }

    /// Admit a new pending candidate
    pub fn register_candidate(
        &self,
        addr: Address,
        role: AuthorityRole,
        wallet: Address,
    ) -> Result<()> {
        if wallet.is_zero() {
            return Err(SynnergyError::ValidationFailed(
                "candidate wallet cannot be the zero address".to_string(),
            ));
        }
        let mut cache = self.cache.write();
        if cache.contains_key(&addr) || self.store.has(&node_key(&addr)).map_err(SynnergyError::from)? {
            return Err(SynnergyError::AlreadyRegistered(addr.to_hex()));
        }
        let node = AuthorityNode {
            addr,
            wallet,
            role,
            public_votes: 0,
            auth_votes: 0,
            active: false,
            created_at: Utc::now().timestamp(),
        };
        self.store
            .put_record(&node_key(&addr), &node)
            .map_err(SynnergyError::from)?;
        cache.insert(addr, node);
        info!("registered authority candidate {} ({:?})", addr, role);
        Ok(())
    }

    fn load_node(&self, addr: &Address) -> Result<Option<AuthorityNode>> {
        if let Some(node) = self.cache.read().get(addr) {
            return Ok(Some(node.clone()));
        }
        // read miss falls through to the store
        let node = self
            .store
            .get_record::<AuthorityNode>(&node_key(addr))
            .map_err(SynnergyError::from)?;
        if let Some(n) = &node {
            self.cache.write().insert(*addr, n.clone());
        }
        Ok(node)
    }

    /// Whether `addr` is a registered, active authority
    pub fn is_authority(&self, addr: &Address) -> bool {
        self.load_node(addr).ok().flatten().map(|n| n.active).unwrap_or(false)
    }

    pub fn get(&self, addr: &Address) -> Result<Option<AuthorityNode>> {
        self.load_node(addr)
    }

    /// All registered nodes, active or pending
    pub fn list_authorities(&self) -> Vec<AuthorityNode> {
        let mut nodes: Vec<AuthorityNode> = self.cache.read().values().cloned().collect();
        nodes.sort_by_key(|n| n.addr);
        nodes
    }

    /// Record one vote for `candidate`
    ///
    /// The voter is classified by its own current status: active authorities
    /// cast authority votes, everyone else casts public votes. Duplicate
    /// votes per (candidate, voter) are rejected; activation flips at most
    /// once, when both role thresholds are met.
    pub fn record_vote(&self, voter: &Address, candidate: &Address) -> Result<()> {
        let voter_is_authority = self.is_authority(voter);

        let mut cache = self.cache.write();
        let mut node = match cache.get(candidate) {
            Some(n) => n.clone(),
            None => {
                return Err(SynnergyError::NotFound(format!(
                    "candidate {} not registered",
                    candidate
                )))
            }
        };

        let key = vote_key(candidate, voter);
        if self.store.has(&key).map_err(SynnergyError::from)? {
            return Err(SynnergyError::DuplicateVote {
                candidate: candidate.to_hex(),
                voter: voter.to_hex(),
            });
        }
        let receipt = VoteRecord {
            authority: voter_is_authority,
            cast_at: Utc::now().timestamp(),
        };
        self.store
            .put_record(&key, &receipt)
            .map_err(SynnergyError::from)?;

        if voter_is_authority {
            node.auth_votes += 1;
        } else {
            node.public_votes += 1;
        }

        let (public_needed, auth_needed) = node.role.vote_thresholds();
        if !node.active && node.public_votes >= public_needed && node.auth_votes >= auth_needed {
            node.active = true;
            info!(
                "authority {} activated ({} public, {} authority votes)",
                candidate, node.public_votes, node.auth_votes
            );
        }

        self.store
            .put_record(&node_key(candidate), &node)
            .map_err(SynnergyError::from)?;
        cache.insert(*candidate, node);
        Ok(())
    }

    /// Sample up to `size` distinct active authorities without replacement
    ///
    /// The pool expands each active node by its role weight, is shuffled
    /// with a cryptographic RNG, and walked until `size` distinct addresses
    /// are collected.
    pub fn random_electorate(&self, size: usize) -> Vec<Address> {
        let cache = self.cache.read();
        let mut pool: Vec<Address> = Vec::new();
        let mut active: Vec<&AuthorityNode> =
            cache.values().filter(|n| n.active).collect();
        active.sort_by_key(|n| n.addr);
        for node in active {
            for _ in 0..node.role.sampling_weight() {
                pool.push(node.addr);
            }
        }
        pool.shuffle(&mut OsRng);

        let mut electorate = Vec::with_capacity(size);
        for addr in pool {
            if electorate.len() == size {
                break;
            }
            if !electorate.contains(&addr) {
                electorate.push(addr);
            }
        }
        electorate
    }

    /// Stake bonded by an address
    pub fn stake_of(&self, addr: &Address) -> u64 {
        self.store
            .get_record::<StakeRecord>(&stake_key(addr))
            .ok()
            .flatten()
            .map(|s| s.amount)
            .unwrap_or(0)
    }

    /// Bond stake for an address
    pub fn set_stake(&self, addr: &Address, amount: u64) -> Result<()> {
        self.store
            .put_record(&stake_key(addr), &StakeRecord { amount })
            .map_err(SynnergyError::from)
    }

    /// Sum of stake behind active authorities
    pub fn total_active_stake(&self) -> u64 {
        self.cache
            .read()
            .values()
            .filter(|n| n.active)
            .map(|n| self.stake_of(&n.addr))
            .sum()
    }

    /// Herfindahl concentration of active stake, in [0, 1]
    pub fn stake_concentration(&self) -> f64 {
        let stakes: Vec<u64> = self
            .cache
            .read()
            .values()
            .filter(|n| n.active)
            .map(|n| self.stake_of(&n.addr))
            .collect();
        let total: u64 = stakes.iter().sum();
        if total == 0 {
            return 0.0;
        }
        stakes
            .iter()
            .map(|s| {
                let share = *s as f64 / total as f64;
                share * share
            })
            .sum()
    }

    /// Accumulate penalty points against a node
    ///
    /// Crossing the threshold slashes 25 % of bonded stake, resets the
    /// counter, suspends the account and deactivates the node.
    pub fn apply_penalty(
        &self,
        addr: &Address,
        points: u64,
        reason: &str,
        penalty_mgr: Option<&dyn PenaltyManager>,
    ) -> Result<()> {
        let mut record = self
            .store
            .get_record::<PenaltyRecord>(&penalty_key(addr))
            .map_err(SynnergyError::from)?
            .unwrap_or_default();
        record.points += points;
        record.updated_at = Utc::now().timestamp();

        if record.points >= AUTHORITY_PENALTY_THRESHOLD {
            let stake = self.stake_of(addr);
            let slashed = stake / 4;
            self.set_stake(addr, stake - slashed)?;
            record.points = 0;
            record.suspended = true;

            let mut cache = self.cache.write();
            if let Some(node) = cache.get_mut(addr) {
                node.active = false;
                self.store
                    .put_record(&node_key(addr), node)
                    .map_err(SynnergyError::from)?;
            }
            warn!("slashed {} of stake from {}: {}", slashed, addr, reason);
            if let Some(mgr) = penalty_mgr {
                mgr.on_slash(addr, slashed, reason);
            }
        }

        self.store
            .put_record(&penalty_key(addr), &record)
            .map_err(SynnergyError::from)
    }

    /// Register an authority that is active from genesis
    ///
    /// Bootstrap path for the initial validator set; skips the vote
    /// thresholds that govern later admissions.
    pub fn register_genesis_authority(
        &self,
        addr: Address,
        role: AuthorityRole,
        wallet: Address,
        stake: u64,
    ) -> Result<()> {
        self.register_candidate(addr, role, wallet)?;
        let mut cache = self.cache.write();
        let node = cache.get_mut(&addr).ok_or_else(|| {
            SynnergyError::NotFound(format!("authority {} not registered", addr))
        })?;
        node.active = true;
        self.store
            .put_record(&node_key(&addr), node)
            .map_err(SynnergyError::from)?;
        drop(cache);
        self.set_stake(&addr, stake)
    }

    /// Remove a node and every vote addressed to it
    pub fn deregister(&self, addr: &Address) -> Result<()> {
        let mut cache = self.cache.write();
        if cache.remove(addr).is_none() && !self.store.has(&node_key(addr)).map_err(SynnergyError::from)? {
            return Err(SynnergyError::NotFound(format!(
                "authority {} not registered",
                addr
            )));
        }
        self.store.delete(&node_key(addr)).map_err(SynnergyError::from)?;

        let prefix = vote_prefix(addr);
        let keys: Vec<Vec<u8>> = self
            .store
            .prefix_iter(&prefix)
            .filter_map(|e| e.ok().map(|(k, _)| k))
            .collect();
        for key in keys {
            self.store.delete(&key).map_err(SynnergyError::from)?;
        }
        info!("deregistered authority {}", addr);
        Ok(())
    }
}

impl AuthorityView for AuthoritySet {
    fn is_authority(&self, addr: &Address) -> bool {
        AuthoritySet::is_authority(self, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    fn voter(i: u64) -> Address {
        let mut bytes = [0xEEu8; 20];
        bytes[..8].copy_from_slice(&i.to_le_bytes());
        Address(bytes)
    }

    fn set() -> AuthoritySet {
        AuthoritySet::new(Arc::new(StateStore::temporary().unwrap())).unwrap()
    }

    #[test]
    fn test_register_rejects_zero_wallet_and_duplicates() {
        let set = set();
        assert!(set
            .register_candidate(addr(1), AuthorityRole::Military, Address::zero())
            .is_err());
        set.register_candidate(addr(1), AuthorityRole::Military, addr(9)).unwrap();
        assert!(matches!(
            set.register_candidate(addr(1), AuthorityRole::Military, addr(9)),
            Err(SynnergyError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_promotion_at_exact_thresholds() {
        let set = set();
        let candidate = addr(0xC0);
        set.register_candidate(candidate, AuthorityRole::StandardAuthority, addr(0xEE))
            .unwrap();

        // 500 unique public votes leave the candidate pending
        for i in 0..500 {
            set.record_vote(&voter(i), &candidate).unwrap();
        }
        assert!(!set.is_authority(&candidate));

        // 10 authority votes from genesis authorities flip it active on
        // the last one
        for i in 0..10u8 {
            let auth = addr(0xA0 + i);
            set.register_genesis_authority(auth, AuthorityRole::Government, addr(0xEE), 100)
                .unwrap();
            assert!(!set.is_authority(&candidate));
            set.record_vote(&auth, &candidate).unwrap();
        }
        assert!(set.is_authority(&candidate));

        // any later duplicate from a prior voter is rejected
        assert!(matches!(
            set.record_vote(&voter(3), &candidate),
            Err(SynnergyError::DuplicateVote { .. })
        ));
    }

    #[test]
    fn test_duplicate_vote_rejected() {
        let set = set();
        let candidate = addr(0xC0);
        set.register_candidate(candidate, AuthorityRole::Military, addr(0xEE)).unwrap();
        set.record_vote(&voter(1), &candidate).unwrap();
        assert!(matches!(
            set.record_vote(&voter(1), &candidate),
            Err(SynnergyError::DuplicateVote { .. })
        ));
    }

    #[test]
    fn test_vote_classification_by_voter_status() {
        let set = set();
        let candidate = addr(0xC0);
        set.register_candidate(candidate, AuthorityRole::Military, addr(0xEE)).unwrap();
        let auth = addr(0xA1);
        set.register_genesis_authority(auth, AuthorityRole::Regulation, addr(0xEE), 10)
            .unwrap();

        set.record_vote(&voter(1), &candidate).unwrap();
        set.record_vote(&auth, &candidate).unwrap();

        let node = set.get(&candidate).unwrap().unwrap();
        assert_eq!(node.public_votes, 1);
        assert_eq!(node.auth_votes, 1);
    }

    #[test]
    fn test_electorate_distinct_and_bounded() {
        let set = set();
        for i in 0..5u8 {
            set.register_genesis_authority(addr(i + 1), AuthorityRole::Government, addr(0xEE), 10)
                .unwrap();
        }
        let electorate = set.random_electorate(3);
        assert_eq!(electorate.len(), 3);
        let mut dedup = electorate.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 3);

        // asking for more than exists returns everyone once
        let all = set.random_electorate(50);
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_penalty_threshold_slashes_and_deactivates() {
        let set = set();
        let node = addr(0xA1);
        set.register_genesis_authority(node, AuthorityRole::Military, addr(0xEE), 1_000)
            .unwrap();

        set.apply_penalty(&node, 40, "missed slots", None).unwrap();
        assert!(set.is_authority(&node));
        assert_eq!(set.stake_of(&node), 1_000);

        set.apply_penalty(&node, 60, "double sign", None).unwrap();
        assert!(!set.is_authority(&node));
        assert_eq!(set.stake_of(&node), 750);

        // counter reset after the slash
        let record = set
            .store
            .get_record::<PenaltyRecord>(&penalty_key(&node))
            .unwrap()
            .unwrap();
        assert_eq!(record.points, 0);
        assert!(record.suspended);
    }

    #[test]
    fn test_deregister_removes_node_and_votes() {
        let set = set();
        let candidate = addr(0xC0);
        set.register_candidate(candidate, AuthorityRole::Military, addr(0xEE)).unwrap();
        set.record_vote(&voter(1), &candidate).unwrap();
        set.deregister(&candidate).unwrap();

        assert!(set.get(&candidate).unwrap().is_none());
        let votes: Vec<_> = set
            .store
            .prefix_iter(&vote_prefix(&candidate))
            .collect();
        assert!(votes.is_empty());

        // and the candidate can register again with a clean slate
        set.register_candidate(candidate, AuthorityRole::Military, addr(0xEE)).unwrap();
        set.record_vote(&voter(1), &candidate).unwrap();
    }

    #[test]
    fn test_stake_concentration() {
        let set = set();
        set.register_genesis_authority(addr(1), AuthorityRole::Government, addr(0xEE), 500)
            .unwrap();
        set.register_genesis_authority(addr(2), AuthorityRole::Government, addr(0xEE), 500)
            .unwrap();
        // two equal holders: Herfindahl = 0.5
        assert!((set.stake_concentration() - 0.5).abs() < 1e-9);
        assert_eq!(set.total_active_stake(), 1_000);
    }
}
