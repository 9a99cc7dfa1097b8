use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::authority::AuthoritySet;
use crate::block::{Block, SubBlock};
use crate::crypto::{sha256, Address, Hash, KeyPair, Signature};
use crate::ledger::ChainAppend;
use crate::network::{
    Network, Subscription, TOPIC_BLOCK, TOPIC_POS_VOTE, TOPIC_SUBBLOCK, TOPIC_VIEW_CHANGE,
};
use crate::pool::TxSource;
use crate::state::StateStore;
use crate::{Result, SynnergyError};

/// State key holding the persisted consensus mode
pub const MODE_KEY: &[u8] = b"consensus:mode";

/// Consensus modes the engine hops between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMode {
    ProofOfWork,
    ProofOfStake,
    ProofOfHistory,
}

impl ConsensusMode {
    /// Canonical string persisted at `consensus:mode`
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusMode::ProofOfWork => "pow",
            ConsensusMode::ProofOfStake => "pos",
            ConsensusMode::ProofOfHistory => "poh",
        }
    }
}

impl std::fmt::Display for ConsensusMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConsensusMode {
    type Err = SynnergyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pow" => Ok(ConsensusMode::ProofOfWork),
            "pos" => Ok(ConsensusMode::ProofOfStake),
            "poh" => Ok(ConsensusMode::ProofOfHistory),
            other => Err(SynnergyError::ConsensusError(format!(
                "unknown consensus mode {:?}",
                other
            ))),
        }
    }
}

/// Mode selection threshold over mempool demand and stake concentration,
/// both in [0, 1]
///
/// Pressure on either axis pushes toward the heavier modes: PoW handles a
/// load spike or concentrated stake, PoH is only reachable when both are
/// low.
pub fn threshold(demand: f64, stake: f64) -> f64 {
    demand.clamp(0.0, 1.0).max(stake.clamp(0.0, 1.0))
}

/// Map a threshold value onto the mode bands
pub fn mode_for(t: f64) -> ConsensusMode {
    if t < 0.33 {
        ConsensusMode::ProofOfHistory
    } else if t < 0.66 {
        ConsensusMode::ProofOfStake
    } else {
        ConsensusMode::ProofOfWork
    }
}

/// A stake holder's vote for a block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PosVote {
    pub block_hash: Hash,
    pub signature: Signature,
}

impl PosVote {
    pub fn new(block_hash: Hash, keypair: &KeyPair) -> Result<Self> {
        Ok(PosVote {
            block_hash,
            signature: keypair.sign(block_hash.as_bytes())?,
        })
    }

    /// Verify the signature and return the voter address
    pub fn verify(&self) -> Result<Address> {
        if !self.signature.verify(self.block_hash.as_bytes())? {
            return Err(SynnergyError::InvalidSignature(
                "vote signature does not verify".to_string(),
            ));
        }
        self.signature.signer()
    }
}

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Cadence of the sub-block proposal loop
    pub subblock_interval: Duration,
    /// Transactions per sub-block batch
    pub subblock_max_txs: usize,
    /// Seal a block once this many transactions are aggregated
    pub block_max_txs: usize,
    /// Or once this much time has passed since the last block
    pub block_max_interval: Duration,
    /// Leading-zero-bit target applied in PoW mode
    pub pow_difficulty: u32,
    /// Duplicate view-change proposals inside this window collapse to one
    pub view_change_window: Duration,
    /// Gossip retry attempts with exponential backoff
    pub gossip_retries: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            subblock_interval: Duration::from_millis(250),
            subblock_max_txs: 128,
            block_max_txs: 512,
            block_max_interval: Duration::from_secs(2),
            pow_difficulty: 8,
            view_change_window: Duration::from_secs(5),
            gossip_retries: 3,
        }
    }
}

struct EngineState {
    view: u64,
    last_view_change: Option<Instant>,
    pending: Vec<SubBlock>,
    votes: HashMap<Hash, HashMap<Address, u64>>,
    mode: ConsensusMode,
    last_block_at: Instant,
}

/// Hybrid consensus engine
///
/// Runs a sub-block proposal loop and a block aggregation loop, hopping
/// between PoW, PoS and PoH at block boundaries based on mempool demand and
/// stake concentration. PoS votes accumulate per block hash; a block is
/// committed once more than two thirds of active stake stands behind it.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    pool: Arc<dyn TxSource>,
    chain: Arc<dyn ChainAppend>,
    authorities: Arc<AuthoritySet>,
    network: Arc<dyn Network>,
    store: Arc<StateStore>,
    keypair: KeyPair,
    address: Address,
    state: Mutex<EngineState>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    vote_sub: Mutex<Option<Subscription>>,
    view_sub: Mutex<Option<Subscription>>,
    subblock_sub: Mutex<Option<Subscription>>,
    block_sub: Mutex<Option<Subscription>>,
}

impl ConsensusEngine {
    pub fn new(
        config: ConsensusConfig,
        pool: Arc<dyn TxSource>,
        chain: Arc<dyn ChainAppend>,
        authorities: Arc<AuthoritySet>,
        network: Arc<dyn Network>,
        store: Arc<StateStore>,
        keypair: KeyPair,
    ) -> Result<Self> {
        let address = keypair.address()?;
        let mode = match store.get(MODE_KEY).map_err(SynnergyError::from)? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(ConsensusMode::ProofOfHistory),
            None => ConsensusMode::ProofOfHistory,
        };
        Ok(ConsensusEngine {
            config,
            pool,
            chain,
            authorities,
            network,
            store,
            keypair,
            address,
            state: Mutex::new(EngineState {
                view: 0,
                last_view_change: None,
                pending: Vec::new(),
                votes: HashMap::new(),
                mode,
                last_block_at: Instant::now(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            vote_sub: Mutex::new(None),
            view_sub: Mutex::new(None),
            subblock_sub: Mutex::new(None),
            block_sub: Mutex::new(None),
        })
    }

    /// Currently active mode
    pub fn mode(&self) -> ConsensusMode {
        self.state.lock().mode
    }

    /// Current view number
    pub fn view(&self) -> u64 {
        self.state.lock().view
    }

    /// Recompute the mode from live demand and stake concentration and
    /// persist it; called only at block boundaries
    pub fn evaluate_mode(&self) -> Result<ConsensusMode> {
        let demand = self.pool.pressure();
        let stake = self.authorities.stake_concentration();
        let mode = mode_for(threshold(demand, stake));

        let mut state = self.state.lock();
        if state.mode != mode {
            info!(
                "consensus mode {} -> {} (demand {:.2}, stake {:.2})",
                state.mode, mode, demand, stake
            );
        }
        state.mode = mode;
        drop(state);

        self.store
            .set(MODE_KEY, mode.as_str().as_bytes())
            .map_err(SynnergyError::from)?;
        Ok(mode)
    }

    /// Deterministic leader for a slot under the given mode
    ///
    /// PoS weights active authorities by bonded stake; PoH walks an
    /// iterated-hash chain over the parent hash. PoW has no pre-assigned
    /// leader: whoever meets the target first wins the slot.
    pub fn leader_for(&self, height: u64, parent: &Hash, view: u64, mode: ConsensusMode) -> Option<Address> {
        let mut candidates: Vec<(Address, u64)> = self
            .authorities
            .list_authorities()
            .into_iter()
            .filter(|n| n.active)
            .map(|n| (n.addr, self.authorities.stake_of(&n.addr)))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|(addr, _)| *addr);

        let mut seed_bytes = parent.as_bytes().to_vec();
        seed_bytes.extend_from_slice(&height.to_le_bytes());
        seed_bytes.extend_from_slice(&view.to_le_bytes());

        match mode {
            ConsensusMode::ProofOfWork => None,
            ConsensusMode::ProofOfStake => {
                let total: u64 = candidates.iter().map(|(_, s)| s).sum();
                if total == 0 {
                    return candidates.first().map(|(a, _)| *a);
                }
                let seed = sha256(&seed_bytes);
                let point =
                    u64::from_le_bytes(seed.as_bytes()[..8].try_into().unwrap()) % total;
                let mut acc = 0u64;
                for (addr, stake) in &candidates {
                    acc += stake;
                    if point < acc {
                        return Some(*addr);
                    }
                }
                candidates.last().map(|(a, _)| *a)
            }
            ConsensusMode::ProofOfHistory => {
                // verifiable delay stand-in: an iterated hash chain any
                // peer can recompute
                let mut tick = sha256(&seed_bytes);
                for _ in 0..64 {
                    tick = sha256(tick.as_bytes());
                }
                let idx = u64::from_le_bytes(tick.as_bytes()[..8].try_into().unwrap())
                    % candidates.len() as u64;
                candidates.get(idx as usize).map(|(a, _)| *a)
            }
        }
    }

    /// Gossip with bounded exponential backoff
    async fn broadcast_with_retry(&self, topic: &str, payload: &[u8]) {
        let mut delay = Duration::from_millis(50);
        for attempt in 0..=self.config.gossip_retries {
            match self.network.broadcast(topic, payload) {
                Ok(()) => return,
                Err(e) if attempt < self.config.gossip_retries => {
                    debug!("gossip on {} failed (attempt {}): {}", topic, attempt + 1, e);
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    warn!("giving up gossip on {}: {}", topic, e);
                    return;
                }
            }
        }
    }

    /// Pick a batch from the pool and propose it as a sub-block
    pub async fn propose_subblock(&self) -> Option<SubBlock> {
        let txs = self.pool.pick(self.config.subblock_max_txs);
        if txs.is_empty() {
            return None;
        }
        let subblock = SubBlock::new(self.address, txs);
        if let Ok(json) = serde_json::to_string(&subblock) {
            self.broadcast_with_retry(TOPIC_SUBBLOCK, json.as_bytes()).await;
        }
        let mut state = self.state.lock();
        state.pending.push(subblock.clone());
        debug!(
            "proposed sub-block {} ({} txs, {} pending)",
            subblock.hash.short(),
            subblock.transactions.len(),
            state.pending.len()
        );
        Some(subblock)
    }

    /// Aggregate a sub-block received from a peer
    ///
    /// Our own proposals are already pending, so echoes of them (and any
    /// batch already aggregated) are dropped.
    pub fn ingest_subblock(&self, subblock: SubBlock) {
        if subblock.proposer == self.address {
            return;
        }
        let mut state = self.state.lock();
        if state.pending.iter().any(|s| s.hash == subblock.hash) {
            return;
        }
        state.pending.push(subblock);
    }

    /// Validate and append a block proposed by a peer
    ///
    /// Replication keeps every committed node at the same state root: the
    /// ledger re-executes the block's transactions and rejects it on any
    /// mismatch. Blocks this node proposed, or already holds, are ignored.
    /// A root mismatch advances the view so the next leader takes over.
    pub fn ingest_block(&self, block: &Block) -> Result<()> {
        if block.header.proposer == self.address {
            return Ok(());
        }
        match self.chain.append_block(block) {
            Ok(()) => {
                let mut state = self.state.lock();
                state.pending.retain(|s| !block.sub_blocks.contains(&s.hash));
                state.last_block_at = Instant::now();
                info!(
                    "replicated block {} from {}",
                    block.header.height, block.header.proposer
                );
                Ok(())
            }
            Err(SynnergyError::DuplicateHeight(_)) => Ok(()),
            Err(e @ SynnergyError::RootMismatch { .. }) => {
                warn!(
                    "replicated block {} does not reproduce its root: {}",
                    block.header.height, e
                );
                let _ = self.advance_view("state root mismatch on replicated block");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn pending_tx_count(&self) -> usize {
        self.state
            .lock()
            .pending
            .iter()
            .map(|s| s.transactions.len())
            .sum()
    }

    fn seal_due(&self) -> bool {
        let state = self.state.lock();
        let pending: usize = state.pending.iter().map(|s| s.transactions.len()).sum();
        pending >= self.config.block_max_txs
            || (pending > 0 && state.last_block_at.elapsed() >= self.config.block_max_interval)
    }

    /// Seal the aggregated sub-blocks into a block and append it
    ///
    /// Returns `Ok(None)` when this node is not the slot leader or nothing
    /// is pending. A failed append is not retried in this slot: a root
    /// mismatch additionally triggers a view change so the next leader
    /// takes over.
    pub async fn try_seal_block(&self) -> Result<Option<Block>> {
        if self.pending_tx_count() == 0 {
            return Ok(None);
        }

        // mode transitions happen here, at the block boundary
        let mode = self.evaluate_mode()?;

        let height = self.chain.last_height().map(|h| h + 1).unwrap_or(0);
        let parent = self.chain.last_hash();
        let view = self.view();

        if let Some(leader) = self.leader_for(height, &parent, view, mode) {
            if leader != self.address {
                debug!("slot {} belongs to {}, standing by", height, leader);
                return Ok(None);
            }
        }

        // gather unique transactions in sub-block order
        let (txs, sub_hashes) = {
            let state = self.state.lock();
            let mut seen = std::collections::HashSet::new();
            let mut txs = Vec::new();
            let mut hashes = Vec::with_capacity(state.pending.len());
            for sub in &state.pending {
                hashes.push(sub.hash);
                for tx in &sub.transactions {
                    if seen.insert(tx.hash) {
                        txs.push(tx.clone());
                    }
                }
            }
            (txs, hashes)
        };

        let (root, included) = self.chain.preview(&txs)?;
        let difficulty = if mode == ConsensusMode::ProofOfWork {
            self.config.pow_difficulty
        } else {
            0
        };
        let mut block = Block::new(
            height,
            parent,
            root,
            self.address,
            difficulty,
            included,
            sub_hashes,
        );
        if mode == ConsensusMode::ProofOfWork {
            block.seal_pow();
        }
        block.sign(&self.keypair)?;

        match self.chain.append_block(&block) {
            Ok(()) => {}
            Err(e @ SynnergyError::RootMismatch { .. }) => {
                warn!("append failed at height {}: {}", height, e);
                self.propose_view_change("state root mismatch on append").await;
                return Err(e);
            }
            Err(e) => {
                warn!("block proposal at height {} failed: {}", height, e);
                return Err(e);
            }
        }

        if let Ok(json) = serde_json::to_string(&block) {
            self.broadcast_with_retry(TOPIC_BLOCK, json.as_bytes()).await;
        }

        let mut state = self.state.lock();
        state.pending.clear();
        state.last_block_at = Instant::now();
        info!("sealed block {} under {}", block.header.height, mode);
        Ok(Some(block))
    }

    /// Tally a PoS vote; returns true once the block is committed
    ///
    /// Commitment requires the stake behind valid votes for the hash to
    /// exceed two thirds of active stake.
    pub fn handle_vote(&self, vote: &PosVote) -> Result<bool> {
        let voter = vote.verify()?;
        let stake = self.authorities.stake_of(&voter);
        if stake == 0 {
            return Err(SynnergyError::InsufficientStake {
                address: voter.to_hex(),
                stake: 0,
                required: 1,
            });
        }

        let mut state = self.state.lock();
        let tally = state.votes.entry(vote.block_hash).or_default();
        tally.insert(voter, stake);
        let behind: u64 = tally.values().sum();
        drop(state);

        let total = self.authorities.total_active_stake();
        let committed = total > 0 && behind * 3 > total * 2;
        if committed {
            debug!(
                "block {} committed with {}/{} stake",
                vote.block_hash.short(),
                behind,
                total
            );
        }
        Ok(committed)
    }

    /// Whether the tallied votes already commit this block
    pub fn is_committed(&self, block_hash: &Hash) -> bool {
        let behind: u64 = self
            .state
            .lock()
            .votes
            .get(block_hash)
            .map(|t| t.values().sum())
            .unwrap_or(0);
        let total = self.authorities.total_active_stake();
        total > 0 && behind * 3 > total * 2
    }

    /// Advance the view unless a change already landed inside the window;
    /// returns the new view number when one was taken
    fn advance_view(&self, reason: &str) -> Option<u64> {
        let mut state = self.state.lock();
        if let Some(at) = state.last_view_change {
            if at.elapsed() < self.config.view_change_window {
                return None;
            }
        }
        state.view += 1;
        state.last_view_change = Some(Instant::now());
        warn!("view change to {}: {}", state.view, reason);
        Some(state.view)
    }

    /// Skip the current proposer and advance the view
    ///
    /// Idempotent inside the view-change window: duplicate proposals
    /// collapse into the one already taken.
    pub async fn propose_view_change(&self, reason: &str) -> u64 {
        match self.advance_view(reason) {
            Some(view) => {
                self.broadcast_with_retry(TOPIC_VIEW_CHANGE, reason.as_bytes()).await;
                view
            }
            None => self.view(),
        }
    }

    fn drain_inbound(&self) {
        // sub-blocks before blocks: a block's append prunes the pending
        // sub-blocks it aggregated, including ones drained just now
        if let Some(sub) = &*self.subblock_sub.lock() {
            while let Ok(msg) = sub.receiver.try_recv() {
                if let Ok(subblock) = serde_json::from_slice::<SubBlock>(&msg.payload) {
                    if subblock.verify() {
                        self.ingest_subblock(subblock);
                    } else {
                        debug!("discarded sub-block with bad digest from {}", msg.sender);
                    }
                }
            }
        }
        if let Some(sub) = &*self.block_sub.lock() {
            while let Ok(msg) = sub.receiver.try_recv() {
                if let Ok(block) = serde_json::from_slice::<Block>(&msg.payload) {
                    if let Err(e) = self.ingest_block(&block) {
                        debug!("discarded block from {}: {}", msg.sender, e);
                    }
                }
            }
        }
        if let Some(sub) = &*self.vote_sub.lock() {
            while let Ok(msg) = sub.receiver.try_recv() {
                if let Ok(vote) = serde_json::from_slice::<PosVote>(&msg.payload) {
                    if let Err(e) = self.handle_vote(&vote) {
                        debug!("discarded vote from {}: {}", msg.sender, e);
                    }
                }
            }
        }
        if let Some(sub) = &*self.view_sub.lock() {
            let mut changed = false;
            while sub.receiver.try_recv().is_ok() {
                changed = true;
            }
            if changed {
                let _ = self.advance_view("view change received from peer");
            }
        }
    }

    fn attach_subscriptions(&self) {
        *self.vote_sub.lock() = Some(self.network.subscribe(TOPIC_POS_VOTE));
        *self.view_sub.lock() = Some(self.network.subscribe(TOPIC_VIEW_CHANGE));
        *self.subblock_sub.lock() = Some(self.network.subscribe(TOPIC_SUBBLOCK));
        *self.block_sub.lock() = Some(self.network.subscribe(TOPIC_BLOCK));
    }

    /// Spawn the sub-block and block loops; idempotent
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.attach_subscriptions();

        let engine = Arc::clone(self);
        let subblock_task = tokio::spawn(async move {
            while engine.running.load(Ordering::SeqCst) {
                engine.propose_subblock().await;
                sleep(engine.config.subblock_interval).await;
            }
        });

        let engine = Arc::clone(self);
        let block_task = tokio::spawn(async move {
            while engine.running.load(Ordering::SeqCst) {
                engine.drain_inbound();
                if engine.seal_due() {
                    if let Err(e) = engine.try_seal_block().await {
                        debug!("seal attempt failed: {}", e);
                    }
                }
                sleep(Duration::from_millis(50)).await;
            }
        });

        self.tasks.lock().extend([subblock_task, block_task]);
        info!("consensus engine started as {}", self.address);
    }

    /// Cancel the loops and wait for them to exit; idempotent
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for slot in [&self.vote_sub, &self.view_sub, &self.subblock_sub, &self.block_sub] {
            if let Some(sub) = slot.lock().take() {
                sub.cancel();
            }
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("consensus engine stopped");
    }
}
