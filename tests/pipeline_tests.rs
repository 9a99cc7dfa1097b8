// End-to-end scenarios across the ledger, pool, authority set, shard
// coordinator and consensus engine.

use std::sync::Arc;

use synnergy::consensus::MODE_KEY;
use synnergy::ledger::{ChainAppend, LedgerView};
use synnergy::pool::TxSource;
use synnergy::sharding::shard_of;
use synnergy::{
    Address, AuthorityRole, AuthoritySet, Block, ConsensusConfig, ConsensusEngine, CrossShardTx,
    KeyPair, Ledger, PoolConfig, StateStore, SynnergyError, Transaction, TxPool, FEE_SINK,
    SHARD_BITS,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn addr(b: u8) -> Address {
    Address([b; 20])
}

fn signed_payment(from: &KeyPair, to: Address, value: u64, nonce: u64) -> Transaction {
    let mut tx = Transaction::new_payment(from.address().unwrap(), to, value, 21, 1, nonce).unwrap();
    tx.sign(from).unwrap();
    tx
}

/// Execute the given transactions into the next block and append it
fn seal_and_append(ledger: &Ledger, txs: Vec<Transaction>) -> Block {
    let (root, included) = ledger.preview(&txs).unwrap();
    let block = Block::new(
        ledger.last_height().unwrap() + 1,
        ledger.last_hash(),
        root,
        Address::zero(),
        0,
        included,
        Vec::new(),
    );
    ledger.append_block(&block).unwrap();
    block
}

#[test]
fn signed_payment_moves_value_and_burns_gas() {
    init_logging();
    let store = Arc::new(StateStore::temporary().unwrap());
    let authorities = Arc::new(AuthoritySet::new(store.clone()).unwrap());
    let ledger = Arc::new(Ledger::new(store, FEE_SINK, authorities).unwrap());
    let alice = KeyPair::generate().unwrap();
    let alice_addr = alice.address().unwrap();
    let bob = addr(0xB0);

    ledger.init_genesis(&[(alice_addr, 1_000)]).unwrap();

    let pool = TxPool::new(PoolConfig::default()).with_ledger(ledger.clone());
    pool.add_tx(signed_payment(&alice, bob, 100, 0)).unwrap();

    let txs = pool.pick(16);
    assert_eq!(txs.len(), 1);
    seal_and_append(&ledger, txs);

    assert_eq!(ledger.balance_of(&alice_addr), 879);
    assert_eq!(ledger.nonce_of(&alice_addr), 1);
    assert_eq!(ledger.balance_of(&bob), 100);
    assert_eq!(ledger.balance_of(&FEE_SINK), 21);
}

#[test]
fn nonce_gap_rejected_at_admission() {
    let store = Arc::new(StateStore::temporary().unwrap());
    let authorities = Arc::new(AuthoritySet::new(store.clone()).unwrap());
    let ledger = Arc::new(Ledger::new(store, FEE_SINK, authorities).unwrap());
    let alice = KeyPair::generate().unwrap();
    let alice_addr = alice.address().unwrap();

    ledger.init_genesis(&[(alice_addr, 1_000)]).unwrap();
    let pool = TxPool::new(PoolConfig::default()).with_ledger(ledger.clone());

    // nonce 1 submitted before nonce 0
    let result = pool.add_tx(signed_payment(&alice, addr(0xB0), 100, 1));
    assert!(matches!(
        result,
        Err(SynnergyError::NonceMismatch { expected: 0, found: 1 })
    ));
    assert_eq!(pool.size(), 0);
    assert_eq!(ledger.balance_of(&alice_addr), 1_000);
    assert_eq!(ledger.nonce_of(&alice_addr), 0);
}

#[test]
fn authority_promotion_flips_on_the_510th_vote() {
    let store = Arc::new(StateStore::temporary().unwrap());
    let set = AuthoritySet::new(store).unwrap();
    let candidate = addr(0xC0);

    set.register_candidate(candidate, AuthorityRole::StandardAuthority, addr(0xEE))
        .unwrap();

    let mut voters = Vec::new();
    for i in 0..500u64 {
        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(&i.to_le_bytes());
        bytes[19] = 0x77;
        voters.push(Address(bytes));
    }
    for voter in &voters {
        set.record_vote(voter, &candidate).unwrap();
    }
    assert!(!set.is_authority(&candidate));

    let mut authority_voters = Vec::new();
    for i in 0..10u8 {
        let auth = addr(0xD0 + i);
        set.register_genesis_authority(auth, AuthorityRole::Government, addr(0xEE), 1_000)
            .unwrap();
        authority_voters.push(auth);
    }
    for (i, auth) in authority_voters.iter().enumerate() {
        assert!(!set.is_authority(&candidate), "active before vote {}", 501 + i);
        set.record_vote(auth, &candidate).unwrap();
    }
    assert!(set.is_authority(&candidate));

    // any duplicate from a prior voter is rejected after activation too
    assert!(matches!(
        set.record_vote(&voters[42], &candidate),
        Err(SynnergyError::DuplicateVote { .. })
    ));
    assert!(matches!(
        set.record_vote(&authority_voters[0], &candidate),
        Err(SynnergyError::DuplicateVote { .. })
    ));
}

#[test]
fn reversal_needs_three_authorities_and_inverts_the_transfer() {
    let store = Arc::new(StateStore::temporary().unwrap());
    let authorities = Arc::new(AuthoritySet::new(store.clone()).unwrap());
    let ledger = Arc::new(Ledger::new(store, FEE_SINK, authorities.clone()).unwrap());

    let alice = KeyPair::generate().unwrap();
    let alice_addr = alice.address().unwrap();
    let bob = KeyPair::generate().unwrap();
    let bob_addr = bob.address().unwrap();
    ledger.init_genesis(&[(alice_addr, 1_000)]).unwrap();

    let mut auth_keys = Vec::new();
    for i in 0..3u8 {
        let kp = KeyPair::generate().unwrap();
        authorities
            .register_genesis_authority(
                kp.address().unwrap(),
                AuthorityRole::Regulation,
                addr(0xE0 + i),
                500,
            )
            .unwrap();
        auth_keys.push(kp);
    }

    // two funding payments so bob can later cover the reversal fee
    let original = signed_payment(&alice, bob_addr, 100, 0);
    let original_hash = original.hash;
    seal_and_append(&ledger, vec![original, signed_payment(&alice, bob_addr, 100, 1)]);
    assert_eq!(ledger.balance_of(&bob_addr), 200);

    let pool = TxPool::new(PoolConfig::default())
        .with_ledger(ledger.clone())
        .with_authorities(authorities);

    let mut reversal =
        Transaction::new_reversal(bob_addr, alice_addr, 100, original_hash, 21, 1, 0).unwrap();
    reversal.sign(&bob).unwrap();
    reversal.add_auth_sig(&auth_keys[0]).unwrap();
    reversal.add_auth_sig(&auth_keys[1]).unwrap();

    // two valid authority signatures: rejected
    assert!(pool.add_tx(reversal.clone()).is_err());

    // three: admitted, and execution credits the debited party
    reversal.add_auth_sig(&auth_keys[2]).unwrap();
    pool.add_tx(reversal).unwrap();

    let alice_before = ledger.balance_of(&alice_addr);
    seal_and_append(&ledger, pool.pick(16));

    assert_eq!(ledger.balance_of(&alice_addr), alice_before + 100);
    assert_eq!(ledger.balance_of(&bob_addr), 200 - 100 - 21);
}

#[test]
fn cross_shard_receipt_delivered_exactly_once() {
    let store = Arc::new(StateStore::temporary().unwrap());
    let coordinator = synnergy::ShardCoordinator::new(store.clone());

    // find two addresses in different shards
    let origin = addr(0x01);
    let origin_shard = coordinator.shard_of_addr(&origin);
    let dest = (0x02..=0xFF)
        .map(addr)
        .find(|a| shard_of(a, SHARD_BITS) != origin_shard)
        .unwrap();

    let xs = CrossShardTx::new(
        synnergy::crypto::sha256(b"cross-shard payment"),
        origin_shard,
        dest,
        b"amount=5".to_vec(),
        SHARD_BITS,
    );
    let dest_shard = xs.to_shard;
    coordinator.submit_cross_shard(&xs).unwrap();

    // the receipt sits under the literal pending key for the destination
    let key = format!("xs:pending:{}:{}", dest_shard, xs.hash.to_hex());
    assert!(store.has(key.as_bytes()).unwrap());

    // the destination proposer drains it exactly once
    let drained = coordinator.pull_receipts(dest_shard, 8).unwrap();
    assert_eq!(drained, vec![xs]);
    assert!(coordinator.pull_receipts(dest_shard, 8).unwrap().is_empty());
    assert!(!store.has(key.as_bytes()).unwrap());
}

#[test]
fn ledger_resumes_from_persisted_block_log() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let alice = KeyPair::generate().unwrap();
    let alice_addr = alice.address().unwrap();
    let bob = addr(0xB0);

    {
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let authorities = Arc::new(AuthoritySet::new(store.clone()).unwrap());
        let ledger = Ledger::new(store, FEE_SINK, authorities).unwrap();
        ledger.init_genesis(&[(alice_addr, 1_000)]).unwrap();
        seal_and_append(&ledger, vec![signed_payment(&alice, bob, 100, 0)]);
    }

    // a fresh ledger over the same directory rebuilds tip and tx index
    let store = Arc::new(StateStore::open(dir.path()).unwrap());
    let authorities = Arc::new(AuthoritySet::new(store.clone()).unwrap());
    let ledger = Ledger::new(store, FEE_SINK, authorities).unwrap();
    assert_eq!(ledger.last_height(), Some(1));
    assert_eq!(ledger.balance_of(&alice_addr), 879);
    assert_eq!(ledger.balance_of(&bob), 100);

    // and the chain keeps extending from the rebuilt tip
    seal_and_append(&ledger, vec![signed_payment(&alice, bob, 50, 1)]);
    assert_eq!(ledger.last_height(), Some(2));
    assert_eq!(ledger.balance_of(&bob), 150);
}

/// Pool stand-in with an adjustable pressure reading
struct PressurePool {
    pressure: parking_lot::Mutex<f64>,
}

impl TxSource for PressurePool {
    fn pick(&self, _max: usize) -> Vec<Transaction> {
        Vec::new()
    }
    fn size(&self) -> usize {
        0
    }
    fn pressure(&self) -> f64 {
        *self.pressure.lock()
    }
}

#[test]
fn consensus_mode_switches_only_at_block_boundaries() {
    let store = Arc::new(StateStore::temporary().unwrap());
    let authorities = Arc::new(AuthoritySet::new(store.clone()).unwrap());
    let ledger =
        Arc::new(Ledger::new(store.clone(), FEE_SINK, authorities.clone()).unwrap());
    ledger.init_genesis(&[]).unwrap();

    // five equal stakeholders: Herfindahl concentration 0.2
    for i in 0..5u8 {
        authorities
            .register_genesis_authority(addr(0xA0 + i), AuthorityRole::Government, addr(0xEE), 200)
            .unwrap();
    }

    let pool = Arc::new(PressurePool {
        pressure: parking_lot::Mutex::new(0.1),
    });
    let engine = ConsensusEngine::new(
        ConsensusConfig::default(),
        pool.clone(),
        ledger,
        authorities,
        Arc::new(synnergy::GossipHub::new("mode-test")),
        store.clone(),
        KeyPair::generate().unwrap(),
    )
    .unwrap();

    // demand 0.1, stake 0.2: PoH
    engine.evaluate_mode().unwrap();
    assert_eq!(engine.mode(), synnergy::ConsensusMode::ProofOfHistory);
    assert_eq!(store.get(MODE_KEY).unwrap().unwrap(), b"poh".to_vec());

    // demand rises mid-block: the active mode does not move yet
    *pool.pressure.lock() = 0.9;
    assert_eq!(engine.mode(), synnergy::ConsensusMode::ProofOfHistory);

    // at the next block boundary the mode flips to PoW
    engine.evaluate_mode().unwrap();
    assert_eq!(engine.mode(), synnergy::ConsensusMode::ProofOfWork);
    assert_eq!(store.get(MODE_KEY).unwrap().unwrap(), b"pow".to_vec());
}
