// Property tests over the wire forms, sharding map, pool laws and the
// payload cipher.

use proptest::prelude::*;

use synnergy::crypto::{decrypt_payload, encrypt_payload, sha256};
use synnergy::merkle::MerkleTree;
use synnergy::pool::TxSource;
use synnergy::sharding::shard_of;
use synnergy::{Address, KeyPair, PoolConfig, Transaction, TxPool};

fn arb_address() -> impl Strategy<Value = Address> {
    proptest::array::uniform20(any::<u8>()).prop_map(Address)
}

proptest! {
    #[test]
    fn transaction_encoding_round_trips(
        to in arb_address(),
        value in any::<u64>(),
        gas_limit in 1u64..1_000_000,
        gas_price in any::<u64>(),
        nonce in any::<u64>(),
        payload in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let keypair = KeyPair::generate().unwrap();
        let from = keypair.address().unwrap();
        prop_assume!(from != to);

        let mut tx = Transaction::new_contract_call(
            from, to, value, payload, gas_limit, gas_price, nonce,
        ).unwrap();
        tx.sign(&keypair).unwrap();

        let decoded = Transaction::from_json(&tx.to_json().unwrap()).unwrap();
        prop_assert_eq!(&decoded, &tx);
        prop_assert_eq!(decoded.compute_hash(), tx.hash);
        prop_assert!(decoded.verify().is_ok());
    }

    #[test]
    fn shard_mapping_is_pure_and_nests(addr in arb_address()) {
        let ten = shard_of(&addr, 10);
        prop_assert!(ten < 1024);
        prop_assert_eq!(ten, shard_of(&addr, 10));

        // widening the shard space refines the partition: the old shard
        // id is a prefix of the new one
        for bits in 11..=12u8 {
            let wide = shard_of(&addr, bits);
            prop_assert_eq!(wide >> (bits - 10), ten);
        }
    }

    #[test]
    fn pool_pick_conserves_transactions(
        count in 1usize..24,
        picked_n in 0usize..32,
    ) {
        let pool = TxPool::new(PoolConfig::default());
        for i in 0..count {
            let keypair = KeyPair::generate().unwrap();
            let mut tx = Transaction::new_payment(
                keypair.address().unwrap(),
                Address([0xBB; 20]),
                i as u64 + 1,
                21,
                1,
                0,
            ).unwrap();
            tx.sign(&keypair).unwrap();
            pool.add_tx(tx).unwrap();
        }

        prop_assert!(pool.pick(0).is_empty());
        let picked = pool.pick(picked_n);
        prop_assert!(picked.len() <= picked_n);
        prop_assert_eq!(picked.len() + pool.size(), count);
    }

    #[test]
    fn payload_cipher_round_trips(
        key in proptest::array::uniform32(any::<u8>()),
        payload in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let sealed = encrypt_payload(&key, &payload).unwrap();
        prop_assert_eq!(decrypt_payload(&key, &sealed).unwrap(), payload);
    }

    #[test]
    fn merkle_proofs_verify_for_every_leaf(count in 1usize..48) {
        let leaves: Vec<_> = (0..count).map(|i| sha256(&(i as u64).to_le_bytes())).collect();
        let tree = MerkleTree::from_leaves(leaves.clone());
        let root = tree.root().unwrap();

        for (i, leaf) in leaves.iter().enumerate() {
            let proof = tree.generate_proof(i).unwrap();
            prop_assert!(MerkleTree::verify_proof(&root, leaf, &proof));
        }
    }
}
