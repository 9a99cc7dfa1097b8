use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::crypto::{double_sha256, Address, Hash, KeyPair, Signature};
use crate::transaction::Transaction;
use crate::{Result, SynnergyError};

/// Block header
///
/// The header hash is double SHA-256 over the fixed-width layout of every
/// field except the proposer signature, which signs that hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockHeader {
    /// Height in the chain; genesis is 0
    pub height: u64,
    /// Hash of the parent block; zero for genesis
    pub parent_hash: Hash,
    /// Merkle root over the state keys this block changed
    pub state_root: Hash,
    /// Seal time, unix seconds
    pub timestamp: i64,
    /// Address of the proposing validator
    pub proposer: Address,
    /// Difficulty target in leading zero bits; 0 outside PoW
    pub difficulty: u32,
    /// Nonce ground by the PoW sealer
    pub nonce: u64,
    /// Proposer signature over the header hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// Intermediate transaction batch produced inside a block interval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubBlock {
    /// Proposer that batched these transactions
    pub proposer: Address,
    /// Ordered transactions
    pub transactions: Vec<Transaction>,
    /// Batch time, unix seconds
    pub timestamp: i64,
    /// Batch digest
    pub hash: Hash,
}

impl SubBlock {
    pub fn new(proposer: Address, transactions: Vec<Transaction>) -> Self {
        let timestamp = Utc::now().timestamp();
        let hash = Self::compute_hash(&proposer, &transactions, timestamp);
        SubBlock {
            proposer,
            transactions,
            timestamp,
            hash,
        }
    }

    fn compute_hash(proposer: &Address, transactions: &[Transaction], timestamp: i64) -> Hash {
        let mut bytes = Vec::with_capacity(28 + transactions.len() * 32);
        bytes.extend_from_slice(proposer.as_bytes());
        bytes.extend_from_slice(&timestamp.to_le_bytes());
        for tx in transactions {
            bytes.extend_from_slice(tx.hash.as_bytes());
        }
        double_sha256(&bytes)
    }

    /// Recheck the batch digest; gossiped sub-blocks are dropped when it
    /// does not match
    pub fn verify(&self) -> bool {
        self.hash == Self::compute_hash(&self.proposer, &self.transactions, self.timestamp)
    }
}

/// A sealed block: header, ordered transactions, sub-block references
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Hashes of the sub-blocks aggregated into this block
    pub sub_blocks: Vec<Hash>,
}

impl Block {
    /// Assemble an unsealed block
    pub fn new(
        height: u64,
        parent_hash: Hash,
        state_root: Hash,
        proposer: Address,
        difficulty: u32,
        transactions: Vec<Transaction>,
        sub_blocks: Vec<Hash>,
    ) -> Self {
        let block = Block {
            header: BlockHeader {
                height,
                parent_hash,
                state_root,
                timestamp: Utc::now().timestamp(),
                proposer,
                difficulty,
                nonce: 0,
                signature: None,
            },
            transactions,
            sub_blocks,
        };
        debug!(
            "assembled block {} with {} txs",
            block.header.height,
            block.transactions.len()
        );
        block
    }

    /// Fixed-width header layout used for hashing; excludes the signature
    fn header_wire_bytes(&self) -> Vec<u8> {
        let h = &self.header;
        let mut out = Vec::with_capacity(112);
        out.extend_from_slice(&h.height.to_le_bytes());
        out.extend_from_slice(h.parent_hash.as_bytes());
        out.extend_from_slice(h.state_root.as_bytes());
        out.extend_from_slice(&h.timestamp.to_le_bytes());
        out.extend_from_slice(h.proposer.as_bytes());
        out.extend_from_slice(&h.difficulty.to_le_bytes());
        out.extend_from_slice(&h.nonce.to_le_bytes());
        out
    }

    /// Header hash
    pub fn hash(&self) -> Hash {
        double_sha256(&self.header_wire_bytes())
    }

    /// Sign the header hash as the proposer
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<()> {
        let hash = self.hash();
        self.header.signature = Some(keypair.sign(hash.as_bytes())?);
        Ok(())
    }

    /// Grind the nonce until the header hash meets the difficulty target
    pub fn seal_pow(&mut self) {
        while !hash_meets_difficulty(&self.hash(), self.header.difficulty) {
            self.header.nonce = self.header.nonce.wrapping_add(1);
        }
    }

    /// Structural validation: transaction integrity, difficulty target and,
    /// when present, the proposer signature binding
    pub fn validate(&self) -> Result<()> {
        for tx in &self.transactions {
            tx.verify()?;
        }
        let hash = self.hash();
        if !hash_meets_difficulty(&hash, self.header.difficulty) {
            return Err(SynnergyError::ValidationFailed(format!(
                "block {} misses difficulty target {}",
                hash.short(),
                self.header.difficulty
            )));
        }
        if let Some(sig) = &self.header.signature {
            if !sig.verify_for(hash.as_bytes(), &self.header.proposer)? {
                return Err(SynnergyError::InvalidSignature(format!(
                    "proposer signature does not bind block {}",
                    hash.short()
                )));
            }
        }
        Ok(())
    }

    pub fn is_genesis(&self) -> bool {
        self.header.height == 0 && self.header.parent_hash.is_zero()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "block #{}: {} txs, hash {}",
            self.header.height,
            self.transaction_count(),
            self.hash().short()
        )
    }
}

/// Check a digest against a leading-zero-bit difficulty target
pub fn hash_meets_difficulty(hash: &Hash, difficulty: u32) -> bool {
    let mut remaining = difficulty;
    for byte in hash.as_bytes() {
        if remaining == 0 {
            return true;
        }
        let zeros = byte.leading_zeros();
        if zeros < remaining.min(8) {
            return false;
        }
        if remaining <= 8 {
            return true;
        }
        if *byte != 0 {
            return false;
        }
        remaining -= 8;
    }
    remaining == 0
}
