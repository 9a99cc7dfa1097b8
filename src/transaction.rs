use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::crypto::{double_sha256, Address, Hash, KeyPair, Signature};
use crate::{Result, SynnergyError};

/// Transaction variants carried by the core
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TxType {
    /// Native coin transfer
    Payment,
    /// Invocation of a deployed contract
    ContractCall,
    /// Authority-gated reversal of a prior transaction
    Reversal,
}

impl TxType {
    /// Single wire byte for the canonical layout
    pub fn wire_byte(&self) -> u8 {
        match self {
            TxType::Payment => 0,
            TxType::ContractCall => 1,
            TxType::Reversal => 2,
        }
    }
}

/// A signed transaction
///
/// The hash is a pure function of every field except the signatures: double
/// SHA-256 over the canonical wire layout with little-endian fixed-width
/// integers. Optional fields encode as empty bytes (payloads) or the zero
/// hash (original transaction), so the layout stays positional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    /// Transaction variant
    pub tx_type: TxType,
    /// Sender address
    pub from: Address,
    /// Recipient, or contract address for calls
    pub to: Address,
    /// Native value moved
    pub value: u64,
    /// Gas ceiling the sender is willing to pay for
    pub gas_limit: u64,
    /// Price per gas unit
    pub gas_price: u64,
    /// Sender account nonce at admission
    pub nonce: u64,
    /// Call data or memo
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    /// AES-256-GCM sealed payload, if any
    #[serde(default, with = "hex_opt", skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<Vec<u8>>,
    /// Hash of the transaction being reversed, for reversals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_tx: Option<Hash>,
    /// Creation time, unix seconds
    pub timestamp: i64,
    /// Sender signature over the transaction hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<Signature>,
    /// Authority co-signatures, required for reversals
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth_sigs: Vec<Signature>,
    /// Cached transaction hash
    pub hash: Hash,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        s.map(|s| hex::decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

impl Transaction {
    /// Create an unsigned payment
    pub fn new_payment(
        from: Address,
        to: Address,
        value: u64,
        gas_limit: u64,
        gas_price: u64,
        nonce: u64,
    ) -> Result<Self> {
        if from == to {
            return Err(SynnergyError::ValidationFailed(
                "sender and recipient cannot be the same".to_string(),
            ));
        }
        let mut tx = Transaction {
            tx_type: TxType::Payment,
            from,
            to,
            value,
            gas_limit,
            gas_price,
            nonce,
            payload: Vec::new(),
            encrypted_payload: None,
            original_tx: None,
            timestamp: Utc::now().timestamp(),
            sig: None,
            auth_sigs: Vec::new(),
            hash: Hash::zero(),
        };
        tx.hash = tx.compute_hash();
        debug!("created payment {}", tx.hash.short());
        Ok(tx)
    }

    /// Create an unsigned contract call
    pub fn new_contract_call(
        from: Address,
        contract: Address,
        value: u64,
        payload: Vec<u8>,
        gas_limit: u64,
        gas_price: u64,
        nonce: u64,
    ) -> Result<Self> {
        if gas_limit == 0 {
            return Err(SynnergyError::ValidationFailed(
                "contract call requires a non-zero gas limit".to_string(),
            ));
        }
        let mut tx = Transaction {
            tx_type: TxType::ContractCall,
            from,
            to: contract,
            value,
            gas_limit,
            gas_price,
            nonce,
            payload,
            encrypted_payload: None,
            original_tx: None,
            timestamp: Utc::now().timestamp(),
            sig: None,
            auth_sigs: Vec::new(),
            hash: Hash::zero(),
        };
        tx.hash = tx.compute_hash();
        Ok(tx)
    }

    /// Create an unsigned reversal of `original`
    ///
    /// `from` and `to` mirror the original's recipient and sender; value is
    /// the amount flowing back. Admission additionally demands three active
    /// authority co-signatures.
    pub fn new_reversal(
        from: Address,
        to: Address,
        value: u64,
        original: Hash,
        gas_limit: u64,
        gas_price: u64,
        nonce: u64,
    ) -> Result<Self> {
        if original.is_zero() {
            return Err(SynnergyError::ValidationFailed(
                "reversal requires the original transaction hash".to_string(),
            ));
        }
        let mut tx = Transaction {
            tx_type: TxType::Reversal,
            from,
            to,
            value,
            gas_limit,
            gas_price,
            nonce,
            payload: Vec::new(),
            encrypted_payload: None,
            original_tx: Some(original),
            timestamp: Utc::now().timestamp(),
            sig: None,
            auth_sigs: Vec::new(),
            hash: Hash::zero(),
        };
        tx.hash = tx.compute_hash();
        Ok(tx)
    }

    /// Canonical wire layout used for hashing
    ///
    /// `type(1) || from(20) || to(20) || value(8 LE) || gasLimit(8 LE) ||
    /// gasPrice(8 LE) || nonce(8 LE) || payload || encryptedPayload ||
    /// originalTx(32) || timestamp(8 LE)`
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.payload.len());
        out.push(self.tx_type.wire_byte());
        out.extend_from_slice(self.from.as_bytes());
        out.extend_from_slice(self.to.as_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.gas_limit.to_le_bytes());
        out.extend_from_slice(&self.gas_price.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(&self.payload);
        if let Some(sealed) = &self.encrypted_payload {
            out.extend_from_slice(sealed);
        }
        out.extend_from_slice(self.original_tx.unwrap_or_else(Hash::zero).as_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    /// Double SHA-256 over the wire layout
    pub fn compute_hash(&self) -> Hash {
        double_sha256(&self.wire_bytes())
    }

    /// Sign the transaction hash with the sender key
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<()> {
        self.hash = self.compute_hash();
        let sig = keypair.sign(self.hash.as_bytes())?;
        self.sig = Some(sig);
        Ok(())
    }

    /// Append an authority co-signature over the transaction hash
    pub fn add_auth_sig(&mut self, keypair: &KeyPair) -> Result<()> {
        let sig = keypair.sign(self.hash.as_bytes())?;
        self.auth_sigs.push(sig);
        Ok(())
    }

    /// Verify structure, cached hash and sender signature
    pub fn verify(&self) -> Result<()> {
        let recomputed = self.compute_hash();
        if recomputed != self.hash {
            return Err(SynnergyError::MalformedPayload(format!(
                "hash mismatch: declared {}, computed {}",
                self.hash.short(),
                recomputed.short()
            )));
        }
        if self.tx_type == TxType::Reversal && self.original_tx.is_none() {
            return Err(SynnergyError::MalformedPayload(
                "reversal without original transaction hash".to_string(),
            ));
        }
        let sig = self.sig.as_ref().ok_or_else(|| {
            SynnergyError::InvalidSignature("transaction is unsigned".to_string())
        })?;
        if !sig.verify_for(self.hash.as_bytes(), &self.from)? {
            return Err(SynnergyError::InvalidSignature(format!(
                "signature does not bind {} to {}",
                self.hash.short(),
                self.from
            )));
        }
        Ok(())
    }

    /// Maximum fee the sender commits to: `gas_limit * gas_price`
    pub fn fee(&self) -> u64 {
        self.gas_limit.saturating_mul(self.gas_price)
    }

    /// Value plus maximum fee; the admission balance requirement
    pub fn total_cost(&self) -> u64 {
        self.value.saturating_add(self.fee())
    }

    /// Approximate wire size, used by pool byte accounting
    pub fn size(&self) -> usize {
        self.wire_bytes().len()
            + self.sig.as_ref().map(|s| s.bytes.len() + s.public_key.len()).unwrap_or(0)
            + self
                .auth_sigs
                .iter()
                .map(|s| s.bytes.len() + s.public_key.len())
                .sum::<usize>()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(SynnergyError::from)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let tx: Transaction = serde_json::from_str(json)?;
        Ok(tx)
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tx {} ({:?}): {} -> {} value {}",
            self.hash.short(),
            self.tx_type,
            self.from,
            self.to,
            self.value
        )
    }
}
