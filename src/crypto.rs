use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use ripemd::Ripemd160;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::{Result, SynnergyError};

/// Length of an account address in bytes
pub const ADDRESS_LEN: usize = 20;

/// Length of a digest in bytes
pub const HASH_LEN: usize = 32;

/// Length of a wire signature in bytes (r || s || v)
pub const SIGNATURE_LEN: usize = 65;

/// 20-byte account identifier
///
/// Derived from a 32-byte public key by SHA-256 followed by RIPEMD-160.
/// Serialises as a lowercase hex string so every persisted record stays
/// human-readable and byte-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_LEN]);

/// 32-byte SHA-256 based digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Default for Address {
    fn default() -> Self {
        Address::zero()
    }
}

impl Default for Hash {
    fn default() -> Self {
        Hash::zero()
    }
}

impl Address {
    /// Derive an address from a 32-byte public key
    pub fn from_public_key(public_key: &[u8]) -> Result<Self> {
        if public_key.len() != 32 {
            return Err(SynnergyError::MalformedPayload(
                "public key must be 32 bytes".to_string(),
            ));
        }
        let sha = Sha256::digest(public_key);
        let ripe = Ripemd160::digest(sha);
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&ripe);
        Ok(Address(out))
    }

    /// The all-zero address, reserved as invalid for wallets
    pub fn zero() -> Self {
        Address([0u8; ADDRESS_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        let arr: [u8; ADDRESS_LEN] = bytes.as_slice().try_into().map_err(|_| {
            SynnergyError::MalformedPayload(format!("address must be {} bytes", ADDRESS_LEN))
        })?;
        Ok(Address(arr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = SynnergyError;

    fn from_str(s: &str) -> Result<Self> {
        Address::from_hex(s)
    }
}

impl Hash {
    pub fn zero() -> Self {
        Hash([0u8; HASH_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        let arr: [u8; HASH_LEN] = bytes.as_slice().try_into().map_err(|_| {
            SynnergyError::MalformedPayload(format!("hash must be {} bytes", HASH_LEN))
        })?;
        Ok(Hash(arr))
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

macro_rules! hex_serde {
    ($ty:ident, $visitor:ident, $expecting:expr) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        struct $visitor;

        impl<'de> Visitor<'de> for $visitor {
            type Value = $ty;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str($expecting)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<$ty, E> {
                $ty::from_hex(v).map_err(|e| E::custom(e.to_string()))
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<$ty, D::Error> {
                deserializer.deserialize_str($visitor)
            }
        }
    };
}

hex_serde!(Address, AddressVisitor, "a 40-char hex address");
hex_serde!(Hash, HashVisitor, "a 64-char hex digest");

/// SHA-256 over arbitrary bytes
pub fn sha256(data: &[u8]) -> Hash {
    let digest = Sha256::digest(data);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    Hash(out)
}

/// Double SHA-256, the transaction and block hashing scheme
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&second);
    Hash(out)
}

/// Ed25519 key pair used to sign transactions and blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    /// Public key for verification
    pub public_key: Vec<u8>,
    /// Private key for signing (should be kept secret)
    pub private_key: Vec<u8>,
}

/// Detached signature envelope
///
/// The wire form is 65 bytes: r(32) || s(32) || v(1), with v reserved at
/// zero. Ed25519 has no public-key recovery, so the signer's public key
/// travels alongside the bytes; verification checks both the signature and
/// that the key hashes to the expected sender address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
    /// 65 wire bytes, r || s || v
    #[serde(with = "hex_vec")]
    pub bytes: Vec<u8>,
    /// 32-byte public key of the signer
    #[serde(with = "hex_vec")]
    pub public_key: Vec<u8>,
}

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Result<Self> {
        let mut rng = OsRng;
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);

        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();

        let keypair = KeyPair {
            public_key: verifying_key.to_bytes().to_vec(),
            private_key: signing_key.to_bytes().to_vec(),
        };
        debug!("generated key pair for {}", keypair.address()?);
        Ok(keypair)
    }

    /// Rebuild a key pair from 32 private-key bytes
    pub fn from_private_key_bytes(private_key: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = private_key.try_into().map_err(|_| {
            SynnergyError::MalformedPayload("private key must be 32 bytes".to_string())
        })?;
        let signing_key = SigningKey::from_bytes(&secret);
        Ok(KeyPair {
            public_key: signing_key.verifying_key().to_bytes().to_vec(),
            private_key: secret.to_vec(),
        })
    }

    /// The address this key pair controls
    pub fn address(&self) -> Result<Address> {
        Address::from_public_key(&self.public_key)
    }

    /// Sign a message, producing the 65-byte wire signature
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let secret: [u8; 32] = self.private_key.as_slice().try_into().map_err(|_| {
            SynnergyError::MalformedPayload("private key must be 32 bytes".to_string())
        })?;
        let signing_key = SigningKey::from_bytes(&secret);
        let sig = signing_key.sign(message);

        let mut bytes = sig.to_bytes().to_vec();
        bytes.push(0); // v, reserved
        Ok(Signature {
            bytes,
            public_key: self.public_key.clone(),
        })
    }
}

impl Signature {
    /// Verify the signature over a message
    pub fn verify(&self, message: &[u8]) -> Result<bool> {
        if self.bytes.len() != SIGNATURE_LEN {
            return Err(SynnergyError::InvalidSignature(format!(
                "signature must be {} bytes, got {}",
                SIGNATURE_LEN,
                self.bytes.len()
            )));
        }
        let key_bytes: [u8; 32] = self.public_key.as_slice().try_into().map_err(|_| {
            SynnergyError::InvalidSignature("public key must be 32 bytes".to_string())
        })?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| SynnergyError::InvalidSignature(format!("bad public key: {}", e)))?;

        let sig_bytes: [u8; 64] = self.bytes[..64].try_into().map_err(|_| {
            SynnergyError::InvalidSignature("truncated signature".to_string())
        })?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        Ok(verifying_key.verify(message, &sig).is_ok())
    }

    /// Verify the signature and check that the signer key hashes to `expected`
    pub fn verify_for(&self, message: &[u8], expected: &Address) -> Result<bool> {
        let signer = Address::from_public_key(&self.public_key)?;
        if signer != *expected {
            return Ok(false);
        }
        self.verify(message)
    }

    /// Address derived from the signer public key
    pub fn signer(&self) -> Result<Address> {
        Address::from_public_key(&self.public_key)
    }
}

/// Seal a payload with AES-256-GCM; the random 12-byte nonce is prepended
/// to the ciphertext so the output is self-contained.
pub fn encrypt_payload(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| SynnergyError::MalformedPayload("invalid payload key".to_string()))?;
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SynnergyError::MalformedPayload("payload encryption failed".to_string()))?;
    let mut out = nonce_bytes.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a payload sealed by [`encrypt_payload`]
pub fn decrypt_payload(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < 12 {
        return Err(SynnergyError::MalformedPayload(
            "sealed payload shorter than nonce".to_string(),
        ));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| SynnergyError::MalformedPayload("invalid payload key".to_string()))?;
    let nonce = Nonce::from_slice(&sealed[..12]);
    cipher
        .decrypt(nonce, &sealed[12..])
        .map_err(|_| SynnergyError::MalformedPayload("payload decryption failed".to_string()))
}
