use std::fmt;

/// Error types raised by the Synnergy core
///
/// Variants are grouped by discipline: validation and insufficient-resource
/// errors are rejected at the boundary with no state change, conflict errors
/// are surfaced to consensus, transient errors may be retried, and fatal
/// errors flip the ledger into a read-only recovery state.
#[derive(Debug, Clone, PartialEq)]
pub enum SynnergyError {
    /// Signature does not verify or does not bind to the sender address
    InvalidSignature(String),
    /// Malformed transaction or record payload
    MalformedPayload(String),
    /// Transaction nonce does not match the account nonce
    NonceMismatch { expected: u64, found: u64 },
    /// Transaction already present in the pool or chain
    DuplicateTransaction(String),
    /// Voter already voted for this candidate
    DuplicateVote { candidate: String, voter: String },
    /// Candidate already registered in the authority set
    AlreadyRegistered(String),
    /// Generic admission or input validation failure
    ValidationFailed(String),
    /// Account balance cannot cover value plus gas
    InsufficientBalance { address: String, balance: u64, required: u64 },
    /// Not enough stake behind the operation
    InsufficientStake { address: String, stake: u64, required: u64 },
    /// Gas budget exhausted during execution
    OutOfGas { limit: u64, used: u64 },
    /// Pool admission would exceed the configured byte bound
    PoolFull { bytes: usize, max_bytes: usize },
    /// Block parent hash does not match the current tip
    ParentMismatch { expected: String, found: String },
    /// Recomputed state root differs from the block header
    RootMismatch { expected: String, found: String },
    /// A block at this height was already appended
    DuplicateHeight(u64),
    /// Gossip queue is saturated; message dropped or retried
    Backpressure(String),
    /// Prefix iteration was interrupted by the store
    IteratorInterrupted(String),
    /// State store corruption; the ledger stops accepting writes
    Corruption(String),
    /// Operation rejected because the ledger is in recovery mode
    RecoveryRequired,
    /// Account is suspended by an active penalty
    AccountSuspended(String),
    /// Authority set operation failed
    AuthorityError(String),
    /// Consensus engine failure
    ConsensusError(String),
    /// Shard coordinator failure
    ShardingError(String),
    /// Contract deployment or invocation failure
    ContractError(String),
    /// Compliance manager rejected the transaction
    ComplianceRejected(String),
    /// Network adapter failure
    NetworkError(String),
    /// Encoding or decoding failure
    SerializationError(String),
    /// Underlying storage failure
    StorageError(String),
    /// Requested entity does not exist
    NotFound(String),
}

impl fmt::Display for SynnergyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynnergyError::InvalidSignature(msg) => write!(f, "invalid signature: {}", msg),
            SynnergyError::MalformedPayload(msg) => write!(f, "malformed payload: {}", msg),
            SynnergyError::NonceMismatch { expected, found } => {
                write!(f, "nonce mismatch: expected {}, found {}", expected, found)
            }
            SynnergyError::DuplicateTransaction(hash) => {
                write!(f, "duplicate transaction: {}", hash)
            }
            SynnergyError::DuplicateVote { candidate, voter } => {
                write!(f, "duplicate vote for {} by {}", candidate, voter)
            }
            SynnergyError::AlreadyRegistered(addr) => {
                write!(f, "candidate already registered: {}", addr)
            }
            SynnergyError::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            SynnergyError::InsufficientBalance { address, balance, required } => {
                write!(f, "insufficient balance for {}: have {}, need {}", address, balance, required)
            }
            SynnergyError::InsufficientStake { address, stake, required } => {
                write!(f, "insufficient stake for {}: have {}, need {}", address, stake, required)
            }
            SynnergyError::OutOfGas { limit, used } => {
                write!(f, "out of gas: limit {}, used {}", limit, used)
            }
            SynnergyError::PoolFull { bytes, max_bytes } => {
                write!(f, "pool full: {} bytes pending (limit {})", bytes, max_bytes)
            }
            SynnergyError::ParentMismatch { expected, found } => {
                write!(f, "parent hash mismatch: expected {}, found {}", expected, found)
            }
            SynnergyError::RootMismatch { expected, found } => {
                write!(f, "state root mismatch: expected {}, found {}", expected, found)
            }
            SynnergyError::DuplicateHeight(height) => {
                write!(f, "block at height {} already appended", height)
            }
            SynnergyError::Backpressure(msg) => write!(f, "gossip backpressure: {}", msg),
            SynnergyError::IteratorInterrupted(msg) => {
                write!(f, "iterator interrupted: {}", msg)
            }
            SynnergyError::Corruption(msg) => write!(f, "state corruption: {}", msg),
            SynnergyError::RecoveryRequired => {
                write!(f, "ledger is read-only pending recovery")
            }
            SynnergyError::AccountSuspended(addr) => write!(f, "account suspended: {}", addr),
            SynnergyError::AuthorityError(msg) => write!(f, "authority set: {}", msg),
            SynnergyError::ConsensusError(msg) => write!(f, "consensus: {}", msg),
            SynnergyError::ShardingError(msg) => write!(f, "sharding: {}", msg),
            SynnergyError::ContractError(msg) => write!(f, "contract runtime: {}", msg),
            SynnergyError::ComplianceRejected(msg) => write!(f, "compliance rejected: {}", msg),
            SynnergyError::NetworkError(msg) => write!(f, "network: {}", msg),
            SynnergyError::SerializationError(msg) => write!(f, "serialization: {}", msg),
            SynnergyError::StorageError(msg) => write!(f, "storage: {}", msg),
            SynnergyError::NotFound(msg) => write!(f, "not found: {}", msg),
        }
    }
}

impl std::error::Error for SynnergyError {}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, SynnergyError>;

impl SynnergyError {
    /// Classify this error into the coarse taxonomy used by callers
    /// deciding between reject, retry, view change and recovery.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SynnergyError::InvalidSignature(_)
            | SynnergyError::MalformedPayload(_)
            | SynnergyError::NonceMismatch { .. }
            | SynnergyError::DuplicateTransaction(_)
            | SynnergyError::DuplicateVote { .. }
            | SynnergyError::AlreadyRegistered(_)
            | SynnergyError::ComplianceRejected(_)
            | SynnergyError::AccountSuspended(_)
            | SynnergyError::ValidationFailed(_) => ErrorKind::Validation,
            SynnergyError::InsufficientBalance { .. }
            | SynnergyError::InsufficientStake { .. }
            | SynnergyError::OutOfGas { .. }
            | SynnergyError::PoolFull { .. } => ErrorKind::InsufficientResource,
            SynnergyError::ParentMismatch { .. }
            | SynnergyError::RootMismatch { .. }
            | SynnergyError::DuplicateHeight(_) => ErrorKind::Conflict,
            SynnergyError::Backpressure(_)
            | SynnergyError::IteratorInterrupted(_)
            | SynnergyError::NetworkError(_) => ErrorKind::Transient,
            SynnergyError::Corruption(_) | SynnergyError::RecoveryRequired => ErrorKind::Fatal,
            _ => ErrorKind::Validation,
        }
    }
}

/// Coarse error classification per the platform's propagation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected at the boundary, no state change
    Validation,
    /// Balance, gas, stake or capacity shortfall
    InsufficientResource,
    /// Chain-level disagreement, surfaced to consensus
    Conflict,
    /// Retryable with bounded backoff
    Transient,
    /// Recovery required; writes stop
    Fatal,
}

impl From<serde_json::Error> for SynnergyError {
    fn from(err: serde_json::Error) -> Self {
        SynnergyError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for SynnergyError {
    fn from(err: std::io::Error) -> Self {
        SynnergyError::StorageError(err.to_string())
    }
}

impl From<hex::FromHexError> for SynnergyError {
    fn from(err: hex::FromHexError) -> Self {
        SynnergyError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SynnergyError::NonceMismatch { expected: 3, found: 5 };
        assert_eq!(err.to_string(), "nonce mismatch: expected 3, found 5");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SynnergyError::InvalidSignature("bad".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            SynnergyError::PoolFull { bytes: 10, max_bytes: 5 }.kind(),
            ErrorKind::InsufficientResource
        );
        assert_eq!(
            SynnergyError::RootMismatch { expected: "a".into(), found: "b".into() }.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            SynnergyError::Backpressure("queue".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(SynnergyError::Corruption("bad csum".into()).kind(), ErrorKind::Fatal);
    }
}
