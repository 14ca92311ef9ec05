//! Error handling for the ledger node
//!
//! Errors fall into four families: persistence faults that abort the
//! current operation, validation failures that reject a transaction or
//! block without touching ledger state, protocol faults on malformed
//! packets, and peer-reachability faults that evict a peer.

use thiserror::Error;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    /// An input names a previous transaction that could not be found while signing
    #[error("Unresolved input: previous transaction {0} not found")]
    UnresolvedInput(String),

    /// An input's referenced output could not be resolved while verifying
    #[error("Missing previous output: {0}")]
    MissingPreviousOutput(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Mining cancelled")]
    MiningCancelled,

    /// The tip moved while a block was being mined on top of it
    #[error("Stale tip: expected {expected}, found {found}")]
    StaleTip { expected: String, found: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("No reachable peers left in the registry")]
    NoReachablePeers,
}

impl BlockchainError {
    /// Recoverable rejections of a transaction or block.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BlockchainError::InvalidAddress(_)
                | BlockchainError::InsufficientFunds { .. }
                | BlockchainError::UnresolvedInput(_)
                | BlockchainError::MissingPreviousOutput(_)
                | BlockchainError::InvalidSignature(_)
                | BlockchainError::InvalidTransaction(_)
                | BlockchainError::InvalidBlock(_)
        )
    }

    /// Local storage or configuration faults. Only these may stop the node.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BlockchainError::Database(_) | BlockchainError::Io(_) | BlockchainError::Config(_)
        )
    }
}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}

impl From<sled::transaction::TransactionError<BlockchainError>> for BlockchainError {
    fn from(err: sled::transaction::TransactionError<BlockchainError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(e) => {
                BlockchainError::Database(e.to_string())
            }
        }
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_not_fatal() {
        let err = BlockchainError::InvalidSignature("input 0".to_string());
        assert!(err.is_validation());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_storage_errors_are_fatal() {
        let err = BlockchainError::Database("disk full".to_string());
        assert!(err.is_fatal());
        assert!(!err.is_validation());
    }

    #[test]
    fn test_transaction_abort_unwraps_inner_error() {
        let err: BlockchainError = sled::transaction::TransactionError::Abort(
            BlockchainError::InvalidBlock("bad".to_string()),
        )
        .into();
        assert_eq!(err, BlockchainError::InvalidBlock("bad".to_string()));
    }

    #[test]
    fn test_insufficient_funds_display() {
        let err = BlockchainError::InsufficientFunds {
            required: 11,
            available: 10,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient funds: required 11, available 10"
        );
    }
}
