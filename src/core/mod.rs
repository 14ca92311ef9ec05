//! Core blockchain functionality
//!
//! Blocks, transactions, the Merkle commitment, proof-of-work, and the
//! ledger that ties block storage to the UTXO index.

pub mod block;
pub mod blockchain;
pub mod merkle;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use blockchain::{Blockchain, BlockchainIterator};
pub use merkle::{merkle_root, MerkleProof, MerkleTree, ProofElement};
pub use proof_of_work::{ProofOfWork, TARGET_BITS};
pub use transaction::{PrevTransactions, TXInput, TXOutput, Transaction, SUBSIDY};
