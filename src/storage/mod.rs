//! Data storage and persistence
//!
//! The UTXO index kept beside the block store, and the memory pool of
//! transactions waiting to be mined.

pub mod memory_pool;
pub mod utxo_set;

pub use memory_pool::MemoryPool;
pub use utxo_set::{TXOutputs, UTXOSet, UTXO_TREE};
