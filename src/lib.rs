//! # powledger
//!
//! A minimal single-chain proof-of-work ledger node.
//!
//! ## Layout
//! - `core/`: blocks, transactions, the Merkle commitment, proof-of-work,
//!   and the `Blockchain` ledger over a sled store
//! - `storage/`: the UTXO index and the memory pool
//! - `network/`: framed packets, the peer registry, PeerSync and the TCP server
//! - `wallet/`: keypairs, the keystore file and base58check addresses
//! - `config/`: node settings from defaults, TOML and the environment
//! - `utils/`: hashing, signatures and bincode helpers
//! - `cli/`: argument parsing for the binary
//!
//! ## Consistency
//! Appending a block and updating the UTXO index happen in one sled
//! transaction behind a single writer lock, so readers never observe a
//! block without its UTXO changes. Mining runs outside that lock and only
//! commits if the tip has not moved in the meantime.
//!
//! PeerSync is unauthenticated gossip: it follows the longest valid chain
//! it is shown, one block at a time, and does not protect against a peer
//! feeding it a different but individually valid fork.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

pub use cli::{Command, Opt};
pub use config::Config;
pub use crate::core::{Block, Blockchain, ProofOfWork, TXInput, TXOutput, Transaction};
pub use error::{BlockchainError, Result};
pub use network::{send_tx, Message, Nodes, OpType, Packet, PeerSync, Server, Transport};
pub use storage::{MemoryPool, UTXOSet};
pub use utils::{
    base58_decode, base58_encode, current_timestamp, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, ripemd160_digest, sha256_digest,
};
pub use wallet::{
    convert_address, hash_pub_key, validate_address, Wallet, Wallets, ADDRESS_CHECK_SUM_LEN,
};
