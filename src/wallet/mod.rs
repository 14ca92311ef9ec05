//! Wallet management and address encoding
//!
//! Keypairs, the local keystore file, and the base58check address pair
//! (`encode_address`/`decode_address`) the ledger depends on.

#[allow(clippy::module_inception)]
pub mod wallet;
pub mod wallets;

pub use wallet::{
    convert_address, decode_address, encode_address, hash_pub_key, validate_address, Wallet,
    ADDRESS_CHECK_SUM_LEN, ADDRESS_VERSION,
};
pub use wallets::{Wallets, WALLET_FILE};
