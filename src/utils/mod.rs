//! Utility functions and helpers
//!
//! Hashing, signatures, base58 and the bincode wrappers shared by the
//! ledger, the UTXO index and the wire codec.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    base58_decode, base58_encode, current_timestamp, current_timestamp_nanos,
    ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, new_key_pair,
    public_key_from_pkcs8, ripemd160_digest, sha256_digest,
};

pub use serialization::{deserialize, serialize};
