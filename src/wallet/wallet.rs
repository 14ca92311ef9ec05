use crate::error::{BlockchainError, Result};
use crate::utils::{base58_decode, base58_encode, new_key_pair, public_key_from_pkcs8};
use crate::utils::{ripemd160_digest, sha256_digest};
use serde::{Deserialize, Serialize};

pub const ADDRESS_VERSION: u8 = 0x00;
pub const ADDRESS_CHECK_SUM_LEN: usize = 4;

/// A signing keypair and the address derived from it.
#[derive(Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Wallet {
    pkcs8: Vec<u8>,
    public_key: Vec<u8>,
}

impl Wallet {
    pub fn new() -> Result<Wallet> {
        let pkcs8 = new_key_pair()?;
        Self::from_pkcs8(pkcs8)
    }

    pub fn from_pkcs8(pkcs8: Vec<u8>) -> Result<Wallet> {
        let public_key = public_key_from_pkcs8(&pkcs8)?;
        Ok(Wallet { pkcs8, public_key })
    }

    pub fn get_address(&self) -> String {
        encode_address(ADDRESS_VERSION, &self.get_pub_key_hash())
    }

    pub fn get_pub_key_hash(&self) -> Vec<u8> {
        hash_pub_key(&self.public_key)
    }

    pub fn get_public_key(&self) -> &[u8] {
        self.public_key.as_slice()
    }

    pub fn get_pkcs8(&self) -> &[u8] {
        self.pkcs8.as_slice()
    }
}

/// RIPEMD160(SHA256(public key)), the value outputs are locked to.
pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    ripemd160_digest(&sha256_digest(pub_key))
}

fn checksum(payload: &[u8]) -> Vec<u8> {
    let second_sha = sha256_digest(&sha256_digest(payload));
    second_sha[..ADDRESS_CHECK_SUM_LEN].to_vec()
}

/// base58(version ++ pub_key_hash ++ checksum)
pub fn encode_address(version: u8, pub_key_hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + pub_key_hash.len() + ADDRESS_CHECK_SUM_LEN);
    payload.push(version);
    payload.extend_from_slice(pub_key_hash);
    let checksum = checksum(&payload);
    payload.extend(checksum);
    base58_encode(&payload)
}

/// Recovers the public-key hash from an address, checking its checksum.
pub fn decode_address(address: &str) -> Result<Vec<u8>> {
    let payload = base58_decode(address)?;
    if payload.len() < ADDRESS_CHECK_SUM_LEN + 1 {
        return Err(BlockchainError::InvalidAddress(format!(
            "{address}: too short"
        )));
    }
    let (body, actual_checksum) = payload.split_at(payload.len() - ADDRESS_CHECK_SUM_LEN);
    if checksum(body) != actual_checksum {
        return Err(BlockchainError::InvalidAddress(format!(
            "{address}: checksum mismatch"
        )));
    }
    Ok(body[1..].to_vec())
}

pub fn validate_address(address: &str) -> bool {
    decode_address(address).is_ok()
}

pub fn convert_address(pub_key_hash: &[u8]) -> String {
    encode_address(ADDRESS_VERSION, pub_key_hash)
}
