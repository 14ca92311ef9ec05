// Every persisted or transmitted value goes through these two functions so
// the on-disk and on-wire encodings stay identical.
use crate::error::{BlockchainError, Result};

/// Encode with bincode's standard configuration.
pub fn serialize<T: bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(data, bincode::config::standard())
        .map_err(|e| BlockchainError::Serialization(format!("Serialization failed: {e}")))
}

/// Decode with bincode's standard configuration. Trailing bytes are rejected.
pub fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
    let (data, read) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| BlockchainError::Serialization(format!("Deserialization failed: {e}")))?;
    if read != bytes.len() {
        return Err(BlockchainError::Serialization(format!(
            "Deserialization left {} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(data)
}
