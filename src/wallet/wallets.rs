use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use crate::wallet::Wallet;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const WALLET_FILE: &str = "wallet.dat";

/// The local keystore, persisted as one bincode file.
pub struct Wallets {
    path: PathBuf,
    wallets: BTreeMap<String, Wallet>,
}

impl Wallets {
    /// Loads the keystore at `path`, starting empty if the file does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Wallets> {
        let path = path.as_ref().to_path_buf();
        let wallets = if path.exists() {
            let bytes = fs::read(&path)?;
            deserialize(&bytes).map_err(|e| {
                BlockchainError::Wallet(format!("Corrupt wallet file {}: {e}", path.display()))
            })?
        } else {
            BTreeMap::new()
        };
        Ok(Wallets { path, wallets })
    }

    pub fn create_wallet(&mut self) -> Result<String> {
        let wallet = Wallet::new()?;
        let address = wallet.get_address();
        self.wallets.insert(address.clone(), wallet);
        self.save()?;
        Ok(address)
    }

    pub fn get_addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = serialize(&self.wallets)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
