use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{info, warn};
use thiserror::Error;

use super::crypto::{CryptoError, Wallet};

/// Errors that can occur while handling the wallet file
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Wallet not found: {0}")]
    NotFound(String),
}

/// The set of wallets owned locally, keyed by address
#[derive(Debug, Default)]
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
}

impl Wallets {
    /// Loads wallets from a file
    ///
    /// A missing file is an empty set of wallets.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No wallet file at {}, starting empty", path.display());
            return Ok(Self::default());
        }

        let content = fs::read(path)?;
        let keys: HashMap<String, Vec<u8>> = bincode::deserialize(&content)
            .map_err(|e| WalletError::DeserializationError(e.to_string()))?;

        let mut wallets = HashMap::with_capacity(keys.len());
        for (address, secret_key) in keys {
            let wallet = Wallet::from_secret_key(&secret_key)?;
            if wallet.address() != address {
                warn!("Wallet file entry {} does not match its key, skipping", address);
                continue;
            }
            wallets.insert(address, wallet);
        }

        Ok(Self { wallets })
    }

    /// Writes the wallets to a file, creating parent directories as needed
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WalletError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let keys: HashMap<&String, Vec<u8>> = self
            .wallets
            .iter()
            .map(|(address, wallet)| (address, wallet.export_secret_key()))
            .collect();
        let content = bincode::serialize(&keys)
            .map_err(|e| WalletError::SerializationError(e.to_string()))?;

        fs::write(path, content)?;
        Ok(())
    }

    /// Generates a new wallet and returns its address
    pub fn add_wallet(&mut self) -> String {
        let wallet = Wallet::new();
        let address = wallet.address();
        self.wallets.insert(address.clone(), wallet);
        address
    }

    /// Gets every address, sorted
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.wallets.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Gets the wallet for an address
    pub fn get(&self, address: &str) -> Result<&Wallet, WalletError> {
        self.wallets
            .get(address)
            .ok_or_else(|| WalletError::NotFound(address.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let wallets = Wallets::load(dir.path().join("wallets.dat")).unwrap();

        assert!(wallets.addresses().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("wallets.dat");

        let mut wallets = Wallets::default();
        let first = wallets.add_wallet();
        let second = wallets.add_wallet();
        wallets.save(&path).unwrap();

        let loaded = Wallets::load(&path).unwrap();
        let mut expected = vec![first.clone(), second];
        expected.sort();
        assert_eq!(loaded.addresses(), expected);
        assert_eq!(
            loaded.get(&first).unwrap().public_key(),
            wallets.get(&first).unwrap().public_key()
        );
    }

    #[test]
    fn test_unknown_address() {
        let wallets = Wallets::default();
        assert!(matches!(wallets.get("nope"), Err(WalletError::NotFound(_))));
    }

    #[test]
    fn test_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallets.dat");
        fs::write(&path, [0xffu8; 4]).unwrap();

        assert!(matches!(
            Wallets::load(&path),
            Err(WalletError::DeserializationError(_))
        ));
    }
}
