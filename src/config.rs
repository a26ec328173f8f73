use std::path::PathBuf;

use thiserror::Error;

use crate::blockchain::proof::MAX_DIFFICULTY;

/// Default directory of the ledger database
pub const DEFAULT_DATA_DIR: &str = "data/blockchain";

/// Default location of the wallet file
pub const DEFAULT_WALLET_FILE: &str = "data/wallets.dat";

/// Default proof-of-work difficulty (leading zero bits)
pub const DEFAULT_DIFFICULTY: u32 = 12;

/// Default amount minted by the genesis coinbase
pub const DEFAULT_REWARD: u64 = 100;

/// Errors that can occur while validating configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid difficulty {difficulty}: must be at most {max}")]
    InvalidDifficulty { difficulty: u32, max: u32 },

    #[error("Mining reward must be positive")]
    ZeroReward,
}

/// Runtime configuration for the ledger and its surfaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory of the ledger database
    pub data_dir: PathBuf,

    /// Path of the wallet file
    pub wallet_file: PathBuf,

    /// Proof-of-work difficulty, fixed for the life of a ledger
    pub difficulty: u32,

    /// Amount minted by the genesis coinbase
    pub reward: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            wallet_file: PathBuf::from(DEFAULT_WALLET_FILE),
            difficulty: DEFAULT_DIFFICULTY,
            reward: DEFAULT_REWARD,
        }
    }
}

impl Config {
    /// Default configuration rooted at `data_dir`
    pub fn with_data_dir<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Overrides the difficulty
    pub fn difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// Checks the values are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::InvalidDifficulty {
                difficulty: self.difficulty,
                max: MAX_DIFFICULTY,
            });
        }

        if self.reward == 0 {
            return Err(ConfigError::ZeroReward);
        }

        Ok(())
    }
}
