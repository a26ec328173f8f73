// Proof of work
//
// A block's hash is SHA-256(prev_hash ‖ tx_hash ‖ nonce ‖ difficulty) with the
// integers encoded as big-endian u64. The hash is valid when, read as a
// 256-bit big-endian integer, it is below 2^(256 - difficulty).

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::block::Block;

/// Largest supported difficulty (target = 2^0 = 1)
pub const MAX_DIFFICULTY: u32 = 256;

/// How many nonces are tried between checks of the cancellation flag
const CANCEL_CHECK_INTERVAL: u64 = 1 << 12;

/// How many nonces are tried between progress log lines
const PROGRESS_LOG_INTERVAL: u64 = 1 << 22;

/// Errors that can occur while mining
#[derive(Debug, Error)]
pub enum MiningError {
    #[error("Invalid difficulty {0}: must be at most {MAX_DIFFICULTY}")]
    InvalidDifficulty(u32),

    #[error("Nonce space exhausted without meeting difficulty {0}")]
    NonceExhausted(u32),

    #[error("Mining cancelled after {0} attempts")]
    Cancelled(u64),
}

/// The proof-of-work engine for a fixed difficulty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofOfWork {
    difficulty: u32,
}

impl ProofOfWork {
    /// Creates an engine for the given difficulty
    pub fn new(difficulty: u32) -> Result<Self, MiningError> {
        if difficulty > MAX_DIFFICULTY {
            return Err(MiningError::InvalidDifficulty(difficulty));
        }

        Ok(Self { difficulty })
    }

    /// Gets the configured difficulty
    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Computes the PoW digest for the given content and nonce
    pub fn digest(&self, prev_hash: &[u8], tx_hash: &[u8], nonce: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash);
        hasher.update(tx_hash);
        hasher.update(nonce.to_be_bytes());
        hasher.update(u64::from(self.difficulty).to_be_bytes());
        hasher.finalize().into()
    }

    /// Checks whether a hash is below the target
    ///
    /// For a 256-bit value, `hash < 2^(256 - d)` exactly when its top `d`
    /// bits are zero.
    pub fn meets_target(&self, hash: &[u8]) -> bool {
        leading_zero_bits(hash) >= self.difficulty
    }

    /// Searches for the smallest nonce meeting the target
    ///
    /// # Returns
    ///
    /// The nonce and the resulting hash
    pub fn run(&self, prev_hash: &[u8], tx_hash: &[u8]) -> Result<(u64, Vec<u8>), MiningError> {
        self.search(prev_hash, tx_hash, None)
    }

    /// Same as [`ProofOfWork::run`], aborting once `cancel` is raised
    pub fn run_with_cancel(
        &self,
        prev_hash: &[u8],
        tx_hash: &[u8],
        cancel: &AtomicBool,
    ) -> Result<(u64, Vec<u8>), MiningError> {
        self.search(prev_hash, tx_hash, Some(cancel))
    }

    fn search(
        &self,
        prev_hash: &[u8],
        tx_hash: &[u8],
        cancel: Option<&AtomicBool>,
    ) -> Result<(u64, Vec<u8>), MiningError> {
        for nonce in 0..=u64::MAX {
            if nonce % CANCEL_CHECK_INTERVAL == 0 {
                if let Some(flag) = cancel {
                    if flag.load(Ordering::Relaxed) {
                        info!("Mining cancelled after {} attempts", nonce);
                        return Err(MiningError::Cancelled(nonce));
                    }
                }
            }

            let hash = self.digest(prev_hash, tx_hash, nonce);
            if self.meets_target(&hash) {
                info!(
                    "Mined nonce {} with hash {} (difficulty {})",
                    nonce,
                    hex::encode(hash),
                    self.difficulty
                );
                return Ok((nonce, hash.to_vec()));
            }

            if nonce > 0 && nonce % PROGRESS_LOG_INTERVAL == 0 {
                debug!("Still mining, {} nonces tried", nonce);
            }
        }

        Err(MiningError::NonceExhausted(self.difficulty))
    }

    /// Validates a mined block against this engine's difficulty
    ///
    /// Every transaction id must match its content, the stored nonce must
    /// reproduce the stored hash, and that hash must meet the target.
    pub fn validate(&self, block: &Block) -> bool {
        let ids_intact = block
            .transactions
            .iter()
            .all(|tx| matches!(tx.hash(), Ok(id) if id == tx.id));
        if !ids_intact {
            return false;
        }

        let hash = self.digest(&block.prev_hash, &block.hash_transactions(), block.nonce);
        hash.as_slice() == block.hash.as_slice() && self.meets_target(&hash)
    }
}

fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}
