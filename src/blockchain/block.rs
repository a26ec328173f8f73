use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::proof::{MiningError, ProofOfWork};
use super::storage::StorageError;
use super::transaction::Transaction;

/// Represents a mined block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Hash of this block, produced by proof of work
    pub hash: Vec<u8>,

    /// Transactions in this block; their order is part of the block hash
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block, empty for genesis
    pub prev_hash: Vec<u8>,

    /// Nonce found by mining
    pub nonce: u64,
}

impl Block {
    /// Mines a new block on top of `prev_hash`
    ///
    /// # Arguments
    ///
    /// * `transactions` - The transactions to include in the block
    /// * `prev_hash` - The hash of the previous block
    /// * `pow` - The proof-of-work engine to mine with
    ///
    /// # Returns
    ///
    /// The mined block
    pub fn create(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        pow: &ProofOfWork,
    ) -> Result<Self, MiningError> {
        Self::mine(transactions, prev_hash, pow, None)
    }

    /// Same as [`Block::create`], aborting once `cancel` is raised
    pub fn create_with_cancel(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        pow: &ProofOfWork,
        cancel: &AtomicBool,
    ) -> Result<Self, MiningError> {
        Self::mine(transactions, prev_hash, pow, Some(cancel))
    }

    fn mine(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        pow: &ProofOfWork,
        cancel: Option<&AtomicBool>,
    ) -> Result<Self, MiningError> {
        let tx_hash = hash_transactions(&transactions);
        let (nonce, hash) = match cancel {
            Some(flag) => pow.run_with_cancel(&prev_hash, &tx_hash, flag)?,
            None => pow.run(&prev_hash, &tx_hash)?,
        };

        Ok(Block {
            hash,
            transactions,
            prev_hash,
            nonce,
        })
    }

    /// Mines the genesis block around a coinbase transaction
    pub fn genesis(coinbase: Transaction, pow: &ProofOfWork) -> Result<Self, MiningError> {
        Self::create(vec![coinbase], Vec::new(), pow)
    }

    /// Whether this is the first block of the chain
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    /// Digest over the ids of this block's transactions
    pub fn hash_transactions(&self) -> Vec<u8> {
        hash_transactions(&self.transactions)
    }

    /// Encodes the block for storage
    pub fn serialize(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serialize(self).map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    /// Decodes a block read from storage
    pub fn deserialize(bytes: &[u8]) -> Result<Self, StorageError> {
        bincode::deserialize(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
    }
}

/// SHA-256 over the concatenated transaction ids, in order
///
/// Stands in for a Merkle root: reordering or changing any id changes it.
pub fn hash_transactions(transactions: &[Transaction]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for transaction in transactions {
        hasher.update(&transaction.id);
    }
    hasher.finalize().to_vec()
}
