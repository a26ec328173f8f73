use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use sled::transaction::{TransactionError as SledTransactionError, TransactionResult};
use sled::{Batch, Db, Transactional, Tree};
use thiserror::Error;

use super::block::Block;

/// Metadata key holding the hash of the tip block
pub const LAST_HASH_KEY: &[u8] = b"lh";

/// Metadata key holding the difficulty the chain is mined at
pub const DIFFICULTY_KEY: &[u8] = b"difficulty";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Storage transaction aborted")]
    TransactionAborted,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

/// Storage for blockchain data
///
/// Blocks live in the `blocks` tree keyed by hash; the tip pointer and the
/// chain's difficulty live in the `metadata` tree under [`LAST_HASH_KEY`] and
/// [`DIFFICULTY_KEY`]. Reads go through [`ReadTxn`], writes through
/// [`WriteTxn`].
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Tree for blocks
    blocks: Tree,

    /// Tree for metadata
    metadata: Tree,

    /// Held by the single live write transaction
    writer: Mutex<()>,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl BlockchainStorage {
    /// Opens (or creates) the storage at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            metadata,
            writer: Mutex::new(()),
        })
    }

    /// Starts a read-only transaction
    ///
    /// Any number of these may be live at once, alongside a write transaction.
    pub fn begin_read(&self) -> ReadTxn<'_> {
        ReadTxn {
            blocks: &self.blocks,
            metadata: &self.metadata,
        }
    }

    /// Starts a read-write transaction
    ///
    /// Blocks until every other write transaction has committed or been
    /// dropped.
    pub fn begin_write(&self) -> WriteTxn<'_> {
        let guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        WriteTxn {
            storage: self,
            _guard: guard,
            blocks: HashMap::new(),
            last_hash: None,
            difficulty: None,
            committed: false,
        }
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// A read-only view of the store
pub struct ReadTxn<'a> {
    blocks: &'a Tree,
    metadata: &'a Tree,
}

impl ReadTxn<'_> {
    /// Gets a block by its hash
    pub fn get_block(&self, hash: &[u8]) -> Result<Block, StorageError> {
        match self.blocks.get(hash)? {
            Some(value) => Block::deserialize(&value),
            None => Err(StorageError::NotFound(format!(
                "Block with hash {} not found",
                hex::encode(hash)
            ))),
        }
    }

    /// Gets the tip hash, if a chain has been written
    pub fn last_hash(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(LAST_HASH_KEY)?.map(|value| value.to_vec()))
    }

    /// Gets the difficulty recorded when the chain was created
    pub fn difficulty(&self) -> Result<Option<u32>, StorageError> {
        match self.metadata.get(DIFFICULTY_KEY)? {
            Some(value) => {
                let bytes: [u8; 4] = value.as_ref().try_into().map_err(|_| {
                    StorageError::DeserializationError(format!(
                        "difficulty is {} bytes, expected 4",
                        value.len()
                    ))
                })?;
                Ok(Some(u32::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }
}

/// A read-write transaction
///
/// Writes are buffered and become visible all at once on [`WriteTxn::commit`].
/// Dropping the transaction without committing discards them. The writer lock
/// is held until the transaction is dropped, committed or not.
pub struct WriteTxn<'a> {
    storage: &'a BlockchainStorage,
    _guard: MutexGuard<'a, ()>,
    blocks: HashMap<Vec<u8>, Vec<u8>>,
    last_hash: Option<Vec<u8>>,
    difficulty: Option<u32>,
    committed: bool,
}

impl WriteTxn<'_> {
    /// Gets a block by its hash, including blocks written in this transaction
    pub fn get_block(&self, hash: &[u8]) -> Result<Block, StorageError> {
        match self.blocks.get(hash) {
            Some(value) => Block::deserialize(value),
            None => self.storage.begin_read().get_block(hash),
        }
    }

    /// Gets the tip hash as this transaction sees it
    pub fn last_hash(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match &self.last_hash {
            Some(hash) => Ok(Some(hash.clone())),
            None => self.storage.begin_read().last_hash(),
        }
    }

    /// Stages a block under its own hash
    pub fn put_block(&mut self, block: &Block) -> Result<(), StorageError> {
        let value = block.serialize()?;
        self.blocks.insert(block.hash.clone(), value);
        Ok(())
    }

    /// Stages a new tip hash
    pub fn set_last_hash(&mut self, hash: &[u8]) {
        self.last_hash = Some(hash.to_vec());
    }

    /// Stages the chain's difficulty
    pub fn set_difficulty(&mut self, difficulty: u32) {
        self.difficulty = Some(difficulty);
    }

    /// Atomically applies every staged write and flushes to disk
    ///
    /// The lock stays held afterwards, so the caller can publish the new
    /// state before another writer gets in.
    pub fn commit(&mut self) -> Result<(), StorageError> {
        let mut block_batch = Batch::default();
        for (key, value) in &self.blocks {
            block_batch.insert(key.as_slice(), value.as_slice());
        }

        let mut metadata_batch = Batch::default();
        if let Some(hash) = &self.last_hash {
            metadata_batch.insert(LAST_HASH_KEY, hash.as_slice());
        }
        if let Some(difficulty) = self.difficulty {
            metadata_batch.insert(DIFFICULTY_KEY, &difficulty.to_be_bytes()[..]);
        }

        let result: TransactionResult<(), ()> = (&self.storage.blocks, &self.storage.metadata)
            .transaction(|(blocks, metadata)| {
                blocks.apply_batch(&block_batch)?;
                metadata.apply_batch(&metadata_batch)?;
                Ok(())
            });

        match result {
            Ok(()) => {}
            Err(SledTransactionError::Storage(e)) => return Err(StorageError::DatabaseError(e)),
            Err(SledTransactionError::Abort(())) => return Err(StorageError::TransactionAborted),
        }

        self.storage.flush()?;
        self.committed = true;

        debug!(
            "Committed {} block(s){}",
            self.blocks.len(),
            if self.last_hash.is_some() { " and a new tip" } else { "" }
        );
        Ok(())
    }

    /// Discards every staged write
    pub fn rollback(self) {}
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        let staged = self.blocks.len()
            + usize::from(self.last_hash.is_some())
            + usize::from(self.difficulty.is_some());
        if !self.committed && staged > 0 {
            warn!("Discarding {} uncommitted storage write(s)", staged);
        }
    }
}
