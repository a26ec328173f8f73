use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::{PoisonError, RwLock};

use log::{debug, info, warn};
use secp256k1::SecretKey;
use thiserror::Error;

use super::block::Block;
use super::crypto::{address_to_pub_key_hash, CryptoError};
use super::iterator::ChainIterator;
use super::proof::{MiningError, ProofOfWork};
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{PreviousTransactions, Transaction, TransactionError};
use crate::config::Config;

/// Memo carried by the genesis coinbase
pub const GENESIS_MEMO: &str = "First Transaction from Genesis";

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger already exists at {0}")]
    AlreadyExists(String),

    #[error("No ledger found at {0}")]
    NotFound(String),

    #[error("Transaction {0} not found")]
    TransactionNotFound(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(u64),

    #[error("Invalid transaction {0}")]
    InvalidTransaction(String),

    #[error("Output {out} of transaction {txid} is already spent")]
    DoubleSpend { txid: String, out: i64 },

    #[error("Transaction {txid} spends {inputs} but creates {outputs}")]
    ValueNotConserved {
        txid: String,
        inputs: u128,
        outputs: u128,
    },

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Mining error: {0}")]
    MiningError(#[from] MiningError),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// A persisted, hash-linked chain of mined blocks
///
/// All appends go through one storage write transaction, so concurrent
/// callers of [`Ledger::add_block`] are serialized and each extends the tip
/// left by the previous one.
#[derive(Debug)]
pub struct Ledger {
    /// Storage for blockchain data
    storage: BlockchainStorage,

    /// Hash of the tip block
    last_hash: RwLock<Vec<u8>>,

    /// Proof-of-work engine at the configured difficulty
    pow: ProofOfWork,
}

impl Ledger {
    /// Creates a new ledger whose genesis block pays the reward to an address
    ///
    /// # Arguments
    ///
    /// * `config` - Where to store the ledger, and its difficulty and reward
    /// * `reward_address` - The address receiving the genesis reward
    ///
    /// # Returns
    ///
    /// The new ledger, or `AlreadyExists` if one is already stored there
    pub fn init(config: &Config, reward_address: &str) -> Result<Self, LedgerError> {
        address_to_pub_key_hash(reward_address)?;
        let pow = ProofOfWork::new(config.difficulty)?;
        let storage = BlockchainStorage::new(&config.data_dir)?;

        let genesis = {
            let mut txn = storage.begin_write();
            if txn.last_hash()?.is_some() {
                return Err(LedgerError::AlreadyExists(
                    config.data_dir.display().to_string(),
                ));
            }

            let coinbase = Transaction::coinbase(reward_address, GENESIS_MEMO, config.reward)?;
            let genesis = Block::genesis(coinbase, &pow)?;

            txn.put_block(&genesis)?;
            txn.set_last_hash(&genesis.hash);
            txn.set_difficulty(config.difficulty);
            txn.commit()?;
            genesis
        };

        info!(
            "Created ledger at {} with genesis block {}",
            config.data_dir.display(),
            hex::encode(&genesis.hash)
        );

        Ok(Self {
            storage,
            last_hash: RwLock::new(genesis.hash),
            pow,
        })
    }

    /// Reopens an existing ledger
    ///
    /// The difficulty recorded at creation wins over `config.difficulty`, so
    /// stored blocks keep validating and new ones are mined at the same
    /// target.
    ///
    /// # Returns
    ///
    /// The ledger, or `NotFound` if none is stored at `config.data_dir`
    pub fn open(config: &Config) -> Result<Self, LedgerError> {
        if !config.data_dir.exists() {
            return Err(LedgerError::NotFound(config.data_dir.display().to_string()));
        }

        let storage = BlockchainStorage::new(&config.data_dir)?;
        let (last_hash, stored_difficulty) = {
            let read = storage.begin_read();
            let last_hash = read
                .last_hash()?
                .ok_or_else(|| LedgerError::NotFound(config.data_dir.display().to_string()))?;
            (last_hash, read.difficulty()?)
        };

        let difficulty = match stored_difficulty {
            Some(stored) if stored != config.difficulty => {
                warn!(
                    "Ledger was created at difficulty {}, ignoring configured {}",
                    stored, config.difficulty
                );
                stored
            }
            Some(stored) => stored,
            None => config.difficulty,
        };
        let pow = ProofOfWork::new(difficulty)?;

        info!(
            "Loaded ledger from {} at tip {}",
            config.data_dir.display(),
            hex::encode(&last_hash)
        );

        Ok(Self {
            storage,
            last_hash: RwLock::new(last_hash),
            pow,
        })
    }

    /// Mines a block of transactions onto the tip and persists it
    ///
    /// Every transaction must verify and must not spend an output that is
    /// already spent, on chain or earlier in the same batch.
    ///
    /// # Returns
    ///
    /// The newly mined block, now the tip
    pub fn add_block(&self, transactions: Vec<Transaction>) -> Result<Block, LedgerError> {
        self.append(transactions, None)
    }

    /// Same as [`Ledger::add_block`], aborting the mining once `cancel` is raised
    ///
    /// A cancelled append leaves the ledger unchanged.
    pub fn add_block_with_cancel(
        &self,
        transactions: Vec<Transaction>,
        cancel: &AtomicBool,
    ) -> Result<Block, LedgerError> {
        self.append(transactions, Some(cancel))
    }

    fn append(
        &self,
        transactions: Vec<Transaction>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Block, LedgerError> {
        // Tip read, checks, mining, write and tip publish all happen under
        // the writer lock
        let mut txn = self.storage.begin_write();
        let parent = txn
            .last_hash()?
            .ok_or_else(|| LedgerError::NotFound("tip block".to_string()))?;

        self.check_transactions(&parent, &transactions)?;

        let block = match cancel {
            Some(flag) => Block::create_with_cancel(transactions, parent, &self.pow, flag)?,
            None => Block::create(transactions, parent, &self.pow)?,
        };

        txn.put_block(&block)?;
        txn.set_last_hash(&block.hash);
        txn.commit()?;

        *self.last_hash.write().unwrap_or_else(PoisonError::into_inner) = block.hash.clone();
        drop(txn);

        info!(
            "Added block {} with {} transaction(s)",
            hex::encode(&block.hash),
            block.transactions.len()
        );
        Ok(block)
    }

    /// Checks a batch against the chain ending at `tip`
    fn check_transactions(
        &self,
        tip: &[u8],
        transactions: &[Transaction],
    ) -> Result<(), LedgerError> {
        let mut spent = if transactions.iter().all(Transaction::is_coinbase) {
            HashSet::new()
        } else {
            self.spent_outpoints(tip)?
        };

        for transaction in transactions {
            if transaction.is_coinbase() {
                continue;
            }

            let prev_txs = self.previous_transactions(tip, transaction)?;
            if !transaction.verify(&prev_txs)? {
                warn!(
                    "Rejecting transaction {} with an invalid signature",
                    hex::encode(&transaction.id)
                );
                return Err(LedgerError::InvalidTransaction(hex::encode(&transaction.id)));
            }

            let inputs = transaction.input_value(&prev_txs)?;
            let outputs = transaction.output_value();
            if outputs > inputs {
                return Err(LedgerError::ValueNotConserved {
                    txid: hex::encode(&transaction.id),
                    inputs,
                    outputs,
                });
            }

            for input in &transaction.inputs {
                if !spent.insert((input.id.clone(), input.out)) {
                    return Err(LedgerError::DoubleSpend {
                        txid: hex::encode(&input.id),
                        out: input.out,
                    });
                }
            }
        }

        Ok(())
    }

    /// Finds a transaction by id, scanning from the tip
    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction, LedgerError> {
        self.find_transaction_from(&self.last_hash(), id)
    }

    fn find_transaction_from(&self, tip: &[u8], id: &[u8]) -> Result<Transaction, LedgerError> {
        for block in self.iter_from(tip) {
            let block = block?;
            if let Some(transaction) = block.transactions.into_iter().find(|tx| tx.id == id) {
                return Ok(transaction);
            }
        }

        Err(LedgerError::TransactionNotFound(hex::encode(id)))
    }

    /// Looks up every transaction referenced by the inputs of `transaction`
    fn previous_transactions(
        &self,
        tip: &[u8],
        transaction: &Transaction,
    ) -> Result<PreviousTransactions, LedgerError> {
        let mut prev_txs = PreviousTransactions::new();
        for input in &transaction.inputs {
            let key = hex::encode(&input.id);
            if prev_txs.contains_key(&key) {
                continue;
            }

            let prev_tx = self.find_transaction_from(tip, &input.id)?;
            prev_txs.insert(key, prev_tx);
        }
        Ok(prev_txs)
    }

    /// Signs every input of a transaction against the outputs it spends
    pub fn sign_transaction(
        &self,
        transaction: &mut Transaction,
        secret_key: &SecretKey,
    ) -> Result<(), LedgerError> {
        if transaction.is_coinbase() {
            return Ok(());
        }

        let prev_txs = self.previous_transactions(&self.last_hash(), transaction)?;
        transaction.sign(secret_key, &prev_txs)?;
        Ok(())
    }

    /// Verifies every input of a transaction against the outputs it spends
    pub fn verify_transaction(&self, transaction: &Transaction) -> Result<bool, LedgerError> {
        if transaction.is_coinbase() {
            return Ok(true);
        }

        let prev_txs = self.previous_transactions(&self.last_hash(), transaction)?;
        Ok(transaction.verify(&prev_txs)?)
    }

    /// Gets a block by its hash
    pub fn get_block(&self, hash: &[u8]) -> Result<Block, LedgerError> {
        Ok(self.storage.begin_read().get_block(hash)?)
    }

    /// Starts a fresh traversal from the current tip back to genesis
    pub fn iter(&self) -> ChainIterator<'_> {
        ChainIterator::new(self.last_hash(), &self.storage)
    }

    /// Starts a traversal from a given block back to genesis
    pub(crate) fn iter_from(&self, tip: &[u8]) -> ChainIterator<'_> {
        ChainIterator::new(tip.to_vec(), &self.storage)
    }

    /// Gets the hash of the tip block
    pub fn last_hash(&self) -> Vec<u8> {
        self.last_hash
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Counts the blocks in the chain, genesis included
    pub fn height(&self) -> Result<usize, LedgerError> {
        let mut count = 0;
        for block in self.iter() {
            block?;
            count += 1;
        }
        debug!("Chain has {} block(s)", count);
        Ok(count)
    }

    /// Gets the difficulty blocks are mined at
    pub fn difficulty(&self) -> u32 {
        self.pow.difficulty()
    }

    /// Checks a block's proof of work at this ledger's difficulty
    pub fn validate_block(&self, block: &Block) -> bool {
        self.pow.validate(block)
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> &BlockchainStorage {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;
    use crate::blockchain::transaction::{TxInput, TxOutput};
    use tempfile::TempDir;

    fn test_config() -> (TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path().join("ledger")).difficulty(8);
        (dir, config)
    }

    #[test]
    fn test_init_creates_genesis() {
        let (_dir, config) = test_config();
        let miner = Wallet::new();

        let ledger = Ledger::init(&config, &miner.address()).unwrap();
        let blocks: Vec<Block> = ledger.iter().map(Result::unwrap).collect();

        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_genesis());
        assert!(blocks[0].transactions[0].is_coinbase());
        assert_eq!(blocks[0].hash, ledger.last_hash());
        assert!(ledger.validate_block(&blocks[0]));
    }

    #[test]
    fn test_init_twice_fails() {
        let (_dir, config) = test_config();
        let miner = Wallet::new();

        let ledger = Ledger::init(&config, &miner.address()).unwrap();
        drop(ledger);

        let result = Ledger::init(&config, &miner.address());
        assert!(matches!(result, Err(LedgerError::AlreadyExists(_))));
    }

    #[test]
    fn test_init_rejects_bad_address() {
        let (_dir, config) = test_config();

        let result = Ledger::init(&config, "bogus");
        assert!(matches!(result, Err(LedgerError::CryptoError(_))));
    }

    #[test]
    fn test_open_without_ledger_fails() {
        let (_dir, config) = test_config();

        let result = Ledger::open(&config);
        assert!(matches!(result, Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_open_existing_ledger() {
        let (_dir, config) = test_config();
        let miner = Wallet::new();

        let tip = {
            let ledger = Ledger::init(&config, &miner.address()).unwrap();
            let coinbase = Transaction::coinbase(&miner.address(), "extra", 5).unwrap();
            ledger.add_block(vec![coinbase]).unwrap().hash
        };

        let ledger = Ledger::open(&config).unwrap();
        assert_eq!(ledger.last_hash(), tip);
        assert_eq!(ledger.height().unwrap(), 2);
    }

    #[test]
    fn test_sequential_blocks_form_a_chain() {
        let (_dir, config) = test_config();
        let miner = Wallet::new();
        let ledger = Ledger::init(&config, &miner.address()).unwrap();

        for i in 0..3 {
            let coinbase = Transaction::coinbase(&miner.address(), &format!("block {}", i), 1).unwrap();
            ledger.add_block(vec![coinbase]).unwrap();
        }

        let blocks: Vec<Block> = ledger.iter().map(Result::unwrap).collect();
        assert_eq!(blocks.len(), 4);
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].prev_hash, pair[1].hash);
        }
        assert!(blocks.last().unwrap().is_genesis());
        assert_eq!(blocks.iter().filter(|block| block.is_genesis()).count(), 1);
        assert!(blocks.iter().all(|block| ledger.validate_block(block)));
    }

    #[test]
    fn test_concurrent_appends_do_not_fork() {
        let (_dir, config) = test_config();
        let miner = Wallet::new();
        let ledger = Ledger::init(&config, &miner.address()).unwrap();

        std::thread::scope(|scope| {
            for i in 0..4 {
                let ledger = &ledger;
                let address = miner.address();
                scope.spawn(move || {
                    let coinbase = Transaction::coinbase(&address, &format!("thread {}", i), 1).unwrap();
                    ledger.add_block(vec![coinbase]).unwrap();
                });
            }
        });

        let blocks: Vec<Block> = ledger.iter().map(Result::unwrap).collect();
        assert_eq!(blocks.len(), 5);
        let parents: HashSet<Vec<u8>> = blocks.iter().map(|block| block.prev_hash.clone()).collect();
        assert_eq!(parents.len(), 5);
    }

    #[test]
    fn test_cancelled_append_leaves_ledger_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path().join("ledger")).difficulty(0);
        let miner = Wallet::new();
        let ledger = Ledger::init(&config, &miner.address()).unwrap();
        let tip = ledger.last_hash();

        let cancel = AtomicBool::new(true);
        let coinbase = Transaction::coinbase(&miner.address(), "late", 1).unwrap();

        // Difficulty 0 would succeed at nonce 0, but the flag is checked first
        let result = ledger.add_block_with_cancel(vec![coinbase], &cancel);
        assert!(matches!(
            result,
            Err(LedgerError::MiningError(MiningError::Cancelled(0)))
        ));
        assert_eq!(ledger.last_hash(), tip);
        assert_eq!(ledger.height().unwrap(), 1);
    }

    #[test]
    fn test_find_transaction() {
        let (_dir, config) = test_config();
        let miner = Wallet::new();
        let ledger = Ledger::init(&config, &miner.address()).unwrap();

        let genesis = ledger.get_block(&ledger.last_hash()).unwrap();
        let coinbase_id = genesis.transactions[0].id.clone();

        assert_eq!(ledger.find_transaction(&coinbase_id).unwrap().id, coinbase_id);
        assert!(matches!(
            ledger.find_transaction(&[0u8; 32]),
            Err(LedgerError::TransactionNotFound(_))
        ));
    }

    #[test]
    fn test_transfer_end_to_end() {
        let (_dir, config) = test_config();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = Ledger::init(&config, &alice.address()).unwrap();

        let initial: Vec<u64> = ledger
            .find_utxo(&alice.public_key_hash())
            .unwrap()
            .iter()
            .map(|output| output.value)
            .collect();
        assert_eq!(initial, vec![100]);

        let transfer = Transaction::new_transfer(&alice, &bob.address(), 40, &ledger).unwrap();
        assert!(ledger.verify_transaction(&transfer).unwrap());
        ledger.add_block(vec![transfer]).unwrap();

        let alice_utxo = ledger.find_utxo(&alice.public_key_hash()).unwrap();
        let bob_utxo = ledger.find_utxo(&bob.public_key_hash()).unwrap();

        assert_eq!(alice_utxo.len(), 1);
        assert_eq!(alice_utxo[0].value, 60);
        assert_eq!(bob_utxo.len(), 1);
        assert_eq!(bob_utxo[0].value, 40);
        assert_eq!(
            ledger.balance(&alice.public_key_hash()).unwrap()
                + ledger.balance(&bob.public_key_hash()).unwrap(),
            100
        );
    }

    #[test]
    fn test_transfer_with_insufficient_funds() {
        let (_dir, config) = test_config();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = Ledger::init(&config, &alice.address()).unwrap();

        let result = Transaction::new_transfer(&alice, &bob.address(), 101, &ledger);
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientFunds {
                required: 101,
                available: 100
            })
        ));

        let result = Transaction::new_transfer(&bob, &alice.address(), 1, &ledger);
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientFunds { available: 0, .. })
        ));

        let result = Transaction::new_transfer(&alice, &bob.address(), 0, &ledger);
        assert!(matches!(result, Err(LedgerError::InvalidAmount(0))));
    }

    #[test]
    fn test_add_block_rejects_forged_transaction() {
        let (_dir, config) = test_config();
        let alice = Wallet::new();
        let mallory = Wallet::new();
        let ledger = Ledger::init(&config, &alice.address()).unwrap();

        let mut transfer = Transaction::new_transfer(&alice, &mallory.address(), 40, &ledger).unwrap();
        transfer.outputs[0].value = 100;
        transfer.outputs.truncate(1);
        transfer.set_id().unwrap();

        let result = ledger.add_block(vec![transfer]);
        assert!(matches!(result, Err(LedgerError::InvalidTransaction(_))));
        assert_eq!(ledger.height().unwrap(), 1);
    }

    #[test]
    fn test_add_block_rejects_double_spend() {
        let (_dir, config) = test_config();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = Ledger::init(&config, &alice.address()).unwrap();

        let transfer = Transaction::new_transfer(&alice, &bob.address(), 40, &ledger).unwrap();

        // Twice in one batch
        let result = ledger.add_block(vec![transfer.clone(), transfer.clone()]);
        assert!(matches!(result, Err(LedgerError::DoubleSpend { .. })));

        // Once accepted, replaying it is refused
        ledger.add_block(vec![transfer.clone()]).unwrap();
        let result = ledger.add_block(vec![transfer]);
        assert!(matches!(result, Err(LedgerError::DoubleSpend { .. })));
        assert_eq!(ledger.height().unwrap(), 2);
    }

    #[test]
    fn test_concurrent_conflicting_transfers() {
        let (_dir, config) = test_config();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let carol = Wallet::new();
        let ledger = Ledger::init(&config, &alice.address()).unwrap();

        // Both spend the genesis output
        let to_bob = Transaction::new_transfer(&alice, &bob.address(), 40, &ledger).unwrap();
        let to_carol = Transaction::new_transfer(&alice, &carol.address(), 40, &ledger).unwrap();

        let results: Vec<Result<Block, LedgerError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = [to_bob, to_carol]
                .into_iter()
                .map(|transfer| {
                    let ledger = &ledger;
                    scope.spawn(move || ledger.add_block(vec![transfer]))
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|result| matches!(result, Err(LedgerError::DoubleSpend { .. }))));
        assert_eq!(ledger.height().unwrap(), 2);

        let total: u64 = [&alice, &bob, &carol]
            .iter()
            .map(|wallet| ledger.balance(&wallet.public_key_hash()).unwrap())
            .sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_add_block_rejects_minting_transfer() {
        let (_dir, config) = test_config();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = Ledger::init(&config, &alice.address()).unwrap();

        let genesis = ledger.get_block(&ledger.last_hash()).unwrap();
        let mut transfer = Transaction {
            id: Vec::new(),
            inputs: vec![TxInput {
                id: genesis.transactions[0].id.clone(),
                out: 0,
                signature: Vec::new(),
                pub_key: alice.public_key().to_vec(),
            }],
            outputs: vec![TxOutput::new(150, &bob.address()).unwrap()],
        };
        transfer.set_id().unwrap();
        ledger.sign_transaction(&mut transfer, alice.secret_key()).unwrap();
        assert!(ledger.verify_transaction(&transfer).unwrap());

        let result = ledger.add_block(vec![transfer]);
        assert!(matches!(
            result,
            Err(LedgerError::ValueNotConserved {
                inputs: 100,
                outputs: 150,
                ..
            })
        ));
        assert_eq!(ledger.height().unwrap(), 1);
        assert_eq!(ledger.balance(&bob.public_key_hash()).unwrap(), 0);
    }

    #[test]
    fn test_open_keeps_creation_difficulty() {
        let (_dir, config) = test_config();
        let miner = Wallet::new();
        drop(Ledger::init(&config, &miner.address()).unwrap());

        let ledger = Ledger::open(&config.clone().difficulty(2)).unwrap();
        assert_eq!(ledger.difficulty(), 8);

        let coinbase = Transaction::coinbase(&miner.address(), "after reopen", 1).unwrap();
        ledger.add_block(vec![coinbase]).unwrap();

        let blocks: Vec<Block> = ledger.iter().map(Result::unwrap).collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|block| ledger.validate_block(block)));
        assert_eq!(blocks[0].hash[0], 0);
    }

    #[test]
    fn test_tampered_block_fails_validation() {
        let (_dir, config) = test_config();
        let alice = Wallet::new();
        let ledger = Ledger::init(&config, &alice.address()).unwrap();
        let tip = ledger.last_hash();

        // Rewrite the stored block without re-mining it
        let mut block = ledger.get_block(&tip).unwrap();
        block.transactions[0].outputs[0].value = 1_000_000;
        let mut txn = ledger.storage().begin_write();
        txn.put_block(&block).unwrap();
        txn.commit().unwrap();

        let stored = ledger.get_block(&tip).unwrap();
        assert_eq!(stored.nonce, block.nonce);
        assert!(!ledger.validate_block(&stored));
    }
}
