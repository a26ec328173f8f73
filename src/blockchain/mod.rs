// Blockchain module
//
// This module contains the ledger core:
// - Proof of work engine
// - Block structure
// - UTXO transactions and their signature protocol
// - Persistent storage and chain traversal
// - Unspent output queries
// - Keys, addresses and the wallet file

pub mod block;
pub mod chain;
pub mod crypto;
pub mod iterator;
pub mod proof;
pub mod storage;
pub mod transaction;
pub mod utxo;
pub mod wallets;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Ledger, LedgerError};
pub use transaction::Transaction;
pub use wallets::Wallets;
