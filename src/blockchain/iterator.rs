use std::iter::FusedIterator;

use super::block::Block;
use super::chain::LedgerError;
use super::storage::BlockchainStorage;

/// Walks the chain from a starting hash back to genesis
///
/// Every step is one independent read. Blocks are never rewritten once
/// committed, so following `prev_hash` links from the starting tip always
/// yields the chain as it was when the walk began; blocks appended meanwhile
/// are not visited.
pub struct ChainIterator<'a> {
    current_hash: Vec<u8>,
    storage: &'a BlockchainStorage,
}

impl<'a> ChainIterator<'a> {
    pub(crate) fn new(start: Vec<u8>, storage: &'a BlockchainStorage) -> Self {
        Self {
            current_hash: start,
            storage,
        }
    }
}

impl Iterator for ChainIterator<'_> {
    type Item = Result<Block, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_empty() {
            return None;
        }

        match self.storage.begin_read().get_block(&self.current_hash) {
            Ok(block) => {
                // Genesis has an empty prev_hash, which ends the walk
                self.current_hash = block.prev_hash.clone();
                Some(Ok(block))
            }
            Err(err) => {
                self.current_hash.clear();
                Some(Err(err.into()))
            }
        }
    }
}

impl FusedIterator for ChainIterator<'_> {}
