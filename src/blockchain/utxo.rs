// Unspent output queries
//
// There is no UTXO index: every query walks the chain from the tip back to
// genesis. Inputs only reference earlier transactions, so by the time an
// output is visited every input that could spend it has already been seen.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use log::debug;

use super::chain::{Ledger, LedgerError};
use super::transaction::{Transaction, TxOutput};

/// A specific output of a specific transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutPoint {
    /// Id of the transaction holding the output
    pub txid: Vec<u8>,

    /// Index of the output in that transaction
    pub out: i64,
}

/// Outputs selected to cover a payment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpendableOutputs {
    /// Total value of the selected outputs
    pub accumulated: u64,

    /// The selected outputs, in selection order
    pub outpoints: Vec<OutPoint>,
}

impl Ledger {
    /// Walks the chain calling `visit` with each transaction that has
    /// unspent outputs locked to `pub_key_hash`, along with their indices
    fn walk_unspent<F>(&self, pub_key_hash: &[u8], mut visit: F) -> Result<(), LedgerError>
    where
        F: FnMut(&Transaction, &[usize]) -> ControlFlow<()>,
    {
        let mut spent: HashMap<String, Vec<i64>> = HashMap::new();

        for block in self.iter() {
            let block = block?;

            for transaction in &block.transactions {
                let spent_outs = spent.get(&hex::encode(&transaction.id));
                let unspent: Vec<usize> = transaction
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|(index, output)| {
                        let already_spent = spent_outs
                            .map_or(false, |outs| outs.contains(&(*index as i64)));
                        !already_spent && output.is_locked_with_key(pub_key_hash)
                    })
                    .map(|(index, _)| index)
                    .collect();

                if !transaction.is_coinbase() {
                    for input in &transaction.inputs {
                        spent
                            .entry(hex::encode(&input.id))
                            .or_default()
                            .push(input.out);
                    }
                }

                if !unspent.is_empty() && visit(transaction, &unspent).is_break() {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Finds the transactions holding unspent outputs locked to a key hash
    pub fn find_unspent_transactions(
        &self,
        pub_key_hash: &[u8],
    ) -> Result<Vec<Transaction>, LedgerError> {
        let mut transactions = Vec::new();
        self.walk_unspent(pub_key_hash, |transaction, _| {
            transactions.push(transaction.clone());
            ControlFlow::Continue(())
        })?;
        Ok(transactions)
    }

    /// Finds every unspent output locked to a key hash
    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>, LedgerError> {
        let mut outputs = Vec::new();
        self.walk_unspent(pub_key_hash, |transaction, indices| {
            outputs.extend(indices.iter().map(|&index| transaction.outputs[index].clone()));
            ControlFlow::Continue(())
        })?;
        Ok(outputs)
    }

    /// Selects unspent outputs until their total reaches `amount`
    ///
    /// Outputs are taken in traversal order (tip first, then by index within
    /// a transaction) and selection stops as soon as the total suffices. If
    /// the key does not hold enough, every output is selected and
    /// `accumulated` comes back below `amount`; checking that is up to the
    /// caller.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<SpendableOutputs, LedgerError> {
        let mut spendable = SpendableOutputs::default();

        self.walk_unspent(pub_key_hash, |transaction, indices| {
            for &index in indices {
                if spendable.accumulated >= amount {
                    return ControlFlow::Break(());
                }

                spendable.accumulated = spendable
                    .accumulated
                    .saturating_add(transaction.outputs[index].value);
                spendable.outpoints.push(OutPoint {
                    txid: transaction.id.clone(),
                    out: index as i64,
                });
            }

            if spendable.accumulated >= amount {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;

        debug!(
            "Selected {} output(s) worth {} towards {}",
            spendable.outpoints.len(),
            spendable.accumulated,
            amount
        );
        Ok(spendable)
    }

    /// Sums the unspent outputs locked to a key hash
    pub fn balance(&self, pub_key_hash: &[u8]) -> Result<u64, LedgerError> {
        Ok(self
            .find_utxo(pub_key_hash)?
            .iter()
            .map(|output| output.value)
            .sum())
    }

    /// Every output consumed by some input on the chain ending at `tip`
    pub(crate) fn spent_outpoints(
        &self,
        tip: &[u8],
    ) -> Result<HashSet<(Vec<u8>, i64)>, LedgerError> {
        let mut spent = HashSet::new();

        for block in self.iter_from(tip) {
            for transaction in block?.transactions {
                if transaction.is_coinbase() {
                    continue;
                }
                for input in transaction.inputs {
                    spent.insert((input.id, input.out));
                }
            }
        }

        Ok(spent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;
    use crate::config::Config;
    use tempfile::TempDir;

    /// A ledger where `alice` received 100 at genesis, then paid `bob` 30 and 20
    fn funded_ledger(alice: &Wallet, bob: &Wallet) -> (TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path().join("ledger")).difficulty(8);
        let ledger = Ledger::init(&config, &alice.address()).unwrap();

        for amount in [30, 20] {
            let transfer = Transaction::new_transfer(alice, &bob.address(), amount, &ledger).unwrap();
            ledger.add_block(vec![transfer]).unwrap();
        }

        (dir, ledger)
    }

    #[test]
    fn test_find_utxo_after_transfers() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let (_dir, ledger) = funded_ledger(&alice, &bob);

        let alice_values: Vec<u64> = ledger
            .find_utxo(&alice.public_key_hash())
            .unwrap()
            .iter()
            .map(|output| output.value)
            .collect();
        assert_eq!(alice_values, vec![50]);

        // Tip first: the 20 payment comes before the 30 payment
        let bob_values: Vec<u64> = ledger
            .find_utxo(&bob.public_key_hash())
            .unwrap()
            .iter()
            .map(|output| output.value)
            .collect();
        assert_eq!(bob_values, vec![20, 30]);

        assert_eq!(ledger.balance(&bob.public_key_hash()).unwrap(), 50);
        assert_eq!(ledger.balance(&Wallet::new().public_key_hash()).unwrap(), 0);
    }

    #[test]
    fn test_find_unspent_transactions() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let (_dir, ledger) = funded_ledger(&alice, &bob);

        let bob_txs = ledger.find_unspent_transactions(&bob.public_key_hash()).unwrap();
        assert_eq!(bob_txs.len(), 2);

        // Alice's genesis coinbase and first change output are spent
        let alice_txs = ledger.find_unspent_transactions(&alice.public_key_hash()).unwrap();
        assert_eq!(alice_txs.len(), 1);
        assert_eq!(alice_txs[0].id, ledger.get_block(&ledger.last_hash()).unwrap().transactions[0].id);
    }

    #[test]
    fn test_spendable_outputs_stop_once_covered() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let (_dir, ledger) = funded_ledger(&alice, &bob);

        let spendable = ledger.find_spendable_outputs(&bob.public_key_hash(), 15).unwrap();
        assert_eq!(spendable.accumulated, 20);
        assert_eq!(spendable.outpoints.len(), 1);

        let spendable = ledger.find_spendable_outputs(&bob.public_key_hash(), 25).unwrap();
        assert_eq!(spendable.accumulated, 50);
        assert_eq!(spendable.outpoints.len(), 2);
    }

    #[test]
    fn test_spendable_outputs_when_short() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let (_dir, ledger) = funded_ledger(&alice, &bob);

        let spendable = ledger.find_spendable_outputs(&bob.public_key_hash(), 51).unwrap();
        assert_eq!(spendable.accumulated, 50);
        assert_eq!(spendable.outpoints.len(), 2);
    }

    #[test]
    fn test_selection_sums_to_accumulated() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let (_dir, ledger) = funded_ledger(&alice, &bob);

        for amount in [1, 20, 21, 50, 500] {
            let spendable = ledger.find_spendable_outputs(&bob.public_key_hash(), amount).unwrap();
            let total: u64 = spendable
                .outpoints
                .iter()
                .map(|outpoint| {
                    let transaction = ledger.find_transaction(&outpoint.txid).unwrap();
                    transaction.outputs[outpoint.out as usize].value
                })
                .sum();
            assert_eq!(total, spendable.accumulated);
            assert_eq!(spendable.accumulated >= amount, amount <= 50);
        }
    }

    #[test]
    fn test_zero_amount_selects_nothing() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let (_dir, ledger) = funded_ledger(&alice, &bob);

        let spendable = ledger.find_spendable_outputs(&bob.public_key_hash(), 0).unwrap();
        assert_eq!(spendable, SpendableOutputs::default());
    }

    #[test]
    fn test_spending_received_outputs() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let (_dir, ledger) = funded_ledger(&alice, &bob);

        // Bob combines both of his outputs to pay 45 back
        let transfer = Transaction::new_transfer(&bob, &alice.address(), 45, &ledger).unwrap();
        assert_eq!(transfer.inputs.len(), 2);
        ledger.add_block(vec![transfer]).unwrap();

        assert_eq!(ledger.balance(&alice.public_key_hash()).unwrap(), 95);
        assert_eq!(ledger.balance(&bob.public_key_hash()).unwrap(), 5);
        assert_eq!(ledger.spent_outpoints(&ledger.last_hash()).unwrap().len(), 4);
    }
}
