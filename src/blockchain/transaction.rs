use std::collections::HashMap;
use std::fmt;

use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::chain::{Ledger, LedgerError};
use super::crypto::{
    self, address_to_pub_key_hash, public_key_hash, CryptoError, Wallet, PUBLIC_KEY_LENGTH,
    SIGNATURE_LENGTH,
};

/// Previous transactions referenced by a transaction's inputs, keyed by hex id
pub type PreviousTransactions = HashMap<String, Transaction>;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Previous transaction {0} is missing")]
    MissingPreviousTransaction(String),

    #[error("Output {index} does not exist in transaction {txid}")]
    OutputIndexOutOfRange { txid: String, index: i64 },

    #[error("Malformed signature on input {input}: expected {expected} bytes, got {actual}")]
    MalformedSignature {
        input: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Malformed public key on input {input}: expected {expected} bytes, got {actual}")]
    MalformedPublicKey {
        input: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// A reference to an output of an earlier transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction holding the spent output, empty for coinbase
    pub id: Vec<u8>,

    /// Index of the spent output, -1 for coinbase
    pub out: i64,

    /// Compact `r ‖ s` signature, empty for coinbase
    pub signature: Vec<u8>,

    /// Spender's raw public key (`x ‖ y`); the memo for coinbase
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// Whether this input was made by the owner of `pub_key_hash`
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        public_key_hash(&self.pub_key) == pub_key_hash
    }
}

/// An amount of tokens locked to a public key hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount in tokens
    pub value: u64,

    /// RIPEMD-160(SHA-256(pubkey)) of the owner
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    /// Creates an output paying `value` to an address
    pub fn new(value: u64, address: &str) -> Result<Self, CryptoError> {
        Ok(TxOutput {
            value,
            pub_key_hash: address_to_pub_key_hash(address)?,
        })
    }

    /// Whether this output is spendable by the owner of `pub_key_hash`
    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

/// Represents a UTXO transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// SHA-256 of the transaction encoded with this field emptied
    pub id: Vec<u8>,

    /// Outputs being spent
    pub inputs: Vec<TxInput>,

    /// Outputs being created
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Creates a coinbase transaction minting `reward` to an address
    ///
    /// # Arguments
    ///
    /// * `to` - The address receiving the reward
    /// * `memo` - Arbitrary data carried in the input; defaults to "Coins to <to>"
    /// * `reward` - The amount minted
    pub fn coinbase(to: &str, memo: &str, reward: u64) -> Result<Self, TransactionError> {
        let memo = if memo.is_empty() {
            format!("Coins to {}", to)
        } else {
            memo.to_string()
        };

        let input = TxInput {
            id: Vec::new(),
            out: -1,
            signature: Vec::new(),
            pub_key: memo.into_bytes(),
        };
        let output = TxOutput::new(reward, to)?;

        let mut transaction = Transaction {
            id: Vec::new(),
            inputs: vec![input],
            outputs: vec![output],
        };
        transaction.set_id()?;

        Ok(transaction)
    }

    /// Creates and signs a transfer of `amount` from a wallet to an address
    ///
    /// Spends outputs in the order the ledger offers them and returns any
    /// excess to the sender as change.
    ///
    /// # Arguments
    ///
    /// * `from` - The sender's wallet
    /// * `to` - The recipient's address
    /// * `amount` - The amount to transfer
    /// * `ledger` - The ledger to draw spendable outputs from
    pub fn new_transfer(
        from: &Wallet,
        to: &str,
        amount: u64,
        ledger: &Ledger,
    ) -> Result<Self, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let to_hash = address_to_pub_key_hash(to)?;
        let from_hash = from.public_key_hash();

        let spendable = ledger.find_spendable_outputs(&from_hash, amount)?;
        if spendable.accumulated < amount {
            return Err(LedgerError::InsufficientFunds {
                required: amount,
                available: spendable.accumulated,
            });
        }

        let inputs = spendable
            .outpoints
            .into_iter()
            .map(|outpoint| TxInput {
                id: outpoint.txid,
                out: outpoint.out,
                signature: Vec::new(),
                pub_key: from.public_key().to_vec(),
            })
            .collect();

        let mut outputs = vec![TxOutput {
            value: amount,
            pub_key_hash: to_hash,
        }];
        if spendable.accumulated > amount {
            outputs.push(TxOutput {
                value: spendable.accumulated - amount,
                pub_key_hash: from_hash,
            });
        }

        let mut transaction = Transaction {
            id: Vec::new(),
            inputs,
            outputs,
        };
        transaction.set_id()?;
        ledger.sign_transaction(&mut transaction, from.secret_key())?;

        Ok(transaction)
    }

    /// Sums the values of the outputs this transaction spends
    pub fn input_value(&self, prev_txs: &PreviousTransactions) -> Result<u128, TransactionError> {
        if self.is_coinbase() {
            return Ok(0);
        }

        let mut total = 0u128;
        for input in &self.inputs {
            total += u128::from(referenced_output(input, prev_txs)?.value);
        }
        Ok(total)
    }

    /// Sums the values of this transaction's outputs
    pub fn output_value(&self) -> u128 {
        self.outputs.iter().map(|output| u128::from(output.value)).sum()
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].id.is_empty() && self.inputs[0].out == -1
    }

    /// Content hash of the transaction with its id emptied
    pub fn hash(&self) -> Result<Vec<u8>, TransactionError> {
        let mut copy = self.clone();
        copy.id = Vec::new();

        Ok(crypto::sha256(&copy.serialize()?))
    }

    /// Recomputes and stores the id
    pub fn set_id(&mut self) -> Result<(), TransactionError> {
        self.id = self.hash()?;
        Ok(())
    }

    /// Encodes the transaction
    pub fn serialize(&self) -> Result<Vec<u8>, TransactionError> {
        bincode::serialize(self).map_err(|e| TransactionError::SerializationError(e.to_string()))
    }

    /// Decodes a transaction
    pub fn deserialize(bytes: &[u8]) -> Result<Self, TransactionError> {
        bincode::deserialize(bytes)
            .map_err(|e| TransactionError::DeserializationError(e.to_string()))
    }

    /// Copy with every input's signature and public key cleared
    ///
    /// This is the form that gets hashed for signing.
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                id: input.id.clone(),
                out: input.out,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();

        Transaction {
            id: self.id.clone(),
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Signs every input with `secret_key`
    ///
    /// Coinbase transactions are left untouched. Fails before signing anything
    /// if a referenced previous transaction is missing from `prev_txs`.
    pub fn sign(
        &mut self,
        secret_key: &SecretKey,
        prev_txs: &PreviousTransactions,
    ) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }

        for input in &self.inputs {
            referenced_output(input, prev_txs)?;
        }

        let mut copy = self.trimmed_copy();
        for index in 0..self.inputs.len() {
            let digest = copy.signing_digest(index, prev_txs)?;
            self.inputs[index].signature = crypto::sign_digest(secret_key, &digest)?;
        }

        Ok(())
    }

    /// Verifies the signature on every input
    ///
    /// # Returns
    ///
    /// Ok(false) on the first input that fails, Ok(true) if all pass. Coinbase
    /// transactions always verify.
    pub fn verify(&self, prev_txs: &PreviousTransactions) -> Result<bool, TransactionError> {
        if self.is_coinbase() {
            return Ok(true);
        }

        for input in &self.inputs {
            referenced_output(input, prev_txs)?;
        }

        let mut copy = self.trimmed_copy();
        for (index, input) in self.inputs.iter().enumerate() {
            if input.signature.len() != SIGNATURE_LENGTH {
                return Err(TransactionError::MalformedSignature {
                    input: index,
                    expected: SIGNATURE_LENGTH,
                    actual: input.signature.len(),
                });
            }
            if input.pub_key.len() != PUBLIC_KEY_LENGTH {
                return Err(TransactionError::MalformedPublicKey {
                    input: index,
                    expected: PUBLIC_KEY_LENGTH,
                    actual: input.pub_key.len(),
                });
            }

            // The key must own the output it spends
            let spent = referenced_output(input, prev_txs)?;
            if !input.uses_key(&spent.pub_key_hash) {
                return Ok(false);
            }

            let digest = copy.signing_digest(index, prev_txs)?;
            let public_key = match crypto::public_key_from_raw(&input.pub_key) {
                Ok(public_key) => public_key,
                Err(_) => return Ok(false),
            };

            if !crypto::verify_digest(&public_key, &digest, &input.signature)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Per-input signing message, computed on a trimmed copy
    fn signing_digest(
        &mut self,
        index: usize,
        prev_txs: &PreviousTransactions,
    ) -> Result<Vec<u8>, TransactionError> {
        let locking_hash = referenced_output(&self.inputs[index], prev_txs)?
            .pub_key_hash
            .clone();

        self.inputs[index].signature = Vec::new();
        self.inputs[index].pub_key = locking_hash;
        self.id = self.hash()?;
        self.inputs[index].pub_key = Vec::new();

        Ok(self.id.clone())
    }
}

fn referenced_output<'a>(
    input: &TxInput,
    prev_txs: &'a PreviousTransactions,
) -> Result<&'a TxOutput, TransactionError> {
    let txid = hex::encode(&input.id);
    let prev_tx = prev_txs
        .get(&txid)
        .ok_or_else(|| TransactionError::MissingPreviousTransaction(txid.clone()))?;

    usize::try_from(input.out)
        .ok()
        .and_then(|index| prev_tx.outputs.get(index))
        .ok_or(TransactionError::OutputIndexOutOfRange {
            txid,
            index: input.out,
        })
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", hex::encode(&self.id))?;
        for (index, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {}:", index)?;
            writeln!(f, "       TXID:      {}", hex::encode(&input.id))?;
            writeln!(f, "       Out:       {}", input.out)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.pub_key))?;
        }
        for (index, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {}:", index)?;
            writeln!(f, "       Value:  {}", output.value)?;
            writeln!(f, "       Script: {}", hex::encode(&output.pub_key_hash))?;
        }
        Ok(())
    }
}
