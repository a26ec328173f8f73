use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::transaction::{TxInput, TxOutput};
use crate::blockchain::{Block, Transaction};

/// A transaction input with byte fields hex encoded
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TxInputView {
    /// Id of the transaction holding the spent output
    pub txid: String,

    /// Index of the spent output, -1 for coinbase
    pub out: i64,

    /// Compact r ‖ s signature
    pub signature: String,

    /// Raw public key of the spender
    pub pub_key: String,
}

impl From<&TxInput> for TxInputView {
    fn from(input: &TxInput) -> Self {
        TxInputView {
            txid: hex::encode(&input.id),
            out: input.out,
            signature: hex::encode(&input.signature),
            pub_key: hex::encode(&input.pub_key),
        }
    }
}

/// A transaction output with byte fields hex encoded
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TxOutputView {
    /// Amount in tokens
    pub value: u64,

    /// Public key hash the output is locked to
    pub pub_key_hash: String,
}

impl From<&TxOutput> for TxOutputView {
    fn from(output: &TxOutput) -> Self {
        TxOutputView {
            value: output.value,
            pub_key_hash: hex::encode(&output.pub_key_hash),
        }
    }
}

/// A transaction as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransactionView {
    /// Transaction id
    pub id: String,

    /// Whether this is a coinbase transaction
    pub coinbase: bool,

    pub inputs: Vec<TxInputView>,

    pub outputs: Vec<TxOutputView>,
}

impl From<&Transaction> for TransactionView {
    fn from(transaction: &Transaction) -> Self {
        TransactionView {
            id: hex::encode(&transaction.id),
            coinbase: transaction.is_coinbase(),
            inputs: transaction.inputs.iter().map(TxInputView::from).collect(),
            outputs: transaction.outputs.iter().map(TxOutputView::from).collect(),
        }
    }
}

/// A block as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BlockView {
    pub hash: String,

    /// Empty for genesis
    pub prev_hash: String,

    pub nonce: u64,

    /// Whether the block passes proof-of-work validation
    pub pow_valid: bool,

    pub transactions: Vec<TransactionView>,
}

impl BlockView {
    pub fn new(block: &Block, pow_valid: bool) -> Self {
        BlockView {
            hash: hex::encode(&block.hash),
            prev_hash: hex::encode(&block.prev_hash),
            nonce: block.nonce,
            pow_valid,
            transactions: block.transactions.iter().map(TransactionView::from).collect(),
        }
    }
}
