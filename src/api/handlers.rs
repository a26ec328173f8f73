use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder};
use log::error;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::schema::{BlockView, TransactionView};
use crate::blockchain::crypto::{address_to_pub_key_hash, validate_address};
use crate::blockchain::storage::StorageError;
use crate::blockchain::{Ledger, LedgerError, Transaction, Wallets};

/// Shared state behind every handler
pub struct AppState {
    /// The ledger being served
    pub ledger: Ledger,

    /// Locally owned wallets
    pub wallets: Mutex<Wallets>,

    /// Where the wallets are saved
    pub wallet_file: PathBuf,
}

impl AppState {
    fn wallets(&self) -> MutexGuard<'_, Wallets> {
        self.wallets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Data structure for the shared state
pub type AppData = web::Data<AppState>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The number of blocks in the chain
    pub length: usize,

    /// The difficulty blocks are mined at
    pub difficulty: u32,

    /// Whether every block passes proof-of-work validation
    pub is_valid: bool,

    /// The blocks, tip first
    pub blocks: Vec<BlockView>,
}

/// Response for the balance endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub address: String,

    /// Sum of the unspent outputs locked to the address
    pub balance: u64,
}

/// Response for the create wallet endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WalletResponse {
    /// The new wallet's address
    pub address: String,
}

/// Request for the send endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct SendRequest {
    /// Sender address; must be a locally owned wallet
    pub from: String,

    /// Recipient address
    pub to: String,

    /// Amount to transfer
    pub amount: u64,
}

/// Response for the send endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct SendResponse {
    /// Id of the transfer transaction
    pub transaction_id: String,

    /// Hash of the block it was mined into
    pub block_hash: String,
}

fn error_json(status: StatusCode, message: String) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({ "error": message }))
}

fn ledger_error_response(err: &LedgerError) -> HttpResponse {
    let status = match err {
        LedgerError::InsufficientFunds { .. }
        | LedgerError::InvalidAmount(_)
        | LedgerError::InvalidTransaction(_)
        | LedgerError::DoubleSpend { .. }
        | LedgerError::ValueNotConserved { .. }
        | LedgerError::CryptoError(_) => StatusCode::BAD_REQUEST,
        LedgerError::NotFound(_)
        | LedgerError::TransactionNotFound(_)
        | LedgerError::StorageError(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
        _ => {
            error!("Ledger failure: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    error_json(status, err.to_string())
}

/// Get the full chain
///
/// Returns every block from the tip back to genesis with its PoW validity
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Chain retrieved successfully", body = ChainResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_chain(state: AppData) -> impl Responder {
    let mut blocks = Vec::new();

    for block in state.ledger.iter() {
        match block {
            Ok(block) => {
                let pow_valid = state.ledger.validate_block(&block);
                blocks.push(BlockView::new(&block, pow_valid));
            }
            Err(err) => return ledger_error_response(&err),
        }
    }

    let response = ChainResponse {
        length: blocks.len(),
        difficulty: state.ledger.difficulty(),
        is_valid: blocks.iter().all(|block| block.pow_valid),
        blocks,
    };

    HttpResponse::Ok().json(response)
}

/// Get a block by hash
#[utoipa::path(
    get,
    path = "/api/v1/blocks/{hash}",
    params(("hash" = String, Path, description = "Hex encoded block hash")),
    responses(
        (status = 200, description = "Block found", body = BlockView),
        (status = 400, description = "Malformed hash"),
        (status = 404, description = "Block not found")
    )
)]
pub async fn get_block(state: AppData, hash: web::Path<String>) -> impl Responder {
    let hash = match hex::decode(hash.into_inner()) {
        Ok(hash) => hash,
        Err(err) => return error_json(StatusCode::BAD_REQUEST, format!("Invalid hash: {}", err)),
    };

    match state.ledger.get_block(&hash) {
        Ok(block) => {
            let pow_valid = state.ledger.validate_block(&block);
            HttpResponse::Ok().json(BlockView::new(&block, pow_valid))
        }
        Err(err) => ledger_error_response(&err),
    }
}

/// Get a transaction by id
#[utoipa::path(
    get,
    path = "/api/v1/transactions/{id}",
    params(("id" = String, Path, description = "Hex encoded transaction id")),
    responses(
        (status = 200, description = "Transaction found", body = TransactionView),
        (status = 400, description = "Malformed id"),
        (status = 404, description = "Transaction not found")
    )
)]
pub async fn get_transaction(state: AppData, id: web::Path<String>) -> impl Responder {
    let id = match hex::decode(id.into_inner()) {
        Ok(id) => id,
        Err(err) => return error_json(StatusCode::BAD_REQUEST, format!("Invalid id: {}", err)),
    };

    match state.ledger.find_transaction(&id) {
        Ok(transaction) => HttpResponse::Ok().json(TransactionView::from(&transaction)),
        Err(err) => ledger_error_response(&err),
    }
}

/// Get the balance of an address
#[utoipa::path(
    get,
    path = "/api/v1/balance/{address}",
    params(("address" = String, Path, description = "Base58check address")),
    responses(
        (status = 200, description = "Balance retrieved successfully", body = BalanceResponse),
        (status = 400, description = "Invalid address")
    )
)]
pub async fn get_balance(state: AppData, address: web::Path<String>) -> impl Responder {
    let address = address.into_inner();
    let pub_key_hash = match address_to_pub_key_hash(&address) {
        Ok(pub_key_hash) => pub_key_hash,
        Err(err) => return error_json(StatusCode::BAD_REQUEST, err.to_string()),
    };

    match state.ledger.balance(&pub_key_hash) {
        Ok(balance) => HttpResponse::Ok().json(BalanceResponse { address, balance }),
        Err(err) => ledger_error_response(&err),
    }
}

/// Create a new wallet
///
/// Generates a key pair and saves it to the wallet file
#[utoipa::path(
    post,
    path = "/api/v1/wallet/new",
    responses(
        (status = 201, description = "Wallet created successfully", body = WalletResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn create_wallet(state: AppData) -> impl Responder {
    let mut wallets = state.wallets();
    let address = wallets.add_wallet();

    if let Err(err) = wallets.save(&state.wallet_file) {
        error!("Failed to save wallets: {}", err);
        return error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save wallet: {}", err),
        );
    }

    HttpResponse::Created().json(WalletResponse { address })
}

/// List wallet addresses
#[utoipa::path(
    get,
    path = "/api/v1/wallets",
    responses(
        (status = 200, description = "Addresses of the local wallets", body = Vec<String>)
    )
)]
pub async fn list_wallets(state: AppData) -> impl Responder {
    HttpResponse::Ok().json(state.wallets().addresses())
}

/// Send tokens
///
/// Builds and signs a transfer from a local wallet and mines it into a block
#[utoipa::path(
    post,
    path = "/api/v1/send",
    request_body = SendRequest,
    responses(
        (status = 201, description = "Transfer mined", body = SendResponse),
        (status = 400, description = "Invalid request or insufficient funds"),
        (status = 404, description = "Sender wallet not found"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn send(state: AppData, request: web::Json<SendRequest>) -> impl Responder {
    let SendRequest { from, to, amount } = request.into_inner();

    if !validate_address(&from) {
        return error_json(StatusCode::BAD_REQUEST, format!("Invalid sender address: {}", from));
    }
    if !validate_address(&to) {
        return error_json(StatusCode::BAD_REQUEST, format!("Invalid recipient address: {}", to));
    }

    let wallet = match state.wallets().get(&from) {
        Ok(wallet) => wallet.clone(),
        Err(err) => return error_json(StatusCode::NOT_FOUND, err.to_string()),
    };

    // Mining is CPU bound; keep it off the async workers
    let state = state.clone();
    let result = web::block(move || {
        let transaction = Transaction::new_transfer(&wallet, &to, amount, &state.ledger)?;
        let block = state.ledger.add_block(vec![transaction.clone()])?;
        Ok::<_, LedgerError>((transaction, block))
    })
    .await;

    match result {
        Ok(Ok((transaction, block))) => HttpResponse::Created().json(SendResponse {
            transaction_id: hex::encode(&transaction.id),
            block_hash: hex::encode(&block.hash),
        }),
        Ok(Err(err)) => ledger_error_response(&err),
        Err(err) => {
            error!("Mining task failed: {}", err);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
