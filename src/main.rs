use std::path::PathBuf;
use std::sync::Mutex;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;

use blockchain::crypto::{address_to_pub_key_hash, validate_address};
use blockchain::{Ledger, Transaction, Wallets};
use config::Config;

/// A single-node proof-of-work UTXO ledger
#[derive(Debug, Parser)]
#[command(name = "utxo-ledger", version, about)]
struct Cli {
    /// Directory of the ledger database
    #[arg(long, global = true, env = "LEDGER_DATA_DIR", default_value = config::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Path of the wallet file
    #[arg(long, global = true, env = "LEDGER_WALLET_FILE", default_value = config::DEFAULT_WALLET_FILE)]
    wallet_file: PathBuf,

    /// Proof-of-work difficulty in leading zero bits
    #[arg(long, global = true, env = "LEDGER_DIFFICULTY", default_value_t = config::DEFAULT_DIFFICULTY)]
    difficulty: u32,

    /// Amount minted by the genesis coinbase
    #[arg(long, global = true, env = "LEDGER_REWARD", default_value_t = config::DEFAULT_REWARD)]
    reward: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a new wallet and save it to the wallet file
    CreateWallet,

    /// List the addresses in the wallet file
    ListAddresses,

    /// Create a ledger whose genesis block rewards an address
    CreateBlockchain {
        #[arg(long)]
        address: String,
    },

    /// Print the balance of an address
    GetBalance {
        #[arg(long)]
        address: String,
    },

    /// Send tokens from a local wallet and mine the transfer into a block
    Send {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        amount: u64,
    },

    /// Print every block from the tip back to genesis
    PrintChain,

    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::get_block,
        api::handlers::get_transaction,
        api::handlers::get_balance,
        api::handlers::create_wallet,
        api::handlers::list_wallets,
        api::handlers::send
    ),
    components(
        schemas(
            api::schema::BlockView,
            api::schema::TransactionView,
            api::schema::TxInputView,
            api::schema::TxOutputView,
            api::handlers::ChainResponse,
            api::handlers::BalanceResponse,
            api::handlers::WalletResponse,
            api::handlers::SendRequest,
            api::handlers::SendResponse
        )
    ),
    tags(
        (name = "ledger", description = "Ledger API endpoints")
    ),
    info(
        title = "UTXO Ledger API",
        version = "1.0.0",
        description = "A single-node proof-of-work UTXO ledger",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

fn create_wallet(config: &Config) -> anyhow::Result<()> {
    let mut wallets = Wallets::load(&config.wallet_file).context("failed to load wallets")?;
    let address = wallets.add_wallet();
    wallets
        .save(&config.wallet_file)
        .context("failed to save wallets")?;

    println!("New address is: {}", address);
    Ok(())
}

fn list_addresses(config: &Config) -> anyhow::Result<()> {
    let wallets = Wallets::load(&config.wallet_file).context("failed to load wallets")?;
    for address in wallets.addresses() {
        println!("{}", address);
    }
    Ok(())
}

fn create_blockchain(config: &Config, address: &str) -> anyhow::Result<()> {
    if !validate_address(address) {
        bail!("address {} is not valid", address);
    }

    let ledger = Ledger::init(config, address).context("failed to create ledger")?;
    println!("Created ledger with genesis block {}", hex::encode(ledger.last_hash()));
    Ok(())
}

fn get_balance(config: &Config, address: &str) -> anyhow::Result<()> {
    let pub_key_hash = address_to_pub_key_hash(address)
        .with_context(|| format!("address {} is not valid", address))?;

    let ledger = Ledger::open(config).context("failed to open ledger")?;
    let balance = ledger.balance(&pub_key_hash)?;

    println!("Balance of {}: {}", address, balance);
    Ok(())
}

fn send(config: &Config, from: &str, to: &str, amount: u64) -> anyhow::Result<()> {
    if !validate_address(from) {
        bail!("sender address {} is not valid", from);
    }
    if !validate_address(to) {
        bail!("recipient address {} is not valid", to);
    }

    let wallets = Wallets::load(&config.wallet_file).context("failed to load wallets")?;
    let wallet = wallets.get(from)?;

    let ledger = Ledger::open(config).context("failed to open ledger")?;
    let transaction = Transaction::new_transfer(wallet, to, amount, &ledger)?;
    let block = ledger.add_block(vec![transaction])?;

    println!("Sent {} from {} to {} in block {}", amount, from, to, hex::encode(&block.hash));
    Ok(())
}

fn print_chain(config: &Config) -> anyhow::Result<()> {
    let ledger = Ledger::open(config).context("failed to open ledger")?;

    for block in ledger.iter() {
        let block = block.context("failed to read block")?;

        println!("Prev. hash: {}", hex::encode(&block.prev_hash));
        println!("Hash: {}", hex::encode(&block.hash));
        println!("Nonce: {}", block.nonce);
        println!("PoW: {}", ledger.validate_block(&block));
        for transaction in &block.transactions {
            println!("{}", transaction);
        }
        println!();
    }

    Ok(())
}

async fn serve(config: Config, host: String, port: u16) -> anyhow::Result<()> {
    let ledger = Ledger::open(&config).context("failed to open ledger")?;
    let wallets = Wallets::load(&config.wallet_file).context("failed to load wallets")?;

    let state = web::Data::new(api::AppState {
        ledger,
        wallets: Mutex::new(wallets),
        wallet_file: config.wallet_file.clone(),
    });

    info!("Starting HTTP server at http://{}:{}", host, port);

    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            .configure(api::configure_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", ApiDoc::openapi()),
            )
    })
    .bind((host.as_str(), port))
    .with_context(|| format!("failed to bind {}:{}", host, port))?
    .run()
    .await?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();
    let config = Config {
        data_dir: cli.data_dir,
        wallet_file: cli.wallet_file,
        difficulty: cli.difficulty,
        reward: cli.reward,
    };
    config.validate().context("invalid configuration")?;

    match cli.command {
        Command::CreateWallet => create_wallet(&config),
        Command::ListAddresses => list_addresses(&config),
        Command::CreateBlockchain { address } => create_blockchain(&config, &address),
        Command::GetBalance { address } => get_balance(&config, &address),
        Command::Send { from, to, amount } => send(&config, &from, &to, amount),
        Command::PrintChain => print_chain(&config),
        Command::Serve { host, port } => {
            actix_web::rt::System::new().block_on(serve(config, host, port))
        }
    }
}
