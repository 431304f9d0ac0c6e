// bustapay/src/main.rs

//! Command-line entry point: `bustapay receive` runs the HTTP receiver,
//! `bustapay send` drives one payment end to end. Grounded on the pack's
//! clap-derive, parse-then-dispatch CLI shape, rebuilt around the two
//! bustapay flows.

use anyhow::{bail, Context, Result};
use bitcoin::Address;
use clap::{Parser, Subcommand};
use config::Config;
use node::{BitcoinCoreClient, NodeClient};
use protocol::NodeFactory;
use server::AppState;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to a config file. If omitted, the default config path is used
    /// when it exists, and built-in defaults otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP receiver that assembles partial transactions.
    Receive {
        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send a payment to a receiver's bustapay endpoint.
    Send {
        /// Destination address.
        address: String,
        /// The receiver's bustapay URL.
        url: String,
        /// Payment amount in BTC.
        amount_btc: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = Config::load(cli.config.clone()).context("loading configuration")?;
    cfg.apply_env_overrides();
    if cli.verbose {
        cfg.logging.verbose = true;
    }
    logging::init(cfg.logging.verbose);

    match cli.command {
        Command::Receive { port } => run_receive(cfg, port).await,
        Command::Send {
            address,
            url,
            amount_btc,
        } => run_send(cfg, address, url, amount_btc).await,
    }
}

async fn run_receive(cfg: Config, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(cfg.server.port);
    let bitcoind_cfg = cfg.bitcoind.clone();

    let node: Arc<dyn NodeClient> = Arc::new(BitcoinCoreClient::new(&bitcoind_cfg));
    let monitor_factory: NodeFactory = {
        let bitcoind_cfg = bitcoind_cfg.clone();
        Arc::new(move || Arc::new(BitcoinCoreClient::new(&bitcoind_cfg)) as Arc<dyn NodeClient>)
    };
    let state = Arc::new(AppState::new(node, monitor_factory, cfg.persist.data_dir.clone()));

    server::serve(port, state)
        .await
        .context("receiver server exited with an error")
}

async fn run_send(cfg: Config, address: String, url: String, amount_btc: f64) -> Result<()> {
    if url.trim().is_empty() {
        bail!("receiver URL must not be empty");
    }
    if !amount_btc.is_finite() || amount_btc <= 0.0 {
        bail!("amount must be a positive number of bitcoin");
    }
    let amount_sat = (amount_btc * 100_000_000.0).round() as i64;

    let unchecked = Address::from_str(&address).context("parsing destination address")?;

    let node = BitcoinCoreClient::new(&cfg.bitcoind);
    let network = node.get_chain_params().await.context("querying node chain")?;
    let destination = unchecked
        .require_network(network)
        .context("destination address does not match the node's network")?;

    let txid = protocol::send_run(&node, &url, &destination, amount_sat)
        .await
        .context("sending payment")?;
    println!("{txid}");
    Ok(())
}
