#![forbid(unsafe_code)]
//! Nous validator node launcher

use clap::Parser;
use colored::*;
use nouschain::config::load_config;
use nouschain::crypto::KeyPair;
use nouschain::genesis::GENESIS_RULES;
use nouschain::node::{init_tracing, Node};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about = "Nous proof-of-stake node")]
struct Cli {
    /// TOML configuration file; defaults apply when it is missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the peer listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Extra bootstrap peer (`host:port`), repeatable
    #[arg(short, long = "peer")]
    peers: Vec<String>,

    /// Produce blocks in this node's slots
    #[arg(long, default_value_t = false)]
    produce: bool,

    /// Print a fresh secret key and its address, then exit
    #[arg(long, default_value_t = false)]
    keygen: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.keygen {
        let keypair = KeyPair::generate();
        println!("{} {}", "address:".bright_cyan(), keypair.address());
        println!("{} {}", "secret_key:".bright_yellow(), keypair.secret_hex());
        return Ok(());
    }

    init_tracing();

    let mut config = load_config(Some(&cli.config))?;
    if let Some(port) = cli.port {
        config.network.p2p_port = port;
    }
    config.network.bootstrap_peers.extend(cli.peers);
    if cli.produce {
        config.producer.enabled = true;
    }

    let keypair = match &config.identity.secret_key {
        Some(secret) => KeyPair::from_secret_bytes(&hex::decode(secret.trim())?)?,
        None => {
            let keypair = KeyPair::generate();
            info!("No identity configured, generated ephemeral key");
            keypair
        }
    };

    println!("{}", "=== Nous Node ===".bright_magenta().bold());
    println!("{} {}", "Address:".cyan(), keypair.address());
    println!("{} {}", "Genesis:".cyan(), GENESIS_RULES.genesis_message);
    println!("{} {:#x}", "Network:".cyan(), config.network.network_id);

    let node = Node::new(config, keypair)?;
    let local = node.start().await?;
    println!("{} {}", "Listening on".green(), local);

    tokio::signal::ctrl_c().await?;
    println!("{}", "Shutting down...".yellow());
    node.stop();

    let stats = node.stats();
    println!(
        "{} height {} ({} finalized), {} peers, {} pending",
        "Stopped at".bright_cyan(),
        stats.height,
        stats.finalized_height,
        stats.peers,
        stats.pending_txs
    );
    Ok(())
}
