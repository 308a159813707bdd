//! Bitnode daemon
//!
//! Command-line entry point: starts the P2P node, and offers offline
//! inspection of the persisted address book and ban list.

use bitnode::chain::ChainState;
use bitnode::core::params::{Network, Params};
use bitnode::network::{unix_time, AddrManager, BanList, Node, NodeConfig};
use bitnode::storage::{Storage, StorageConfig};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Parser)]
#[command(name = "bitnode")]
#[command(version = "0.1.0")]
#[command(about = "A Bitcoin-protocol peer node", long_about = None)]
struct Cli {
    /// Data directory for peers.dat / banlist.dat
    #[arg(short, long, default_value = ".bitnode")]
    data_dir: PathBuf,

    /// Network to join: main, testnet or regtest
    #[arg(short, long, default_value = "main")]
    network: Network,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the P2P node
    Start {
        /// Listen port (default: the network's standard port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Peers to connect to at startup (host:port)
        #[arg(short, long)]
        connect: Vec<SocketAddr>,

        /// Do not accept inbound connections
        #[arg(long)]
        no_listen: bool,

        /// Do not dial outbound peers automatically
        #[arg(long)]
        no_dial: bool,
    },

    /// Summarize the persisted address book
    Peers,

    /// List active bans
    Bans,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let cli = Cli::parse();

    let storage = Storage::new(StorageConfig {
        data_dir: cli.data_dir.clone(),
        ..Default::default()
    })?;

    match cli.command {
        Commands::Start {
            port,
            connect,
            no_listen,
            no_dial,
        } => {
            run_node(cli.network, port, connect, !no_listen, !no_dial, storage).await?;
        }

        Commands::Peers => {
            match storage.load_peers()? {
                Some(addrman) => {
                    println!(
                        "{} addresses known ({} new, {} tried)",
                        addrman.len(),
                        addrman.new_count(),
                        addrman.tried_count()
                    );
                }
                None => println!("no peers.dat yet"),
            }
        }

        Commands::Bans => {
            match storage.load_banlist()? {
                Some(bans) => {
                    let now = unix_time();
                    for (subnet, entry) in bans.entries() {
                        let left = (entry.ban_until - now).max(0);
                        println!("{subnet}  {:?}  {left}s remaining", entry.reason);
                    }
                    if bans.is_empty() {
                        println!("no active bans");
                    }
                }
                None => println!("no banlist.dat yet"),
            }
        }
    }

    Ok(())
}

async fn run_node(
    network: Network,
    port: Option<u16>,
    connect: Vec<SocketAddr>,
    listen: bool,
    dial: bool,
    storage: Storage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let params = Params::new(network);

    let addrman = match storage.load_peers()? {
        Some(loaded) => {
            log::info!("loaded {} addresses from peers.dat", loaded.len());
            loaded
        }
        None => AddrManager::new(),
    };
    let bans = match storage.load_banlist()? {
        Some(mut loaded) => {
            loaded.sweep(unix_time());
            log::info!("loaded {} bans from banlist.dat", loaded.len());
            loaded
        }
        None => BanList::new(),
    };

    let config = NodeConfig {
        network,
        port,
        listen,
        dial,
        connect,
    };
    let chain = Arc::new(RwLock::new(ChainState::new(&params)));
    let addrman = Arc::new(RwLock::new(addrman));
    let bans = Arc::new(RwLock::new(bans));
    let node = Arc::new(Node::new(config, chain, addrman.clone(), bans.clone()));

    let runner = tokio::spawn(node.clone().start());

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    node.stop().await;
    let _ = runner.await;

    // Persist what we learned this session
    {
        let mut bans = bans.write().await;
        bans.sweep(unix_time());
        storage.save_banlist(&bans)?;
    }
    storage.save_peers(&*addrman.read().await)?;
    log::info!("state saved, bye");
    Ok(())
}
