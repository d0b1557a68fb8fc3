//! Issuer node binary.
//!
//! Usage:
//!   issuer init [--config issuer.toml]   # create or load the identity
//!   issuer run  [--config issuer.toml]   # identity + state publisher + RPC

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use issuer::config::{IssuerConfig, CONFIG_FILE};
use issuer::crypto::{BabyJubJubKey, StateSigner};
use issuer::identity::{Identity, IdentityState};
use issuer::publisher::{EthStateContract, Publisher};
use issuer::rpc::{serve as rpc_serve, RpcState};
use issuer::storage::SledStorage;
use issuer::zkp::ExternalProver;

/// Name of the generated key file inside the data directory.
const KEY_FILE: &str = "babyjubjub.key";

/// Verifiable-credential issuer node.
#[derive(Parser, Debug)]
#[command(name = "issuer", version, about = "Verifiable-credential issuer node")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "ISSUER_CONFIG", default_value = CONFIG_FILE, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the issuer identity and exit.
    Init,
    /// Run the state publisher and the RPC server.
    Run,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = IssuerConfig::load(&cli.config)?;

    match cli.command {
        Command::Init => {
            let identity = load_identity(&config).await?;
            println!("{}", identity.identifier());
            Ok(())
        }
        Command::Run => run_node(config).await,
    }
}

fn load_signer(config: &IssuerConfig) -> Result<Arc<dyn StateSigner>, Box<dyn std::error::Error>> {
    let key = match &config.identity.babyjubjub_private_key {
        Some(hex_key) => BabyJubJubKey::from_hex(hex_key)?,
        None => BabyJubJubKey::load_or_generate(&config.data_dir.join(KEY_FILE))?,
    };
    Ok(Arc::new(key))
}

async fn load_identity(config: &IssuerConfig) -> Result<Arc<Identity>, Box<dyn std::error::Error>> {
    let db_path = config.db_path();
    std::fs::create_dir_all(&db_path)?;
    let storage = Arc::new(SledStorage::open(&db_path)?);
    let state = Arc::new(IdentityState::new(storage, config.identity.tree_depth)?);
    let identity = Identity::init(state, load_signer(config)?).await?;
    tracing::info!(identifier = %identity.identifier(), "Issuer identity ready");
    Ok(Arc::new(identity))
}

async fn run_node(config: IssuerConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting issuer node...");
    tracing::info!("Data: {}", config.data_dir.display());

    let identity = load_identity(&config).await?;
    let rpc_addr = config.rpc_addr()?;

    let endpoint = config.ethereum.endpoint()?;
    let contract = EthStateContract::connect(
        endpoint.rpc_url,
        endpoint.state_contract,
        endpoint.private_key,
    )
    .await?;
    let prover = ExternalProver::new(
        &config.prover.witness_calculator,
        &config.prover.prover,
        &config.identity.circuits_path,
    );

    let publisher = Publisher::new(
        identity.clone(),
        Arc::new(contract),
        Arc::new(prover),
        config.publisher(),
    );
    let rpc_state = RpcState::new(
        identity.clone(),
        publisher.trigger(),
        config.rpc.public_url.clone(),
    );

    let shutdown = CancellationToken::new();
    let rpc = tokio::spawn(rpc_serve(rpc_addr, rpc_state, shutdown.clone()));
    let mut publisher = tokio::spawn(publisher.run(shutdown.clone()));

    // The publisher only returns on shutdown, so an early exit is a failure.
    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutdown signal received");
            None
        }
        result = &mut publisher => Some(result),
    };
    shutdown.cancel();

    if let Ok(Err(e)) = rpc.await {
        tracing::error!("RPC server error: {}", e);
    }
    let (publisher, early) = match early_exit {
        Some(result) => (result, true),
        None => (publisher.await, false),
    };
    identity.state().storage().flush()?;
    publisher_exit(publisher, early)?;
    tracing::info!("Issuer node stopped");
    Ok(())
}

/// Turn the publisher task's end into the node's exit status.
fn publisher_exit(
    result: Result<(), tokio::task::JoinError>,
    early: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    match result {
        Err(e) => {
            tracing::error!("State publisher task failed: {}", e);
            Err(e.into())
        }
        Ok(()) if early => {
            tracing::error!("State publisher exited before shutdown");
            Err("state publisher exited before shutdown".into())
        }
        Ok(()) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn crashed_publisher_fails_the_node() {
        let handle: tokio::task::JoinHandle<()> =
            tokio::spawn(async { panic!("publisher crashed") });
        assert!(publisher_exit(handle.await, false).is_err());
        assert!(publisher_exit(Ok(()), true).is_err());
        assert!(publisher_exit(Ok(()), false).is_ok());
    }
}
