//! Validator coordinator node.
//!
//! Runs the leader role of an off-chain VM validator set: admits the other
//! validators over TLS websockets and drives create/disputable/unanimous
//! rounds. Settlement goes through an in-memory development driver; a
//! production deployment swaps in a real on-chain driver.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use validator_coordination::{server, CoordinatorConfig, ValidatorCoordinator, ValidatorSet};
use validator_keys::PrivateKey;

mod config;
mod dev_driver;

use config::ValidatorSetConfig;
use dev_driver::DevDriver;

/// Off-chain VM validator coordinator
#[derive(Parser, Debug)]
#[command(name = "coordinator-node")]
#[command(about = "Leader node for an off-chain VM validator set", long_about = None)]
struct Args {
    /// Path to the hex-encoded secp256k1 signing key
    #[arg(long, default_value = "./coordinator.key")]
    key_file: PathBuf,

    /// Path to the validator-set file (JSON, addresses in index order)
    #[arg(long, default_value = "./validators.json")]
    validators_file: PathBuf,

    /// TLS certificate (PEM)
    #[arg(long, default_value = "./server.crt")]
    tls_cert: PathBuf,

    /// TLS private key (PEM)
    #[arg(long, default_value = "./server.key")]
    tls_key: PathBuf,

    /// Listen address for follower connections
    #[arg(long, default_value = "0.0.0.0:1236")]
    listen_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let key_hex = std::fs::read_to_string(&args.key_file)
        .with_context(|| format!("reading signing key {:?}", args.key_file))?;
    let key = PrivateKey::from_hex(key_hex.trim()).context("decoding signing key")?;

    let set_config = ValidatorSetConfig::load(&args.validators_file)?;
    let validators = ValidatorSet::new(set_config.addresses()?, key.address())?;
    tracing::info!(
        own = %key.address(),
        members = validators.count(),
        "loaded validator set"
    );

    let acceptor = server::load_tls_acceptor(&args.tls_cert, &args.tls_key)?;

    let mut config = CoordinatorConfig::default();
    config.listen_addr = args.listen_addr;

    let coordinator = ValidatorCoordinator::new(key, Arc::new(DevDriver::new()), validators, config);
    coordinator.serve(acceptor).await?;
    tracing::info!(
        vm = %hex::encode(coordinator.vm_id().as_bytes()),
        "coordinator running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
