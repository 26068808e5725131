//! orbis-node: deliberation-to-ledger node entry point.
//!
//! Exit codes: 0 normal, 1 fatal config error, 2 keystore unlock failure,
//! 3 chain integrity failure on replay.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

use orbis_ethica::config::{NodeConfig, ProviderKind};
use orbis_ethica::errors::NodeError;
use orbis_ethica::node;

#[derive(Debug, Parser)]
#[command(name = "orbis-node", about = "Orbis Ethica deliberation-to-ledger node")]
struct Args {
    /// Data directory (chain.db, memory.db, .keys/, config.json, peers.json).
    #[arg(long, env = "ORBIS_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = NodeConfig::load_from_env();
    config.data_dir = args.data_dir;

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::from(1);
    }

    // A missing passphrase is fatal only with a real provider configured;
    // mock-provider nodes fall back to an ephemeral identity.
    let key_password = std::env::var("KEY_PASSWORD").ok();
    if key_password.is_none() && config.provider != ProviderKind::Mock {
        error!("KEY_PASSWORD is required to unlock the node identity");
        return ExitCode::from(1);
    }

    match node::run(config, key_password.as_deref()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(NodeError::Auth(e)) => {
            error!("could not unlock node identity: {e}");
            ExitCode::from(2)
        }
        Err(NodeError::Integrity(e)) => {
            error!("chain integrity failure: {e}");
            ExitCode::from(3)
        }
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::from(1)
        }
    }
}
