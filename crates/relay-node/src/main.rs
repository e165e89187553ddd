use anyhow::{anyhow, Result};
use ble_mesh::{ConnectionManager, PlatformRadio};
use blockchain::SolanaLedger;
use relay_node::RelayNode;
use shared::config::{Config, SolanaConfig};
use shared::logging::init_from_env;
use solana_sdk::signature::{read_keypair_file, Keypair, Signer};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (also reads .env, which may set LOG_FORMAT)
    let config = Config::from_env()?;

    init_from_env()?;

    info!("Starting mesh relay");
    info!(
        "Mesh: max {} sessions, ttl {}; relay: {} hops at {} lamports",
        config.mesh.max_connections,
        config.mesh.packet_ttl,
        config.relay.max_relay_hops,
        config.relay.relayer_fee_per_hop
    );

    let relayer = load_relayer_keypair(&config.solana)?;
    info!("Relayer key: {}", relayer.pubkey());

    let ledger = Arc::new(SolanaLedger::from_config(&config.solana));
    info!("Solana ledger client initialized ({})", ledger.rpc_url());

    let radio = Arc::new(PlatformRadio::detect(&config.mesh).await?);
    info!("BLE radio detected");

    let manager = Arc::new(ConnectionManager::new(radio, config.mesh.clone()));
    let node = Arc::new(RelayNode::new(manager, ledger, relayer, &config));
    node.start().await?;

    info!("Mesh relay running as {}; press Ctrl-C to stop", node.local_id());
    tokio::signal::ctrl_c().await?;

    node.shutdown().await?;
    info!("Mesh relay stopped");
    Ok(())
}

fn load_relayer_keypair(config: &SolanaConfig) -> Result<Keypair> {
    match &config.keypair_path {
        Some(path) => read_keypair_file(path)
            .map_err(|e| anyhow!("failed to read relayer keypair {}: {}", path, e)),
        None => {
            warn!("RELAYER_KEYPAIR_PATH not set; using an ephemeral relayer key");
            Ok(Keypair::new())
        }
    }
}
