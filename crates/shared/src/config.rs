use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mesh: MeshNetworkConfig,
    pub relay: RelayConfig,
    pub solana: SolanaConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeshNetworkConfig {
    /// Interval at which an active scan is refreshed in milliseconds (default: 5000)
    pub scan_interval_ms: u64,
    /// Upper bound for connect + service discovery + subscribe (default: 10000)
    pub connection_timeout_ms: u64,
    /// Upper bound for a single chunk write (default: 2000)
    pub write_timeout_ms: u64,
    /// Period of the session health check (default: 15000)
    pub health_check_interval_ms: u64,
    /// Idle time after which a session is considered gone (default: 60000)
    pub stale_session_timeout_ms: u64,
    /// Maximum simultaneous sessions across both roles (default: 8)
    pub max_connections: usize,
    /// Consecutive send failures before a session is torn down (default: 3)
    pub failure_threshold: u32,
    /// MTU assumed when the radio stack cannot report one (default: 185)
    pub default_mtu: usize,
    /// How long initialization waits for the radio to power on (default: 5000)
    pub power_on_timeout_ms: u64,
    /// Hop budget stamped on packets this node originates (default: 7)
    pub packet_ttl: u8,
    /// Advertised local name (default: "mesh-relay")
    pub device_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Lamports owed to each distinct relayer of a payload (default: 5000)
    pub relayer_fee_per_hop: u64,
    /// Hop budget for payloads this node originates and the most it honours on relayed ones (default: 5)
    pub max_relay_hops: u8,
    /// Age limit for relaying blockhash-anchored payloads in seconds (default: 60)
    pub non_durable_window_secs: i64,
    /// Payloads held while offline (default: 256)
    pub outbox_capacity: usize,
    /// Period of the internet reachability check (default: 10000)
    pub connectivity_check_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaConfig {
    pub rpc_url: String,
    pub max_retry_attempts: u32,
    /// JSON keypair file used to sign relayer fee settlements; an ephemeral key is used if unset
    pub keypair_path: Option<String>,
}

impl MeshNetworkConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn stale_session_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_session_timeout_ms)
    }

    pub fn power_on_timeout(&self) -> Duration {
        Duration::from_millis(self.power_on_timeout_ms)
    }
}

impl RelayConfig {
    pub fn non_durable_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.non_durable_window_secs)
    }

    pub fn connectivity_check_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity_check_interval_ms)
    }
}

impl Default for MeshNetworkConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 5_000,
            connection_timeout_ms: 10_000,
            write_timeout_ms: 2_000,
            health_check_interval_ms: 15_000,
            stale_session_timeout_ms: 60_000,
            max_connections: 8,
            failure_threshold: 3,
            default_mtu: 185,
            power_on_timeout_ms: 5_000,
            packet_ttl: 7,
            device_name: "mesh-relay".to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relayer_fee_per_hop: 5_000,
            max_relay_hops: 5,
            non_durable_window_secs: 60,
            outbox_capacity: 256,
            connectivity_check_interval_ms: 10_000,
        }
    }
}

impl Default for SolanaConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.devnet.solana.com".to_string(),
            max_retry_attempts: 3,
            keypair_path: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mesh: MeshNetworkConfig::default(),
            relay: RelayConfig::default(),
            solana: SolanaConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Config {
            mesh: MeshNetworkConfig {
                scan_interval_ms: env::var("MESH_SCAN_INTERVAL_MS")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()?,
                connection_timeout_ms: env::var("MESH_CONNECTION_TIMEOUT_MS")
                    .unwrap_or_else(|_| "10000".to_string())
                    .parse()?,
                write_timeout_ms: env::var("MESH_WRITE_TIMEOUT_MS")
                    .unwrap_or_else(|_| "2000".to_string())
                    .parse()?,
                health_check_interval_ms: env::var("MESH_HEALTH_CHECK_INTERVAL_MS")
                    .unwrap_or_else(|_| "15000".to_string())
                    .parse()?,
                stale_session_timeout_ms: env::var("MESH_STALE_SESSION_TIMEOUT_MS")
                    .unwrap_or_else(|_| "60000".to_string())
                    .parse()?,
                max_connections: env::var("MESH_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "8".to_string())
                    .parse()?,
                failure_threshold: env::var("MESH_FAILURE_THRESHOLD")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()?,
                default_mtu: env::var("MESH_DEFAULT_MTU")
                    .unwrap_or_else(|_| "185".to_string())
                    .parse()?,
                power_on_timeout_ms: env::var("MESH_POWER_ON_TIMEOUT_MS")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()?,
                packet_ttl: env::var("MESH_PACKET_TTL")
                    .unwrap_or_else(|_| "7".to_string())
                    .parse()?,
                device_name: env::var("MESH_DEVICE_NAME")
                    .unwrap_or_else(|_| "mesh-relay".to_string()),
            },
            relay: RelayConfig {
                relayer_fee_per_hop: env::var("RELAYER_FEE_PER_HOP")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()?,
                max_relay_hops: env::var("MAX_RELAY_HOPS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()?,
                non_durable_window_secs: env::var("RELAY_NON_DURABLE_WINDOW_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()?,
                outbox_capacity: env::var("RELAY_OUTBOX_CAPACITY")
                    .unwrap_or_else(|_| "256".to_string())
                    .parse()?,
                connectivity_check_interval_ms: env::var("RELAY_CONNECTIVITY_CHECK_INTERVAL_MS")
                    .unwrap_or_else(|_| "10000".to_string())
                    .parse()?,
            },
            solana: SolanaConfig {
                rpc_url: env::var("SOLANA_RPC_URL")
                    .unwrap_or_else(|_| "https://api.devnet.solana.com".to_string()),
                max_retry_attempts: env::var("SOLANA_MAX_RETRY_ATTEMPTS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()?,
                keypair_path: env::var("RELAYER_KEYPAIR_PATH").ok(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = Config::default();

        assert!(config.mesh.default_mtu > 8);
        assert!(config.mesh.failure_threshold > 0);
        assert!(config.mesh.stale_session_timeout() > config.mesh.health_check_interval());
        assert_eq!(config.mesh.write_timeout(), Duration::from_secs(2));
        assert_eq!(config.relay.non_durable_window(), chrono::Duration::seconds(60));
    }

    #[test]
    fn test_from_env_uses_defaults_and_overrides() {
        env::set_var("MESH_MAX_CONNECTIONS", "4");
        env::remove_var("MESH_WRITE_TIMEOUT_MS");

        let config = Config::from_env().unwrap();
        assert_eq!(config.mesh.max_connections, 4);
        assert_eq!(config.mesh.write_timeout_ms, 2000);

        env::set_var("MESH_MAX_CONNECTIONS", "not-a-number");
        assert!(Config::from_env().is_err());

        env::remove_var("MESH_MAX_CONNECTIONS");
    }
}
