//! Configuration and logging shared by the mesh relay crates

pub mod config;
pub mod logging;

pub use config::{Config, MeshNetworkConfig, RelayConfig, SolanaConfig};
