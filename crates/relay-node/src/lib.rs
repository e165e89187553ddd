//! Mesh relay node: carries offline Solana transfers across the BLE mesh and
//! submits them once the internet is reachable

pub mod connectivity;
pub mod node;

pub use connectivity::{ConnectivityMonitor, Transition};
pub use node::{Disposition, RelayNode};
