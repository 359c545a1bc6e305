//! Hop mesh node: transport backends, relay coordinator, gateway sync to a directory service.

pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod node;
pub mod reachability;
pub mod transport;

pub use directory::{DirectoryError, DirectoryService, HttpDirectory, MemoryDirectory};
pub use error::NodeError;
pub use node::{spawn, NodeConfig, NodeHandle};
pub use reachability::ReachabilityMonitor;
pub use transport::{ConnectError, Transport};
