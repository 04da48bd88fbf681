//! User-space masquerading gateway for emulated network controllers.
//!
//! A [`NetworkContext`] plays the router of one simulated Ethernet segment. It
//! answers ARP, RARP and ping for itself and carries guest TCP and UDP over
//! ordinary host sockets, so no privileges, tap devices or raw sockets are
//! needed.

pub mod checksum;
pub mod config;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod resolver;
pub mod socket;
pub mod table;
pub mod wire;

pub use config::{GatewayConfig, Ipv4Prefix};
pub use error::{ConfigError, GatewayError};
pub use gateway::{rarp_address, NetworkContext, TcpState};
pub use queue::OwnerToken;
