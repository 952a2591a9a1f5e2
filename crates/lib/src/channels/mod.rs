//! Channel backends: pairing, status, disconnect, and outbound send for tenant sessions.

mod backend;
mod factory;
mod hosted;
mod local;

pub use backend::{ChannelBackend, ChannelError, ConnectionStatus, PairingStart};
pub use factory::{ChannelFactory, ChannelProvider};
pub use hosted::HostedChannel;
pub use local::LocalBridgeChannel;
