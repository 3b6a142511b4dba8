//! Outbound connection management.

pub mod backoff;
pub mod client;
pub mod connection;
pub mod supervisor;
pub mod transport;

pub use backoff::RestartBackoff;
pub use client::UpstreamClient;
pub use connection::{ConnectionStatus, OutboundConnection};
pub use supervisor::{SupervisorEvent, SupervisorStats, UpstreamSupervisor};
pub use transport::{Connector, RmcpConnector};
