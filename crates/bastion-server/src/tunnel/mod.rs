//! Reverse-tunnel multiplexer.
//!
//! Agents behind NAT keep one outbound connection to the bastion. Each
//! connection carries many sessions: JSON control messages as text frames,
//! `id|payload` data frames as binary frames.

pub mod connection;
pub mod registry;
pub mod stream;
pub mod websocket;

pub use connection::TunnelOptions;
pub use registry::AgentRegistry;
