//! Socket shim for virtual networks.
//!
//! Each joined network gets a [`VirtualInterface`] that bridges three
//! parties: applications using BSD-style socket calls, a pluggable
//! userspace TCP/IP [`StackEngine`], and the virtual wire that carries
//! Ethernet frames between members of the network.

pub mod addr;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod iface;
pub mod multicast;
pub mod registry;
pub mod table;
pub mod test_util;

pub use bridge::{LocalSocket, NullBridge, ReactorBridge, ReactorEvent};
pub use config::ShimConfig;
pub use connection::{ConnectionId, ConnectionState, SocketType};
pub use engine::frame::{Frame, FrameHandler};
pub use engine::{EngineEvent, EngineSocket, SmoltcpConfig, SmoltcpEngine, StackEngine};
pub use error::{EngineError, Result, ShimError};
pub use iface::{VirtualInterface, VirtualInterfaceBuilder};
pub use multicast::{MulticastDelta, MulticastGroup};
pub use registry::ShimRegistry;
