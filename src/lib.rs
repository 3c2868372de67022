//! PeerCall - Signaling Relay and Handshake Library
//!
//! Two endpoints find each other through short peer ids, swap opaque
//! connection-setup signals through a relay, and then talk over a direct
//! link that multiplexes chat and file transfers.

pub mod channel;
pub mod config;
pub mod direct;
pub mod handshake;
pub mod link;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod relay_client;
pub mod router;
pub mod share;

pub use channel::{ChannelEvent, FileMeta, Multiplexer};
pub use config::{ClientConfig, ServerConfig};
pub use handshake::{Effect, Event, HandshakeController, Notice, Phase, Role};
pub use protocol::{ClientMessage, ServerMessage, Signal};
pub use registry::IdentityRegistry;
pub use router::Router;
