//! Cross-server synchronization
//!
//! - `message` - Frame codec for the shared relay
//! - `relay` - Outbound invalidations, inbound reloads and a channel transport

pub mod message;
pub mod relay;

pub use message::{RelayMessage, NAMESPACE, SYNC_PLAYER};
pub use relay::{ChannelRelay, SyncRelayAdapter};
