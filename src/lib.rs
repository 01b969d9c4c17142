//! SkyMesh: store-and-forward mesh networking for LoRa-class radios.
//!
//! Battery-powered nodes discover each other through signed advertisement
//! floods, exchange end-to-end encrypted datagrams routed either by
//! opportunistic flooding or by previously learned source routes, and
//! acknowledge delivery with truncated hashes. A repeater role forwards
//! traffic for others and answers password-gated admin requests.

pub mod config;
pub mod crypto;
#[cfg(test)]
pub(crate) mod testutil;
pub mod identity;
pub mod mesh;
pub mod packet;
pub mod radio;
pub mod repeater;
pub mod session;

// Re-export identity types
pub use identity::{IdentityError, IdentityStore, LocalIdentity, PeerIdentity, SharedSecret};

// Re-export config types
pub use config::{Config, ConfigError, LimitsConfig, NodeConfig, RadioConfig};

// Re-export packet types
pub use packet::{
    AdvertData, NodeKind, Packet, PacketError, PacketPool, PayloadType, RoutePath, RouteType,
    SlotId, MAX_ADVERT_DATA_SIZE, MAX_PACKET_PAYLOAD, MAX_PATH_SIZE,
};

// Re-export mesh engine types
pub use mesh::{Mesh, MeshApp, MeshError, MeshStats, MeshTables, PeerSlot};

// Re-export session types
pub use session::{
    ChatEvents, ChatMesh, Contact, GroupChannel, SendStatus, MAX_CONTACTS, MAX_GROUP_CHANNELS,
    MAX_TEXT_LEN,
};

// Re-export repeater types
pub use repeater::{Repeater, RepeaterStats, CMD_GET_STATS, MAX_CLIENTS};

// Re-export radio collaborator traits
pub use radio::{Board, MillisecondClock, Radio, RadioError, RtcClock};
