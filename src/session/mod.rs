//! Application session layers.
//!
//! [`ChatMesh`] is the contact-oriented session: discovery from signed
//! adverts, text messaging with attempts and ACK timeouts, path learning
//! from flood returns, and group-channel broadcasts. It owns the contact
//! and channel tables and implements [`MeshApp`](crate::mesh::MeshApp) so
//! the forwarding engine can dispatch into it; UI concerns stay behind the
//! [`ChatEvents`] collaborator trait.

mod channel;
mod chat;
mod contact;
#[cfg(test)]
mod tests;

use thiserror::Error;

pub use channel::GroupChannel;
pub use chat::{ChatEvents, ChatMesh};
pub use contact::Contact;

use crate::mesh::MeshError;

/// Maximum number of contacts a node tracks.
pub const MAX_CONTACTS: usize = 32;

/// Maximum number of group channels.
pub const MAX_GROUP_CHANNELS: usize = 8;

/// Longest text message body in bytes.
pub const MAX_TEXT_LEN: usize = 150;

/// How a message left the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// No known route; sent as an opportunistic flood.
    SentFlood,
    /// Sent along the contact's learned source route.
    SentDirect,
}

/// Caller-visible session failures.
///
/// Everything else on the inbound path is recovered locally (counter plus
/// debug line); only these reach the UI.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("text too long: {0} bytes")]
    TextTooLong(usize),

    #[error("table full")]
    TableFull,

    #[error("no such contact")]
    NoContact,

    #[error("no such channel")]
    NoChannel,

    #[error("invalid channel key: {0}")]
    InvalidChannelKey(String),

    #[error("mesh error: {0}")]
    Mesh(#[from] MeshError),
}
