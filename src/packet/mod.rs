//! Wire Format Parsing and Serialization
//!
//! Defines the SkyMesh on-air packet format. Every frame begins with a
//! single header byte followed by the routing path and payload:
//!
//! ```text
//! [ header(1) | transport_code(2, transport routes only) | path_len(1) | path[path_len] | payload[] ]
//! ```
//!
//! ## Header byte
//!
//! | Bits | Field        | Notes                                   |
//! |------|--------------|------------------------------------------|
//! | 0-1  | route_type   | flood / direct, plain or transport       |
//! | 2-5  | payload_type | see [`PayloadType`]                      |
//! | 6    | return path  | set on packets carrying a path return    |
//! | 7    | reserved     | must be zero                             |
//!
//! For flood packets the path records the hops already taken (each relay
//! appends its one-byte relay id); for direct packets it is the source
//! route still to traverse (each relay strips its own id from the front).

mod advert;
mod pool;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use advert::{build_advert, parse_advert, AdvertData, NodeKind, ADVERT_OVERHEAD};
pub use pool::{PacketPool, SlotId, POOL_CAPACITY};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of relay bytes a path can carry.
pub const MAX_PATH_SIZE: usize = 64;

/// Maximum payload bytes per packet.
pub const MAX_PACKET_PAYLOAD: usize = 184;

/// Maximum advert app_data bytes.
pub const MAX_ADVERT_DATA_SIZE: usize = 32;

/// Maximum encoded packet size: header + transport code + path_len + path + payload.
pub const MAX_PACKET_SIZE: usize = 1 + 2 + 1 + MAX_PATH_SIZE + MAX_PACKET_PAYLOAD;

/// Size of an ACK payload (truncated hash).
pub const ACK_PAYLOAD_SIZE: usize = 4;

/// Header flag: packet carries a return path in its payload.
pub const FLAG_HAS_RETURN_PATH: u8 = 0x40;

/// Header flag reserved for a future revision; must be zero.
pub const FLAG_RESERVED: u8 = 0x80;

// ============================================================================
// Errors
// ============================================================================

/// Errors from packet encoding and decoding.
///
/// All decode failures are recoverable data-plane events: the engine drops
/// the frame and bumps a counter. `BadSignature` is counted separately from
/// the malformed family.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("truncated packet: {0} bytes")]
    Truncated(usize),

    #[error("reserved header flags set: {0:#04x}")]
    ReservedFlags(u8),

    #[error("unknown payload type: {0}")]
    UnknownPayloadType(u8),

    #[error("path too long: {0}")]
    PathTooLong(usize),

    #[error("payload too long: {0}")]
    PayloadTooLong(usize),

    #[error("malformed advert payload")]
    MalformedAdvert,

    #[error("advert signature verification failed")]
    BadSignature,

    #[error("malformed advert app data")]
    MalformedAppData,
}

// ============================================================================
// Header Fields
// ============================================================================

/// Routing discipline for a packet (header bits 0-1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RouteType {
    /// Flood carried across a transport bridge (2-byte transport code follows).
    TransportFlood = 0,
    /// Opportunistic flood; relays append their id and may retransmit.
    Flood = 1,
    /// Source-routed; relays strip their id from the front of the path.
    Direct = 2,
    /// Direct carried across a transport bridge.
    TransportDirect = 3,
}

impl RouteType {
    /// Try to convert from the low two header bits.
    pub fn from_bits(b: u8) -> Self {
        match b & 0x03 {
            0 => RouteType::TransportFlood,
            1 => RouteType::Flood,
            2 => RouteType::Direct,
            _ => RouteType::TransportDirect,
        }
    }

    /// Whether relays grow the path as the packet travels.
    pub fn is_flood(self) -> bool {
        matches!(self, RouteType::Flood | RouteType::TransportFlood)
    }

    /// Whether the packet is source-routed.
    pub fn is_direct(self) -> bool {
        !self.is_flood()
    }

    /// Whether a 2-byte transport code follows the header.
    pub fn has_transport_code(self) -> bool {
        matches!(self, RouteType::TransportFlood | RouteType::TransportDirect)
    }
}

/// Payload kind carried by a packet (header bits 2-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    /// Authenticated request from a known client (sealed).
    Req = 0,
    /// Response to a request (sealed).
    Response = 1,
    /// Text message (sealed).
    TxtMsg = 2,
    /// Bare acknowledgement: 4-byte truncated hash.
    Ack = 3,
    /// Signed, unencrypted self-advertisement.
    Advert = 4,
    /// Group-channel text (sealed under the channel PSK key).
    GrpTxt = 5,
    /// Anonymous request from an unknown sender (sealed, carries pubkey).
    AnonReq = 7,
    /// Path return: reversed hop list plus optional piggybacked payload.
    Path = 8,
}

impl PayloadType {
    /// Try to convert from header bits 2-5.
    pub fn from_bits(b: u8) -> Option<Self> {
        match b {
            0 => Some(PayloadType::Req),
            1 => Some(PayloadType::Response),
            2 => Some(PayloadType::TxtMsg),
            3 => Some(PayloadType::Ack),
            4 => Some(PayloadType::Advert),
            5 => Some(PayloadType::GrpTxt),
            7 => Some(PayloadType::AnonReq),
            8 => Some(PayloadType::Path),
            _ => None,
        }
    }

    /// Convert to the raw 4-bit value.
    pub fn to_bits(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Route Path
// ============================================================================

/// An ordered sequence of single-byte relay identifiers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RoutePath {
    len: u8,
    bytes: [u8; MAX_PATH_SIZE],
}

impl RoutePath {
    /// An empty path.
    pub fn new() -> Self {
        Self {
            len: 0,
            bytes: [0u8; MAX_PATH_SIZE],
        }
    }

    /// Build a path from a relay-id slice.
    pub fn from_slice(path: &[u8]) -> Result<Self, PacketError> {
        if path.len() > MAX_PATH_SIZE {
            return Err(PacketError::PathTooLong(path.len()));
        }
        let mut bytes = [0u8; MAX_PATH_SIZE];
        bytes[..path.len()].copy_from_slice(path);
        Ok(Self {
            len: path.len() as u8,
            bytes,
        })
    }

    /// The relay ids as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Number of relay ids.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the path is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a relay id, discarding the oldest hop when full.
    pub fn push(&mut self, relay_id: u8) {
        if (self.len as usize) == MAX_PATH_SIZE {
            self.bytes.copy_within(1.., 0);
            self.bytes[MAX_PATH_SIZE - 1] = relay_id;
        } else {
            self.bytes[self.len as usize] = relay_id;
            self.len += 1;
        }
    }

    /// Remove and return the first relay id.
    pub fn pop_front(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let head = self.bytes[0];
        self.bytes.copy_within(1..self.len as usize, 0);
        self.len -= 1;
        Some(head)
    }

    /// A copy of this path with hop order reversed.
    pub fn reversed(&self) -> Self {
        let mut out = Self::new();
        for &b in self.as_slice().iter().rev() {
            out.push(b);
        }
        out
    }
}

impl Default for RoutePath {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RoutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoutePath({})", hex::encode(self.as_slice()))
    }
}

// ============================================================================
// Packet
// ============================================================================

/// An in-memory packet record.
///
/// Owns the decoded header fields, the path, and a fixed payload buffer.
/// The buffer is over-allocated by one byte so text payloads can be
/// null-terminated in place by the session layer.
#[derive(Clone)]
pub struct Packet {
    route: RouteType,
    payload_type: PayloadType,
    has_return_path: bool,
    transport_code: u16,
    /// Hops taken (flood) or hops remaining (direct).
    pub path: RoutePath,
    payload: [u8; MAX_PACKET_PAYLOAD + 1],
    payload_len: u16,
    /// Suppresses the one scheduled retransmission of this packet.
    pub do_not_retransmit: bool,
}

impl Packet {
    /// Compose an outbound packet. Fails if the payload is over-long.
    pub fn new(
        route: RouteType,
        payload_type: PayloadType,
        payload: &[u8],
    ) -> Result<Self, PacketError> {
        if payload.len() > MAX_PACKET_PAYLOAD {
            return Err(PacketError::PayloadTooLong(payload.len()));
        }
        let mut buf = [0u8; MAX_PACKET_PAYLOAD + 1];
        buf[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            route,
            payload_type,
            has_return_path: payload_type == PayloadType::Path,
            transport_code: 0,
            path: RoutePath::new(),
            payload: buf,
            payload_len: payload.len() as u16,
            do_not_retransmit: false,
        })
    }

    /// Route discipline of this packet.
    pub fn route(&self) -> RouteType {
        self.route
    }

    /// Change the route discipline (used when sending along a known path).
    pub fn set_route(&mut self, route: RouteType) {
        self.route = route;
    }

    /// Payload kind.
    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    /// Whether this packet was flood-routed.
    pub fn is_route_flood(&self) -> bool {
        self.route.is_flood()
    }

    /// Whether this packet carries a return path.
    pub fn has_return_path(&self) -> bool {
        self.has_return_path
    }

    /// The payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }

    /// Mutable payload view including the spare terminator byte.
    ///
    /// The extra byte lets the session layer null-terminate text in place.
    pub fn payload_mut_with_spare(&mut self) -> &mut [u8] {
        let len = self.payload_len as usize;
        &mut self.payload[..len + 1]
    }

    /// Encoded length on the air.
    pub fn air_len(&self) -> usize {
        let code = if self.route.has_transport_code() { 2 } else { 0 };
        1 + code + 1 + self.path.len() + self.payload_len as usize
    }

    /// Deterministic hash over payload kind and payload bytes.
    ///
    /// The path is excluded so the hash is stable as the packet travels;
    /// relays and receivers use it for duplicate suppression and the
    /// engine for ACK matching.
    pub fn packet_hash(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update([self.payload_type.to_bits()]);
        hasher.update(self.payload());
        let digest = hasher.finalize();
        u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
    }

    /// Encode into `buf`, returning the encoded length.
    ///
    /// Infallible for a validated packet; `buf` must hold at least
    /// [`MAX_PACKET_SIZE`] bytes.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        let mut header = (self.route as u8) | (self.payload_type.to_bits() << 2);
        if self.has_return_path {
            header |= FLAG_HAS_RETURN_PATH;
        }
        buf[0] = header;
        let mut off = 1;
        if self.route.has_transport_code() {
            buf[off..off + 2].copy_from_slice(&self.transport_code.to_le_bytes());
            off += 2;
        }
        buf[off] = self.path.len() as u8;
        off += 1;
        buf[off..off + self.path.len()].copy_from_slice(self.path.as_slice());
        off += self.path.len();
        buf[off..off + self.payload_len as usize].copy_from_slice(self.payload());
        off + self.payload_len as usize
    }

    /// Decode a packet from raw frame bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < 2 {
            return Err(PacketError::Truncated(data.len()));
        }
        let header = data[0];
        if header & FLAG_RESERVED != 0 {
            return Err(PacketError::ReservedFlags(header));
        }
        let route = RouteType::from_bits(header);
        let payload_type = PayloadType::from_bits((header >> 2) & 0x0F)
            .ok_or(PacketError::UnknownPayloadType((header >> 2) & 0x0F))?;
        let has_return_path = header & FLAG_HAS_RETURN_PATH != 0;

        let mut off = 1;
        let mut transport_code = 0u16;
        if route.has_transport_code() {
            if data.len() < off + 2 {
                return Err(PacketError::Truncated(data.len()));
            }
            transport_code = u16::from_le_bytes([data[off], data[off + 1]]);
            off += 2;
        }

        if data.len() < off + 1 {
            return Err(PacketError::Truncated(data.len()));
        }
        let path_len = data[off] as usize;
        off += 1;
        if path_len > MAX_PATH_SIZE {
            return Err(PacketError::PathTooLong(path_len));
        }
        if data.len() < off + path_len {
            return Err(PacketError::Truncated(data.len()));
        }
        let path = RoutePath::from_slice(&data[off..off + path_len])?;
        off += path_len;

        let payload = &data[off..];
        if payload.len() > MAX_PACKET_PAYLOAD {
            return Err(PacketError::PayloadTooLong(payload.len()));
        }
        let mut buf = [0u8; MAX_PACKET_PAYLOAD + 1];
        buf[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            route,
            payload_type,
            has_return_path,
            transport_code,
            path,
            payload: buf,
            payload_len: payload.len() as u16,
            do_not_retransmit: false,
        })
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("route", &self.route)
            .field("payload_type", &self.payload_type)
            .field("path", &self.path)
            .field("payload_len", &self.payload_len)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
