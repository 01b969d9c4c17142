//! Advertisement payload codec.
//!
//! An advert binds a node's public key to a timestamp and application
//! metadata under a BIP340 Schnorr signature:
//!
//! ```text
//! [ pubkey(32) | timestamp(4 LE) | signature(64) | app_data(0..=32) ]
//! ```
//!
//! The signature covers `pubkey ‖ timestamp ‖ app_data`.
//!
//! ## app_data sub-codec
//!
//! | Offset | Field    | Size | Present when          |
//! |--------|----------|------|------------------------|
//! | 0      | meta     | 1    | always                 |
//! | 1      | lat, lon | 4+4  | meta bit 4             |
//! | ...    | feature1 | 2    | meta bit 5             |
//! | ...    | feature2 | 2    | meta bit 6             |
//! | ...    | name     | rest | meta bit 7 (≤31 bytes) |
//!
//! The meta low nibble is the node kind. Coordinates are fixed-point
//! microdegrees (i32 LE). The parser rejects truncated and over-long
//! records.

use crate::identity::{LocalIdentity, PeerIdentity, PUB_KEY_SIZE, SIGNATURE_SIZE};

use super::{PacketError, MAX_ADVERT_DATA_SIZE};

/// Fixed bytes before app_data in an advert payload.
pub const ADVERT_OVERHEAD: usize = PUB_KEY_SIZE + 4 + SIGNATURE_SIZE;

/// Longest advertised node name.
pub const MAX_ADVERT_NAME_LEN: usize = 31;

const META_LATLON: u8 = 0x10;
const META_FEATURE1: u8 = 0x20;
const META_FEATURE2: u8 = 0x40;
const META_NAME: u8 = 0x80;

/// Role a node advertises itself as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    /// Interactive chat user.
    Chat = 1,
    /// Store-and-forward repeater.
    Repeater = 2,
    /// Room server.
    Room = 3,
}

impl NodeKind {
    /// Try to convert from the meta low nibble.
    pub fn from_bits(b: u8) -> Option<Self> {
        match b & 0x0F {
            1 => Some(NodeKind::Chat),
            2 => Some(NodeKind::Repeater),
            3 => Some(NodeKind::Room),
            _ => None,
        }
    }
}

/// Decoded advert application metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct AdvertData {
    /// Advertised role.
    pub kind: NodeKind,
    /// Fixed-point microdegree coordinates.
    pub latlon: Option<(i32, i32)>,
    /// Application-defined feature words.
    pub feature1: Option<u16>,
    pub feature2: Option<u16>,
    /// Friendly display name.
    pub name: Option<String>,
}

impl AdvertData {
    /// Metadata with just a kind and name.
    pub fn new(kind: NodeKind, name: &str) -> Self {
        Self {
            kind,
            latlon: None,
            feature1: None,
            feature2: None,
            name: Some(name.to_string()),
        }
    }

    /// Attach coordinates given in degrees.
    pub fn with_position(mut self, lat: f64, lon: f64) -> Self {
        self.latlon = Some(((lat * 1e6) as i32, (lon * 1e6) as i32));
        self
    }

    /// Encode into `buf`, returning the encoded length.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, PacketError> {
        let mut meta = self.kind as u8;
        if self.latlon.is_some() {
            meta |= META_LATLON;
        }
        if self.feature1.is_some() {
            meta |= META_FEATURE1;
        }
        if self.feature2.is_some() {
            meta |= META_FEATURE2;
        }
        let name = self.name.as_deref().unwrap_or("");
        if self.name.is_some() {
            meta |= META_NAME;
        }
        if name.len() > MAX_ADVERT_NAME_LEN {
            return Err(PacketError::MalformedAppData);
        }
        let needed = 1
            + if self.latlon.is_some() { 8 } else { 0 }
            + if self.feature1.is_some() { 2 } else { 0 }
            + if self.feature2.is_some() { 2 } else { 0 }
            + name.len();
        if needed > MAX_ADVERT_DATA_SIZE || needed > buf.len() {
            return Err(PacketError::MalformedAppData);
        }

        let mut off = 0;
        buf[off] = meta;
        off += 1;
        if let Some((lat, lon)) = self.latlon {
            buf[off..off + 4].copy_from_slice(&lat.to_le_bytes());
            buf[off + 4..off + 8].copy_from_slice(&lon.to_le_bytes());
            off += 8;
        }
        if let Some(f1) = self.feature1 {
            buf[off..off + 2].copy_from_slice(&f1.to_le_bytes());
            off += 2;
        }
        if let Some(f2) = self.feature2 {
            buf[off..off + 2].copy_from_slice(&f2.to_le_bytes());
            off += 2;
        }
        if self.name.is_some() {
            buf[off..off + name.len()].copy_from_slice(name.as_bytes());
            off += name.len();
        }
        debug_assert_eq!(off, needed);
        Ok(off)
    }

    /// Decode advert metadata, rejecting truncated or over-long records.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.is_empty() || data.len() > MAX_ADVERT_DATA_SIZE {
            return Err(PacketError::MalformedAppData);
        }
        let meta = data[0];
        let kind = NodeKind::from_bits(meta).ok_or(PacketError::MalformedAppData)?;
        let mut off = 1;

        let latlon = if meta & META_LATLON != 0 {
            if data.len() < off + 8 {
                return Err(PacketError::MalformedAppData);
            }
            let lat = i32::from_le_bytes(data[off..off + 4].try_into().expect("length checked"));
            let lon =
                i32::from_le_bytes(data[off + 4..off + 8].try_into().expect("length checked"));
            off += 8;
            Some((lat, lon))
        } else {
            None
        };

        let mut feature = |present: bool| -> Result<Option<u16>, PacketError> {
            if !present {
                return Ok(None);
            }
            if data.len() < off + 2 {
                return Err(PacketError::MalformedAppData);
            }
            let v = u16::from_le_bytes(data[off..off + 2].try_into().expect("length checked"));
            off += 2;
            Ok(Some(v))
        };
        let feature1 = feature(meta & META_FEATURE1 != 0)?;
        let feature2 = feature(meta & META_FEATURE2 != 0)?;

        let name = if meta & META_NAME != 0 {
            let raw = &data[off..];
            if raw.len() > MAX_ADVERT_NAME_LEN {
                return Err(PacketError::MalformedAppData);
            }
            // names are null-padded on the wire
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            let s = std::str::from_utf8(&raw[..end])
                .map_err(|_| PacketError::MalformedAppData)?;
            Some(s.to_string())
        } else {
            if off != data.len() {
                return Err(PacketError::MalformedAppData);
            }
            None
        };

        Ok(Self {
            kind,
            latlon,
            feature1,
            feature2,
            name,
        })
    }
}

/// Build a signed advert payload.
pub fn build_advert(
    id: &LocalIdentity,
    timestamp: u32,
    app_data: &[u8],
) -> Result<Vec<u8>, PacketError> {
    if app_data.len() > MAX_ADVERT_DATA_SIZE {
        return Err(PacketError::MalformedAppData);
    }
    let mut signed = Vec::with_capacity(PUB_KEY_SIZE + 4 + app_data.len());
    signed.extend_from_slice(id.pub_key());
    signed.extend_from_slice(&timestamp.to_le_bytes());
    signed.extend_from_slice(app_data);
    let signature = id.sign(&signed);

    let mut payload = Vec::with_capacity(ADVERT_OVERHEAD + app_data.len());
    payload.extend_from_slice(id.pub_key());
    payload.extend_from_slice(&timestamp.to_le_bytes());
    payload.extend_from_slice(&signature);
    payload.extend_from_slice(app_data);
    Ok(payload)
}

/// Parse and verify an advert payload.
///
/// Returns the advertiser identity, timestamp, and app_data slice.
/// Signature failure is [`PacketError::BadSignature`], distinct from the
/// malformed family so the engine can count it separately.
pub fn parse_advert(payload: &[u8]) -> Result<(PeerIdentity, u32, &[u8]), PacketError> {
    if payload.len() < ADVERT_OVERHEAD {
        return Err(PacketError::MalformedAdvert);
    }
    if payload.len() > ADVERT_OVERHEAD + MAX_ADVERT_DATA_SIZE {
        return Err(PacketError::MalformedAdvert);
    }
    let id = PeerIdentity::from_slice(&payload[..PUB_KEY_SIZE])
        .map_err(|_| PacketError::MalformedAdvert)?;
    let timestamp = u32::from_le_bytes(
        payload[PUB_KEY_SIZE..PUB_KEY_SIZE + 4]
            .try_into()
            .expect("length checked"),
    );
    let signature: [u8; SIGNATURE_SIZE] = payload[PUB_KEY_SIZE + 4..ADVERT_OVERHEAD]
        .try_into()
        .expect("length checked");
    let app_data = &payload[ADVERT_OVERHEAD..];

    let mut signed = Vec::with_capacity(PUB_KEY_SIZE + 4 + app_data.len());
    signed.extend_from_slice(&payload[..PUB_KEY_SIZE + 4]);
    signed.extend_from_slice(app_data);
    if !id.verify(&signed, &signature) {
        return Err(PacketError::BadSignature);
    }
    Ok((id, timestamp, app_data))
}
