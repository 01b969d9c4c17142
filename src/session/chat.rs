//! Contact-oriented chat session on top of the forwarding engine.

use tracing::debug;

use crate::crypto;
use crate::identity::PeerIdentity;
use crate::mesh::{Mesh, MeshApp, MeshError, PeerSlot};
use crate::packet::{AdvertData, NodeKind, Packet, PayloadType, RoutePath, RouteType};

use super::channel::ChannelTable;
use super::contact::{Contact, ContactTable};
use super::{GroupChannel, SendStatus, SessionError, MAX_TEXT_LEN};

/// UI collaborator notified of session events.
///
/// All methods default to no-ops so a headless node can pass a unit
/// implementation.
pub trait ChatEvents {
    /// A contact was created or refreshed from a verified advert.
    fn on_discovered_contact(&mut self, _contact: &Contact, _is_new: bool) {}

    /// A contact's out-path was learned or replaced.
    fn on_contact_path_updated(&mut self, _contact: &Contact) {}

    /// A text message arrived from a contact.
    fn on_message_recv(
        &mut self,
        _contact: &Contact,
        _is_flood: bool,
        _timestamp: u32,
        _text: &str,
    ) {
    }

    /// A group-channel message arrived. `hops` is the flood path length,
    /// or `None` for a direct frame.
    fn on_channel_message_recv(
        &mut self,
        _channel: &GroupChannel,
        _hops: Option<u8>,
        _timestamp: u32,
        _text: &str,
    ) {
    }

    /// The ACK for the outstanding message arrived.
    fn on_ack_confirmed(&mut self, _ack: u32) {}

    /// The outstanding message timed out without an ACK. The caller
    /// decides whether to retry with a bumped attempt number.
    fn on_send_timeout(&mut self) {}
}

/// Session state dispatched into by the engine.
pub(crate) struct ChatState {
    contacts: ContactTable,
    channels: ChannelTable,
    events: Box<dyn ChatEvents>,
    /// Deadline for the outstanding text message's ACK.
    txt_send_timeout: Option<u64>,
    /// ACK hash the outstanding message expects.
    expected_ack: Option<u32>,
    n_replays: u32,
    n_dropped_full: u32,
}

impl ChatState {
    fn process_ack(&mut self, ack: u32) {
        if self.expected_ack == Some(ack) {
            self.expected_ack = None;
            self.txt_send_timeout = None;
            self.events.on_ack_confirmed(ack);
        }
    }
}

impl MeshApp for ChatState {
    fn on_advert_recv(
        &mut self,
        mesh: &mut Mesh,
        _packet: &Packet,
        id: PeerIdentity,
        timestamp: u32,
        app_data: &[u8],
    ) {
        let data = match AdvertData::decode(app_data) {
            Ok(data) => data,
            Err(e) => {
                debug!(error = %e, "Advert app_data rejected");
                return;
            }
        };
        let Some(name) = data.name.as_deref() else {
            debug!("Advert without a name ignored");
            return;
        };

        match self.contacts.find_by_id(&id) {
            Some(idx) => {
                let contact = self.contacts.get_mut(idx).expect("index from find");
                if timestamp <= contact.last_advert_timestamp {
                    self.n_replays += 1;
                    debug!(name = %contact.name, "Advert replay dropped");
                    return;
                }
                contact.name = name.to_string();
                contact.kind = data.kind;
                contact.last_advert_timestamp = timestamp;

                let contact = self.contacts.get(idx).expect("index from find");
                self.events.on_discovered_contact(contact, false);
            }
            None => {
                let Some(idx) = self.contacts.insert(mesh.self_id(), id, name, data.kind)
                else {
                    self.n_dropped_full += 1;
                    return;
                };
                self.contacts
                    .get_mut(idx)
                    .expect("just inserted")
                    .last_advert_timestamp = timestamp;

                let contact = self.contacts.get(idx).expect("just inserted");
                self.events.on_discovered_contact(contact, true);
            }
        }
    }

    fn collect_peers_by_hash(&self, hash: u8) -> Vec<PeerSlot> {
        self.contacts.collect_by_hash(hash)
    }

    fn peer_secret(&self, slot: PeerSlot) -> Option<crate::identity::SharedSecret> {
        self.contacts.get(slot.0).map(|c| *c.secret())
    }

    fn on_peer_data_recv(
        &mut self,
        mesh: &mut Mesh,
        packet: &Packet,
        payload_type: PayloadType,
        slot: PeerSlot,
        plaintext: &[u8],
    ) {
        if payload_type != PayloadType::TxtMsg || plaintext.len() <= 5 {
            debug!(payload_type = ?payload_type, "Unsupported peer datagram ignored");
            return;
        }
        let timestamp =
            u32::from_le_bytes(plaintext[..4].try_into().expect("length checked"));
        let flags = plaintext[4];
        if flags >> 2 != 0 {
            debug!(flags, "Unsupported text message variant");
            return;
        }

        let Some(contact) = self.contacts.get_mut(slot.0) else {
            return;
        };
        if timestamp <= contact.last_timestamp {
            self.n_replays += 1;
            debug!(name = %contact.name, "Text replay dropped");
            return;
        }
        contact.last_timestamp = timestamp;

        // text runs to the first padding null, if any
        let text_end = 5 + plaintext[5..]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(plaintext.len() - 5);
        let Ok(text) = std::str::from_utf8(&plaintext[5..text_end]) else {
            debug!("Text message with invalid UTF-8 dropped");
            return;
        };

        let contact = self.contacts.get(slot.0).expect("checked above");
        self.events
            .on_message_recv(contact, packet.is_route_flood(), timestamp, text);

        // prove receipt: hash the authenticated fields under the sender's key
        let ack = crypto::ack_hash(&plaintext[..text_end], contact.id.as_bytes());

        if packet.is_route_flood() {
            // teach the sender the path here and carry the ACK in one frame
            match mesh.create_path_return(
                contact.id.hash_prefix(),
                contact.secret(),
                &packet.path,
                Some((PayloadType::Ack, &ack.to_le_bytes())),
            ) {
                Ok(reply) => {
                    if let Err(e) = mesh.send_flood(reply, 0) {
                        debug!(error = %e, "Path-return send failed");
                    }
                }
                Err(e) => debug!(error = %e, "Path-return compose failed"),
            }
        } else {
            match mesh.create_ack(ack) {
                Ok(reply) => {
                    let result = match contact.out_path {
                        Some(path) => mesh.send_direct(reply, path.as_slice(), 0),
                        None => mesh.send_flood(reply, 0),
                    };
                    if let Err(e) = result {
                        debug!(error = %e, "ACK send failed");
                    }
                }
                Err(e) => debug!(error = %e, "ACK compose failed"),
            }
        }
    }

    fn on_peer_path_recv(
        &mut self,
        _mesh: &mut Mesh,
        _packet: &Packet,
        slot: PeerSlot,
        path: &[u8],
        extra: Option<(u8, &[u8])>,
    ) -> bool {
        let Some(contact) = self.contacts.get_mut(slot.0) else {
            return false;
        };
        // single-best policy: the newest path return wins unconditionally
        match RoutePath::from_slice(path) {
            Ok(p) => contact.out_path = Some(p),
            Err(e) => {
                debug!(error = %e, "Path return with oversized path dropped");
                return false;
            }
        }
        debug!(name = %contact.name, hops = path.len(), "Out path updated");

        let contact = self.contacts.get(slot.0).expect("checked above");
        self.events.on_contact_path_updated(contact);

        if let Some((extra_type, extra_data)) = extra {
            if extra_type == PayloadType::Ack.to_bits() && extra_data.len() >= 4 {
                let ack =
                    u32::from_le_bytes(extra_data[..4].try_into().expect("length checked"));
                self.process_ack(ack);
            }
        }
        true
    }

    fn on_ack_recv(&mut self, _mesh: &mut Mesh, _packet: &mut Packet, ack: u32) {
        self.process_ack(ack);
    }

    fn collect_channels_by_hash(&self, hash: u8) -> Vec<usize> {
        self.channels.collect_by_hash(hash)
    }

    fn channel_key(&self, idx: usize) -> Option<[u8; 32]> {
        self.channels.get(idx).map(|c| c.key())
    }

    fn on_group_data_recv(
        &mut self,
        _mesh: &mut Mesh,
        packet: &Packet,
        payload_type: PayloadType,
        channel_idx: usize,
        plaintext: &[u8],
    ) {
        if payload_type != PayloadType::GrpTxt || plaintext.len() <= 5 {
            return;
        }
        let flags = plaintext[4];
        if flags >> 2 != 0 {
            debug!(flags, "Unsupported group message variant");
            return;
        }
        let timestamp =
            u32::from_le_bytes(plaintext[..4].try_into().expect("length checked"));
        let text_end = 5 + plaintext[5..]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(plaintext.len() - 5);
        let Ok(text) = std::str::from_utf8(&plaintext[5..text_end]) else {
            return;
        };
        let hops = if packet.is_route_flood() {
            Some(packet.path.len() as u8)
        } else {
            None
        };
        let Some(channel) = self.channels.get(channel_idx) else {
            return;
        };
        self.events
            .on_channel_message_recv(channel, hops, timestamp, text);
    }
}

/// A chat node: forwarding engine plus contact session state.
pub struct ChatMesh {
    mesh: Mesh,
    state: ChatState,
}

impl ChatMesh {
    /// Create a chat session around an engine.
    pub fn new(mesh: Mesh, events: Box<dyn ChatEvents>) -> Self {
        Self {
            mesh,
            state: ChatState {
                contacts: ContactTable::new(),
                channels: ChannelTable::new(),
                events,
                txt_send_timeout: None,
                expected_ack: None,
                n_replays: 0,
                n_dropped_full: 0,
            },
        }
    }

    /// Run one tick; returns the next wakeup deadline.
    pub fn poll(&mut self) -> Option<u64> {
        let mesh_deadline = self.mesh.poll(&mut self.state);
        let now = self.mesh.millis();
        if let Some(deadline) = self.state.txt_send_timeout {
            if now >= deadline {
                self.state.txt_send_timeout = None;
                self.state.expected_ack = None;
                self.state.events.on_send_timeout();
            }
        }
        match (mesh_deadline, self.state.txt_send_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The underlying engine.
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Mutable access to the underlying engine.
    pub fn mesh_mut(&mut self) -> &mut Mesh {
        &mut self.mesh
    }

    // === Contacts ===

    pub fn contact(&self, idx: usize) -> Option<&Contact> {
        self.state.contacts.get(idx)
    }

    pub fn contact_count(&self) -> usize {
        self.state.contacts.len()
    }

    pub fn find_contact(&self, id: &PeerIdentity) -> Option<usize> {
        self.state.contacts.find_by_id(id)
    }

    /// First contact whose name starts with `prefix`.
    pub fn search_contacts_by_prefix(&self, prefix: &str) -> Option<&Contact> {
        self.state.contacts.search_by_prefix(prefix)
    }

    /// Visit the `last_n` most recently advertised contacts, newest first
    /// (all of them when `last_n` is 0).
    pub fn scan_recent_contacts(&self, last_n: usize, mut visit: impl FnMut(&Contact)) {
        for idx in self.state.contacts.recent_indexes(last_n) {
            visit(self.state.contacts.get(idx).expect("index from table"));
        }
    }

    /// Manually add a contact (e.g. imported out of band).
    pub fn add_contact(
        &mut self,
        id: PeerIdentity,
        name: &str,
        kind: NodeKind,
    ) -> Result<usize, SessionError> {
        self.state
            .contacts
            .insert(self.mesh.self_id(), id, name, kind)
            .ok_or(SessionError::TableFull)
    }

    /// Forget a contact's learned route, forcing the next send to flood.
    pub fn reset_path_to(&mut self, idx: usize) -> Result<(), SessionError> {
        let contact = self
            .state
            .contacts
            .get_mut(idx)
            .ok_or(SessionError::NoContact)?;
        contact.out_path = None;
        Ok(())
    }

    // === Channels ===

    pub fn add_channel(&mut self, name: &str, psk_base64: &str) -> Result<usize, SessionError> {
        self.state.channels.add(name, psk_base64)
    }

    pub fn channel(&self, idx: usize) -> Option<&GroupChannel> {
        self.state.channels.get(idx)
    }

    // === Sending ===

    /// Flood a signed self-advertisement.
    pub fn send_self_advert(
        &mut self,
        data: &AdvertData,
        delay_ms: u64,
    ) -> Result<(), SessionError> {
        let mut buf = [0u8; crate::packet::MAX_ADVERT_DATA_SIZE];
        let len = data.encode_into(&mut buf).map_err(MeshError::Packet)?;
        let timestamp = self.mesh.rtc().get();
        let pkt = self.mesh.create_advert(timestamp, &buf[..len])?;
        self.mesh.send_flood(pkt, delay_ms)?;
        Ok(())
    }

    /// Send a text message to a contact.
    ///
    /// Returns how it was routed and the ACK hash to expect. The attempt
    /// number is folded into the payload, so a retry changes the packet
    /// hash and is not flood-suppressed as a duplicate.
    pub fn send_message(
        &mut self,
        contact_idx: usize,
        attempt: u8,
        text: &str,
    ) -> Result<(SendStatus, u32), SessionError> {
        if text.len() > MAX_TEXT_LEN {
            return Err(SessionError::TextTooLong(text.len()));
        }
        let contact = self
            .state
            .contacts
            .get(contact_idx)
            .ok_or(SessionError::NoContact)?;
        let (id, secret, out_path) = (contact.id, *contact.secret(), contact.out_path);

        let timestamp = self.mesh.rtc().get();
        let mut plaintext = Vec::with_capacity(5 + text.len());
        plaintext.extend_from_slice(&timestamp.to_le_bytes());
        plaintext.push(attempt & 3);
        plaintext.extend_from_slice(text.as_bytes());

        // the ACK we expect back is hashed under our own key
        let expected_ack = crypto::ack_hash(&plaintext, self.mesh.self_id().pub_key());

        let pkt = self
            .mesh
            .create_datagram(PayloadType::TxtMsg, &id, &secret, &plaintext)?;
        let air = self.mesh.est_airtime_for(&pkt);
        let now = self.mesh.millis();

        let (slot, status, deadline) = match out_path {
            Some(path) => {
                let slot = self.mesh.send_direct(pkt, path.as_slice(), 0)?;
                let deadline = now + Mesh::direct_timeout_millis(air, path.len());
                (slot, SendStatus::SentDirect, deadline)
            }
            None => {
                let slot = self.mesh.send_flood(pkt, 0)?;
                let deadline = now + Mesh::flood_timeout_millis(air);
                (slot, SendStatus::SentFlood, deadline)
            }
        };
        self.mesh.register_expected_ack(expected_ack, slot);
        self.state.expected_ack = Some(expected_ack);
        self.state.txt_send_timeout = Some(deadline);
        Ok((status, expected_ack))
    }

    /// Cancel the outstanding message: no timeout will fire and its
    /// scheduled retransmission is suppressed.
    pub fn cancel_pending_message(&mut self) {
        self.state.txt_send_timeout = None;
        self.state.expected_ack = None;
    }

    /// Broadcast a text on a group channel. Group frames carry no ACK.
    pub fn send_group_message(
        &mut self,
        channel_idx: usize,
        text: &str,
    ) -> Result<(), SessionError> {
        if text.len() > MAX_TEXT_LEN {
            return Err(SessionError::TextTooLong(text.len()));
        }
        let channel = self
            .state
            .channels
            .get(channel_idx)
            .ok_or(SessionError::NoChannel)?;

        let timestamp = self.mesh.rtc().get();
        let mut plaintext = Vec::with_capacity(5 + text.len());
        plaintext.extend_from_slice(&timestamp.to_le_bytes());
        plaintext.push(0);
        plaintext.extend_from_slice(text.as_bytes());

        let sealed = crypto::seal(&channel.key(), &plaintext).map_err(MeshError::Crypto)?;
        let mut payload = Vec::with_capacity(1 + sealed.len());
        payload.push(channel.hash_prefix());
        payload.extend_from_slice(&sealed);
        let pkt = Packet::new(RouteType::Flood, PayloadType::GrpTxt, &payload)
            .map_err(MeshError::Packet)?;
        self.mesh.send_flood(pkt, 0)?;
        Ok(())
    }

    /// Send an anonymous password login to a repeater contact.
    pub fn send_login(
        &mut self,
        contact_idx: usize,
        password: &str,
    ) -> Result<SendStatus, SessionError> {
        let contact = self
            .state
            .contacts
            .get(contact_idx)
            .ok_or(SessionError::NoContact)?;
        let (id, secret, out_path) = (contact.id, *contact.secret(), contact.out_path);

        let timestamp = self.mesh.rtc().get();
        let mut plaintext = Vec::with_capacity(4 + password.len());
        plaintext.extend_from_slice(&timestamp.to_le_bytes());
        plaintext.extend_from_slice(password.as_bytes());

        let pkt = self.mesh.create_anon_req(&id, &secret, &plaintext)?;
        match out_path {
            Some(path) => {
                self.mesh.send_direct(pkt, path.as_slice(), 0)?;
                Ok(SendStatus::SentDirect)
            }
            None => {
                self.mesh.send_flood(pkt, 0)?;
                Ok(SendStatus::SentFlood)
            }
        }
    }

    // === Counters ===

    /// Replayed adverts and texts dropped.
    pub fn n_replays(&self) -> u32 {
        self.state.n_replays
    }

    /// Adverts dropped because the contact table was full.
    pub fn n_dropped_full(&self) -> u32 {
        self.state.n_dropped_full
    }
}
