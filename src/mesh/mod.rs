//! Mesh Forwarding Engine
//!
//! Owns the radio, the packet pool, and the forwarding state tables, and
//! drives the store-and-forward cycle: receive → duplicate suppression →
//! relay decision → local dispatch → timed transmission. Application
//! behavior is supplied through the [`MeshApp`] capability trait; the
//! engine calls back into it for advert handling, peer lookup by hash
//! prefix, decrypted payload delivery, and forwarding policy.
//!
//! ## Scheduling model
//!
//! Single-threaded cooperative. [`Mesh::poll`] performs one tick (radio
//! poll, decode, forward/dispatch, due-send pop, retransmit checks) and
//! returns the next deadline so the host can idle. Nothing blocks; all
//! timers are millisecond deadlines checked each tick.
//!
//! ## Airtime budget
//!
//! Cumulative transmit time is capped at `airtime_factor × uptime`. Over
//! budget, originated packets are delayed (never dropped) and forwarded
//! packets are dropped first.

mod tables;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub use tables::MeshTables;

use crate::config::Config;
use crate::crypto::{self, CryptoError, SEAL_OVERHEAD};
use crate::identity::{LocalIdentity, PeerIdentity, SharedSecret, PUB_KEY_SIZE};
use crate::packet::{
    build_advert, parse_advert, Packet, PacketError, PacketPool, PayloadType, RoutePath,
    RouteType, SlotId, ACK_PAYLOAD_SIZE, MAX_PACKET_SIZE,
};
use crate::radio::{MillisecondClock, Radio, RtcClock};

// ============================================================================
// Constants
// ============================================================================

/// Base delay before relaying a flood packet.
pub const FLOOD_RELAY_BASE_MILLIS: u64 = 160;

/// Per-observed-hop jitter window for flood relays. Relays deeper in the
/// flood draw from a wider window, spreading equally-placed relays apart.
pub const FLOOD_JITTER_SLOT_MILLIS: u64 = 120;

/// Jitter window before relaying a direct packet.
pub const DIRECT_RELAY_JITTER_MILLIS: u64 = 32;

/// Multiplier over estimated airtime for flood retransmit/ACK timeouts.
pub const FLOOD_TIMEOUT_FACTOR: u64 = 16;

/// Fixed slack added to flood timeouts.
pub const FLOOD_TIMEOUT_BASE_MILLIS: u64 = 4000;

/// Per-hop multiplier over estimated airtime for direct timeouts.
pub const DIRECT_TIMEOUT_FACTOR: u64 = 4;

/// Fixed per-hop slack added to direct timeouts.
pub const DIRECT_TIMEOUT_HOP_MILLIS: u64 = 1000;

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced to session-layer composers.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("packet pool full")]
    PoolFull,

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

// ============================================================================
// Capability trait
// ============================================================================

/// Index of an application-side peer record (contact or client slot).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerSlot(pub usize);

/// Application callbacks the engine dispatches into.
///
/// Implemented by the session layers (chat, repeater). Callbacks receive
/// `&mut Mesh` so they can compose and send replies synchronously; all
/// mesh state mutation stays on the single mesh thread.
pub trait MeshApp {
    /// Forwarding policy: may this packet be relayed for others?
    fn allow_packet_forward(&self, _packet: &Packet) -> bool {
        true
    }

    /// A verified advertisement arrived.
    fn on_advert_recv(
        &mut self,
        _mesh: &mut Mesh,
        _packet: &Packet,
        _id: PeerIdentity,
        _timestamp: u32,
        _app_data: &[u8],
    ) {
    }

    /// Collect peer slots whose identity hash prefix matches.
    fn collect_peers_by_hash(&self, _hash: u8) -> Vec<PeerSlot> {
        Vec::new()
    }

    /// Cached pairwise secret for a peer slot.
    fn peer_secret(&self, _slot: PeerSlot) -> Option<SharedSecret> {
        None
    }

    /// A sealed datagram from a known peer decrypted successfully.
    fn on_peer_data_recv(
        &mut self,
        _mesh: &mut Mesh,
        _packet: &Packet,
        _payload_type: PayloadType,
        _slot: PeerSlot,
        _plaintext: &[u8],
    ) {
    }

    /// A path return from a known peer arrived. Return `true` to have the
    /// engine send a reciprocal path back along the learned route.
    fn on_peer_path_recv(
        &mut self,
        _mesh: &mut Mesh,
        _packet: &Packet,
        _slot: PeerSlot,
        _path: &[u8],
        _extra: Option<(u8, &[u8])>,
    ) -> bool {
        false
    }

    /// A sealed datagram from an unknown sender (carrying its public key)
    /// decrypted successfully.
    fn on_anon_data_recv(
        &mut self,
        _mesh: &mut Mesh,
        _packet: &Packet,
        _payload_type: PayloadType,
        _sender: &PeerIdentity,
        _plaintext: &[u8],
    ) {
    }

    /// An acknowledgement arrived (engine bookkeeping already ran).
    fn on_ack_recv(&mut self, _mesh: &mut Mesh, _packet: &mut Packet, _ack: u32) {}

    /// Collect group-channel indexes whose hash prefix matches.
    fn collect_channels_by_hash(&self, _hash: u8) -> Vec<usize> {
        Vec::new()
    }

    /// AEAD key for a channel index.
    fn channel_key(&self, _idx: usize) -> Option<[u8; 32]> {
        None
    }

    /// A group-channel frame decrypted successfully.
    fn on_group_data_recv(
        &mut self,
        _mesh: &mut Mesh,
        _packet: &Packet,
        _payload_type: PayloadType,
        _channel_idx: usize,
        _plaintext: &[u8],
    ) {
    }
}

// ============================================================================
// Counters
// ============================================================================

/// Engine counters exposed for telemetry.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeshStats {
    pub n_sent_flood: u32,
    pub n_sent_direct: u32,
    pub n_recv_flood: u32,
    pub n_recv_direct: u32,
    pub n_full_events: u32,
    pub n_dup_dropped: u32,
    pub n_malformed: u32,
    pub n_auth_fail: u32,
    pub n_forward_dropped: u32,
}

// ============================================================================
// Engine
// ============================================================================

/// The store-and-forward engine for one node.
pub struct Mesh {
    self_id: LocalIdentity,
    radio: Box<dyn Radio>,
    clock: Box<dyn MillisecondClock>,
    rtc: Box<dyn RtcClock>,
    rng: StdRng,
    pool: PacketPool,
    tables: MeshTables,
    airtime_factor: f32,
    total_air_ms: u64,
    stats: MeshStats,
}

impl Mesh {
    /// Create an engine around a radio and clocks.
    pub fn new(
        self_id: LocalIdentity,
        radio: Box<dyn Radio>,
        clock: Box<dyn MillisecondClock>,
        rtc: Box<dyn RtcClock>,
        config: &Config,
    ) -> Self {
        Self {
            self_id,
            radio,
            clock,
            rtc,
            rng: StdRng::from_os_rng(),
            pool: PacketPool::new(config.limits.pool_capacity),
            tables: MeshTables::new(config.limits.seen_capacity, config.limits.ack_capacity),
            airtime_factor: config.node.airtime_factor,
            total_air_ms: 0,
            stats: MeshStats::default(),
        }
    }

    /// Replace the jitter RNG with a seeded one (deterministic tests).
    pub fn with_seeded_rng(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    // === Accessors ===

    /// This node's identity.
    pub fn self_id(&self) -> &LocalIdentity {
        &self.self_id
    }

    /// The one-byte relay id this node appends to flood paths.
    pub fn relay_id(&self) -> u8 {
        self.self_id.hash_prefix()
    }

    /// Current monotonic time in milliseconds.
    pub fn millis(&self) -> u64 {
        self.clock.millis()
    }

    /// The wall clock collaborator.
    pub fn rtc(&self) -> &dyn RtcClock {
        self.rtc.as_ref()
    }

    /// Mutable wall clock (for `clock sync`).
    pub fn rtc_mut(&mut self) -> &mut dyn RtcClock {
        self.rtc.as_mut()
    }

    /// Engine counters.
    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    /// Cumulative transmit airtime in milliseconds.
    pub fn total_air_time_ms(&self) -> u64 {
        self.total_air_ms
    }

    /// Current transmit duty-cycle cap.
    pub fn airtime_factor(&self) -> f32 {
        self.airtime_factor
    }

    /// Update the transmit duty-cycle cap.
    pub fn set_airtime_factor(&mut self, factor: f32) {
        self.airtime_factor = factor.max(0.0);
    }

    /// Free pool slots (telemetry).
    pub fn free_queue_len(&self) -> usize {
        self.pool.free_count()
    }

    /// Queued-for-transmit pool slots (telemetry).
    pub fn tx_queue_len(&self) -> usize {
        self.pool.outbound_count()
    }

    /// RSSI of the last received frame.
    pub fn last_rssi(&self) -> i16 {
        self.radio.last_rssi()
    }

    /// Radio frame counters.
    pub fn radio_packets_recv(&self) -> u32 {
        self.radio.packets_recv()
    }

    pub fn radio_packets_sent(&self) -> u32 {
        self.radio.packets_sent()
    }

    /// Estimated airtime for a packet as currently composed.
    pub fn est_airtime_for(&self, pkt: &Packet) -> u32 {
        self.radio.est_airtime_for(pkt.air_len())
    }

    // === Timeouts ===

    /// Retransmit/ACK timeout for a flood send with estimated airtime `air`.
    pub fn flood_timeout_millis(air: u32) -> u64 {
        air as u64 * FLOOD_TIMEOUT_FACTOR + FLOOD_TIMEOUT_BASE_MILLIS
    }

    /// Retransmit/ACK timeout for a direct send along `path_len` hops.
    pub fn direct_timeout_millis(air: u32, path_len: usize) -> u64 {
        let hops = path_len as u64 + 1;
        air as u64 * DIRECT_TIMEOUT_FACTOR * hops + DIRECT_TIMEOUT_HOP_MILLIS * hops
    }

    // === Composition ===

    /// Compose a signed self-advertisement flood.
    pub fn create_advert(&self, timestamp: u32, app_data: &[u8]) -> Result<Packet, MeshError> {
        let payload = build_advert(&self.self_id, timestamp, app_data)?;
        Ok(Packet::new(RouteType::Flood, PayloadType::Advert, &payload)?)
    }

    /// Compose a sealed datagram to a known peer.
    pub fn create_datagram(
        &self,
        payload_type: PayloadType,
        dest: &PeerIdentity,
        secret: &SharedSecret,
        plaintext: &[u8],
    ) -> Result<Packet, MeshError> {
        let sealed = crypto::seal(secret, plaintext)?;
        let mut payload = Vec::with_capacity(2 + sealed.len());
        payload.push(dest.hash_prefix());
        payload.push(self.self_id.hash_prefix());
        payload.extend_from_slice(&sealed);
        Ok(Packet::new(RouteType::Flood, payload_type, &payload)?)
    }

    /// Compose a sealed anonymous request carrying our public key.
    pub fn create_anon_req(
        &self,
        dest: &PeerIdentity,
        secret: &SharedSecret,
        plaintext: &[u8],
    ) -> Result<Packet, MeshError> {
        let sealed = crypto::seal(secret, plaintext)?;
        let mut payload = Vec::with_capacity(1 + PUB_KEY_SIZE + sealed.len());
        payload.push(dest.hash_prefix());
        payload.extend_from_slice(self.self_id.pub_key());
        payload.extend_from_slice(&sealed);
        Ok(Packet::new(RouteType::Flood, PayloadType::AnonReq, &payload)?)
    }

    /// Compose a bare acknowledgement.
    pub fn create_ack(&self, ack: u32) -> Result<Packet, MeshError> {
        Ok(Packet::new(
            RouteType::Flood,
            PayloadType::Ack,
            &ack.to_le_bytes(),
        )?)
    }

    /// Compose a path return: the reverse of `traversed`, sealed to the
    /// peer, optionally piggybacking another payload (usually an ACK).
    pub fn create_path_return(
        &self,
        dest_prefix: u8,
        secret: &SharedSecret,
        traversed: &RoutePath,
        extra: Option<(PayloadType, &[u8])>,
    ) -> Result<Packet, MeshError> {
        let reversed = traversed.reversed();
        let mut plaintext = Vec::with_capacity(2 + reversed.len() + 16);
        plaintext.push(reversed.len() as u8);
        plaintext.extend_from_slice(reversed.as_slice());
        if let Some((extra_type, extra_data)) = extra {
            plaintext.push(extra_type.to_bits());
            plaintext.extend_from_slice(extra_data);
        }
        let sealed = crypto::seal(secret, &plaintext)?;
        let mut payload = Vec::with_capacity(2 + sealed.len());
        payload.push(dest_prefix);
        payload.push(self.self_id.hash_prefix());
        payload.extend_from_slice(&sealed);
        Ok(Packet::new(RouteType::Flood, PayloadType::Path, &payload)?)
    }

    // === Sending ===

    /// Queue a packet as an opportunistic flood.
    pub fn send_flood(&mut self, mut pkt: Packet, delay_ms: u64) -> Result<SlotId, MeshError> {
        pkt.set_route(RouteType::Flood);
        pkt.path = RoutePath::new();
        self.enqueue_originated(pkt, delay_ms)
    }

    /// Queue a packet along a known source route.
    pub fn send_direct(
        &mut self,
        mut pkt: Packet,
        path: &[u8],
        delay_ms: u64,
    ) -> Result<SlotId, MeshError> {
        pkt.set_route(RouteType::Direct);
        pkt.path = RoutePath::from_slice(path)?;
        self.enqueue_originated(pkt, delay_ms)
    }

    /// Register an expected ACK so its arrival cancels a slot's retransmit.
    pub fn register_expected_ack(&mut self, ack: u32, slot: SlotId) {
        self.tables.register_pending_ack(ack, slot);
    }

    /// Cancel the scheduled retransmission of a queued send.
    pub fn mark_do_not_retransmit(&mut self, slot: SlotId) {
        self.pool.packet_mut(slot).do_not_retransmit = true;
    }

    fn enqueue_originated(&mut self, pkt: Packet, delay_ms: u64) -> Result<SlotId, MeshError> {
        let now = self.clock.millis();
        let at = now + delay_ms + self.airtime_pacing(now);
        match self.pool.allocate(pkt) {
            Some(slot) => {
                self.pool.enqueue_outbound(slot, at);
                Ok(slot)
            }
            None => {
                self.stats.n_full_events += 1;
                warn!("Packet pool full, outbound send dropped");
                Err(MeshError::PoolFull)
            }
        }
    }

    fn enqueue_relay(&mut self, pkt: Packet, at: u64) {
        match self.pool.allocate(pkt) {
            Some(slot) => {
                self.pool.mark_forwarded(slot);
                self.pool.enqueue_outbound(slot, at);
            }
            None => {
                self.stats.n_full_events += 1;
                debug!("Packet pool full, relay dropped");
            }
        }
    }

    // === Airtime budget ===

    /// Extra delay needed to bring the duty cycle back under the cap.
    fn airtime_pacing(&self, now: u64) -> u64 {
        if self.airtime_factor <= 0.0 {
            return 0;
        }
        let allowed_at = (self.total_air_ms as f64 / self.airtime_factor as f64) as u64;
        allowed_at.saturating_sub(now)
    }

    fn airtime_over_budget(&self, now: u64) -> bool {
        self.airtime_pacing(now) > 0
    }

    // === Tick ===

    /// Run one engine tick; returns the next scheduled wakeup deadline.
    pub fn poll(&mut self, app: &mut dyn MeshApp) -> Option<u64> {
        let now = self.clock.millis();

        let mut raw = [0u8; MAX_PACKET_SIZE];
        loop {
            let len = self.radio.recv(&mut raw);
            if len == 0 {
                break;
            }
            self.process_inbound(app, &raw[..len], now);
        }

        self.check_retransmits(now);
        self.transmit_due(now);
        self.pool.next_deadline()
    }

    fn process_inbound(&mut self, app: &mut dyn MeshApp, data: &[u8], now: u64) {
        let mut pkt = match Packet::decode(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                self.stats.n_malformed += 1;
                debug!(error = %e, len = data.len(), "Malformed packet dropped");
                return;
            }
        };

        let hash = pkt.packet_hash();
        if self.tables.seen(hash) {
            self.stats.n_dup_dropped += 1;
            trace!("Duplicate packet dropped: hash {hash:016x}");
            return;
        }
        self.tables.insert_seen(hash);

        if pkt.is_route_flood() {
            self.stats.n_recv_flood += 1;
        } else {
            self.stats.n_recv_direct += 1;
        }

        if pkt.is_route_flood() {
            // flood packets are consumed locally and, independently, relayed
            self.dispatch(app, &mut pkt);

            if pkt.do_not_retransmit || !app.allow_packet_forward(&pkt) {
                return;
            }
            if self.airtime_over_budget(now) {
                self.stats.n_forward_dropped += 1;
                debug!("Airtime budget exceeded, flood relay dropped");
                return;
            }
            let observed_hops = pkt.path.len();
            pkt.path.push(self.relay_id());
            let jitter = self.flood_relay_jitter(observed_hops);
            self.enqueue_relay(pkt, now + jitter);
        } else if pkt.path.is_empty() {
            // end of the source route; the payload decides if it is ours
            self.dispatch(app, &mut pkt);
        } else if pkt.path.as_slice()[0] == self.relay_id() {
            pkt.path.pop_front();
            if !app.allow_packet_forward(&pkt) {
                return;
            }
            if self.airtime_over_budget(now) {
                self.stats.n_forward_dropped += 1;
                debug!("Airtime budget exceeded, direct relay dropped");
                return;
            }
            let jitter = self.rng.random_range(0..DIRECT_RELAY_JITTER_MILLIS);
            self.enqueue_relay(pkt, now + jitter);
        } else {
            trace!("Direct packet for another next hop, dropped");
        }
    }

    fn flood_relay_jitter(&mut self, observed_hops: usize) -> u64 {
        let slots = (observed_hops as u64 + 1).min(8);
        FLOOD_RELAY_BASE_MILLIS + self.rng.random_range(0..FLOOD_JITTER_SLOT_MILLIS * slots)
    }

    // === Dispatch ===

    fn dispatch(&mut self, app: &mut dyn MeshApp, pkt: &mut Packet) {
        match pkt.payload_type() {
            PayloadType::Advert => self.dispatch_advert(app, pkt),
            PayloadType::Ack => self.dispatch_ack(app, pkt),
            PayloadType::TxtMsg | PayloadType::Req | PayloadType::Response => {
                self.dispatch_peer_data(app, pkt)
            }
            PayloadType::Path => self.dispatch_path(app, pkt),
            PayloadType::AnonReq => self.dispatch_anon(app, pkt),
            PayloadType::GrpTxt => self.dispatch_group(app, pkt),
        }
    }

    fn dispatch_advert(&mut self, app: &mut dyn MeshApp, pkt: &Packet) {
        let (id, timestamp, app_data) = match parse_advert(pkt.payload()) {
            Ok(parts) => parts,
            Err(PacketError::BadSignature) => {
                self.stats.n_auth_fail += 1;
                debug!("Advert signature verification failed, dropped");
                return;
            }
            Err(e) => {
                self.stats.n_malformed += 1;
                debug!(error = %e, "Malformed advert dropped");
                return;
            }
        };
        if id.matches(self.self_id.peer()) {
            trace!("Own advert echoed back, ignored");
            return;
        }
        app.on_advert_recv(self, pkt, id, timestamp, app_data);
    }

    fn dispatch_ack(&mut self, app: &mut dyn MeshApp, pkt: &mut Packet) {
        let payload = pkt.payload();
        if payload.len() < ACK_PAYLOAD_SIZE {
            self.stats.n_malformed += 1;
            return;
        }
        let ack = u32::from_le_bytes(payload[..4].try_into().expect("length checked"));
        self.process_ack_value(pkt, ack);
        app.on_ack_recv(self, pkt, ack);
    }

    /// Engine-side ACK bookkeeping, shared with piggybacked ACKs.
    fn process_ack_value(&mut self, pkt: &mut Packet, ack: u32) {
        if let Some(slot) = self.tables.match_pending_ack(ack) {
            self.pool.packet_mut(slot).do_not_retransmit = true;
            // the ACK reached its addressee; no reason to re-air it
            pkt.do_not_retransmit = true;
            debug!("ACK {ack:08x} matched pending send");
        }
    }

    fn dispatch_peer_data(&mut self, app: &mut dyn MeshApp, pkt: &Packet) {
        let Some((slot, plaintext)) = self.open_peer_sealed(app, pkt) else {
            return;
        };
        if plaintext.len() < 4 {
            self.stats.n_malformed += 1;
            return; // every peer datagram starts with a sender timestamp
        }
        app.on_peer_data_recv(self, pkt, pkt.payload_type(), slot, &plaintext);
    }

    fn dispatch_path(&mut self, app: &mut dyn MeshApp, pkt: &mut Packet) {
        let src_hash = match pkt.payload().get(1) {
            Some(&b) => b,
            None => return,
        };
        let Some((slot, plaintext)) = self.open_peer_sealed(app, pkt) else {
            return;
        };
        if plaintext.is_empty() {
            self.stats.n_malformed += 1;
            return;
        }
        let path_len = plaintext[0] as usize;
        if plaintext.len() < 1 + path_len {
            self.stats.n_malformed += 1;
            debug!("Truncated path return dropped");
            return;
        }
        let path: Vec<u8> = plaintext[1..1 + path_len].to_vec();
        let extra_raw = &plaintext[1 + path_len..];
        let extra = if extra_raw.is_empty() {
            None
        } else {
            Some((extra_raw[0], &extra_raw[1..]))
        };

        // a piggybacked ACK cancels pending sends exactly like a bare one
        if let Some((extra_type, extra_data)) = extra {
            if extra_type == PayloadType::Ack.to_bits() && extra_data.len() >= ACK_PAYLOAD_SIZE {
                let ack = u32::from_le_bytes(extra_data[..4].try_into().expect("length checked"));
                self.process_ack_value(pkt, ack);
            }
        }

        let want_reciprocal = app.on_peer_path_recv(self, pkt, slot, &path, extra);

        if want_reciprocal && pkt.is_route_flood() {
            if let Some(secret) = app.peer_secret(slot) {
                match self.create_path_return(src_hash, &secret, &pkt.path, None) {
                    Ok(reply) => {
                        if let Err(e) = self.send_direct(reply, &path, 0) {
                            debug!(error = %e, "Reciprocal path send failed");
                        }
                    }
                    Err(e) => debug!(error = %e, "Reciprocal path compose failed"),
                }
            }
        }
    }

    fn dispatch_anon(&mut self, app: &mut dyn MeshApp, pkt: &Packet) {
        let payload = pkt.payload();
        if payload.len() < 1 + PUB_KEY_SIZE + SEAL_OVERHEAD + 4 {
            self.stats.n_malformed += 1;
            return;
        }
        if payload[0] != self.self_id.hash_prefix() {
            return; // addressed elsewhere
        }
        let sender = match PeerIdentity::from_slice(&payload[1..1 + PUB_KEY_SIZE]) {
            Ok(sender) => sender,
            Err(_) => {
                self.stats.n_malformed += 1;
                return;
            }
        };
        let secret = self.self_id.shared_secret(&sender);
        match crypto::open(&secret, &payload[1 + PUB_KEY_SIZE..]) {
            Ok(plaintext) if plaintext.len() >= 4 => {
                app.on_anon_data_recv(self, pkt, pkt.payload_type(), &sender, &plaintext);
            }
            Ok(_) => {
                self.stats.n_malformed += 1;
            }
            Err(_) => {
                self.stats.n_auth_fail += 1;
                debug!(sender = %sender, "Anon datagram failed to authenticate");
            }
        }
    }

    fn dispatch_group(&mut self, app: &mut dyn MeshApp, pkt: &Packet) {
        let payload = pkt.payload();
        if payload.len() < 1 + SEAL_OVERHEAD + 4 {
            self.stats.n_malformed += 1;
            return;
        }
        let channel_hash = payload[0];
        let sealed = &payload[1..];
        for idx in app.collect_channels_by_hash(channel_hash) {
            let Some(key) = app.channel_key(idx) else {
                continue;
            };
            if let Ok(plaintext) = crypto::open(&key, sealed) {
                if plaintext.len() >= 4 {
                    app.on_group_data_recv(self, pkt, pkt.payload_type(), idx, &plaintext);
                }
                return;
            }
        }
        trace!("Group frame matched no channel");
    }

    /// Try candidate peers by hash prefix until one secret opens the
    /// sealed datagram. Returns the matched slot and plaintext.
    fn open_peer_sealed(
        &mut self,
        app: &mut dyn MeshApp,
        pkt: &Packet,
    ) -> Option<(PeerSlot, Vec<u8>)> {
        let payload = pkt.payload();
        if payload.len() < 2 + SEAL_OVERHEAD {
            self.stats.n_malformed += 1;
            return None;
        }
        if payload[0] != self.self_id.hash_prefix() {
            return None; // addressed elsewhere
        }
        let src_hash = payload[1];
        let sealed = &payload[2..];
        for slot in app.collect_peers_by_hash(src_hash) {
            let Some(secret) = app.peer_secret(slot) else {
                continue;
            };
            if let Ok(plaintext) = crypto::open(&secret, sealed) {
                return Some((slot, plaintext));
            }
        }
        debug!("Datagram from src hash {src_hash:02x} opened by no known peer");
        None
    }

    // === Transmission ===

    fn transmit_due(&mut self, now: u64) {
        loop {
            let Some(slot) = self.pool.pop_due(now) else {
                break;
            };

            let pacing = self.airtime_pacing(now);
            if pacing > 0 {
                if self.pool.is_forwarded(slot) {
                    self.stats.n_forward_dropped += 1;
                    debug!("Airtime budget exceeded, queued relay dropped");
                    self.release_slot(slot);
                    continue;
                }
                // originated sends are delayed, never dropped
                self.pool.enqueue_outbound(slot, now + pacing);
                break;
            }

            let mut buf = [0u8; MAX_PACKET_SIZE];
            let len = self.pool.packet(slot).encode_into(&mut buf);
            match self.radio.send(&buf[..len]) {
                Ok(air_ms) => {
                    self.total_air_ms += air_ms as u64;
                    // our own transmissions count as seen, so echoes relayed
                    // back by neighbors are not relayed again
                    let hash = self.pool.packet(slot).packet_hash();
                    self.tables.insert_seen(hash);
                    if self.pool.packet(slot).is_route_flood() {
                        self.stats.n_sent_flood += 1;
                    } else {
                        self.stats.n_sent_direct += 1;
                    }
                    let pkt = self.pool.packet(slot);
                    let second_tx = self.pool.sent_once(slot);
                    // relays air once; redundancy for floods comes from the
                    // neighboring relays, not from repeating ourselves
                    if second_tx || pkt.do_not_retransmit || self.pool.is_forwarded(slot) {
                        self.release_slot(slot);
                    } else {
                        let deadline = if pkt.is_route_flood() {
                            now + Self::flood_timeout_millis(air_ms)
                        } else {
                            now + Self::direct_timeout_millis(air_ms, pkt.path.len())
                        };
                        self.pool.park_in_flight(slot, deadline);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Radio send failed, packet dropped");
                    self.release_slot(slot);
                }
            }
        }
    }

    fn check_retransmits(&mut self, now: u64) {
        for slot in self.pool.due_retransmits(now) {
            if self.pool.packet(slot).do_not_retransmit {
                self.release_slot(slot);
            } else {
                trace!("Retransmitting unacknowledged packet");
                self.pool.enqueue_outbound(slot, now);
            }
        }
    }

    fn release_slot(&mut self, slot: SlotId) {
        self.tables.purge_slot(slot);
        self.pool.release(slot);
    }
}
