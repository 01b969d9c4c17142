//! Repeater Service
//!
//! A repeater forwards traffic for the whole mesh and answers a small set
//! of administrative clients. Clients authenticate with a shared password
//! over an anonymous request; once known, they may issue binary requests
//! (stats) and CLI text commands, all replay-guarded by a per-client
//! timestamp floor. Replies ride a path return when the request arrived by
//! flood, so clients learn the route here for subsequent direct traffic.

#[cfg(test)]
mod tests;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::{self, constant_time_eq};
use crate::identity::{PeerIdentity, SharedSecret};
use crate::mesh::{Mesh, MeshApp, MeshError, PeerSlot};
use crate::packet::{AdvertData, NodeKind, Packet, PayloadType, RoutePath};
use crate::radio::Board;

/// Maximum number of authenticated admin clients.
pub const MAX_CLIENTS: usize = 4;

/// Binary request: return the stats record.
pub const CMD_GET_STATS: u8 = 0x01;

/// Spacing between the CLI ACK and the reply text so they do not collide
/// on air.
pub const CLI_REPLY_DELAY_MILLIS: u64 = 1500;

/// Firmware version string reported by `ver`.
pub const FIRMWARE_VERSION: &str = "v1.2.0";

/// Encoded size of [`RepeaterStats`].
pub const REPEATER_STATS_SIZE: usize = 44;

// ============================================================================
// Stats record
// ============================================================================

/// Fixed-layout telemetry record, little-endian on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RepeaterStats {
    pub batt_milli_volts: u16,
    pub curr_tx_queue_len: u16,
    pub curr_free_queue_len: u16,
    pub last_rssi: i16,
    pub n_packets_recv: u32,
    pub n_packets_sent: u32,
    pub total_air_time_secs: u32,
    pub total_up_time_secs: u32,
    pub n_sent_flood: u32,
    pub n_sent_direct: u32,
    pub n_recv_flood: u32,
    pub n_recv_direct: u32,
    pub n_full_events: u32,
}

impl RepeaterStats {
    /// Encode to the 44-byte wire layout.
    pub fn encode(&self) -> [u8; REPEATER_STATS_SIZE] {
        let mut buf = [0u8; REPEATER_STATS_SIZE];
        buf[0..2].copy_from_slice(&self.batt_milli_volts.to_le_bytes());
        buf[2..4].copy_from_slice(&self.curr_tx_queue_len.to_le_bytes());
        buf[4..6].copy_from_slice(&self.curr_free_queue_len.to_le_bytes());
        buf[6..8].copy_from_slice(&self.last_rssi.to_le_bytes());
        buf[8..12].copy_from_slice(&self.n_packets_recv.to_le_bytes());
        buf[12..16].copy_from_slice(&self.n_packets_sent.to_le_bytes());
        buf[16..20].copy_from_slice(&self.total_air_time_secs.to_le_bytes());
        buf[20..24].copy_from_slice(&self.total_up_time_secs.to_le_bytes());
        buf[24..28].copy_from_slice(&self.n_sent_flood.to_le_bytes());
        buf[28..32].copy_from_slice(&self.n_sent_direct.to_le_bytes());
        buf[32..36].copy_from_slice(&self.n_recv_flood.to_le_bytes());
        buf[36..40].copy_from_slice(&self.n_recv_direct.to_le_bytes());
        buf[40..44].copy_from_slice(&self.n_full_events.to_le_bytes());
        buf
    }

    /// Decode from the wire layout.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < REPEATER_STATS_SIZE {
            return None;
        }
        let u16_at = |o: usize| u16::from_le_bytes([data[o], data[o + 1]]);
        let u32_at =
            |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        Some(Self {
            batt_milli_volts: u16_at(0),
            curr_tx_queue_len: u16_at(2),
            curr_free_queue_len: u16_at(4),
            last_rssi: i16::from_le_bytes([data[6], data[7]]),
            n_packets_recv: u32_at(8),
            n_packets_sent: u32_at(12),
            total_air_time_secs: u32_at(16),
            total_up_time_secs: u32_at(20),
            n_sent_flood: u32_at(24),
            n_sent_direct: u32_at(28),
            n_recv_flood: u32_at(32),
            n_recv_direct: u32_at(36),
            n_full_events: u32_at(40),
        })
    }
}

// ============================================================================
// Client table
// ============================================================================

struct ClientInfo {
    id: PeerIdentity,
    /// Timestamp floor for login, requests, and CLI text.
    last_timestamp: u32,
    secret: SharedSecret,
    out_path: Option<RoutePath>,
}

// ============================================================================
// Service state
// ============================================================================

pub(crate) struct RepeaterSvc {
    clients: Vec<ClientInfo>,
    password: String,
    board: Box<dyn Board>,
    advert_name: String,
    advert_lat: f64,
    advert_lon: f64,
}

impl RepeaterSvc {
    /// Find or insert a client. `None` means the table is full.
    fn put_client(&mut self, mesh: &Mesh, id: PeerIdentity) -> Option<usize> {
        if let Some(idx) = self.clients.iter().position(|c| c.id.matches(&id)) {
            return Some(idx);
        }
        if self.clients.len() >= MAX_CLIENTS {
            debug!(capacity = MAX_CLIENTS, "Client table full, login dropped");
            return None;
        }
        let secret = mesh.self_id().shared_secret(&id);
        self.clients.push(ClientInfo {
            id,
            last_timestamp: 0,
            secret,
            out_path: None,
        });
        Some(self.clients.len() - 1)
    }

    /// Send a sealed reply to a client: as a path return when the request
    /// arrived by flood (teaching the client the route here), otherwise as
    /// a datagram, direct when an out-path is known.
    fn send_reply(
        &self,
        mesh: &mut Mesh,
        client_idx: usize,
        packet: &Packet,
        payload_type: PayloadType,
        reply: &[u8],
        delay_ms: u64,
    ) {
        let client = &self.clients[client_idx];
        let result = if packet.is_route_flood() {
            mesh.create_path_return(
                client.id.hash_prefix(),
                &client.secret,
                &packet.path,
                Some((payload_type, reply)),
            )
            .and_then(|pkt| mesh.send_flood(pkt, delay_ms))
        } else {
            mesh.create_datagram(payload_type, &client.id, &client.secret, reply)
                .and_then(|pkt| match client.out_path {
                    Some(path) => mesh.send_direct(pkt, path.as_slice(), delay_ms),
                    None => mesh.send_flood(pkt, delay_ms),
                })
        };
        if let Err(e) = result {
            warn!(error = %e, "Admin reply send failed");
        }
    }

    /// Handle a binary request body. `None` means unknown command.
    fn handle_request(&self, mesh: &Mesh, payload: &[u8]) -> Option<Vec<u8>> {
        match *payload.first()? {
            CMD_GET_STATS => {
                // the max-age parameter is accepted but the stats snapshot
                // is always current
                let _max_age_secs = if payload.len() >= 5 {
                    u32::from_le_bytes(payload[1..5].try_into().expect("length checked"))
                } else {
                    12 * 60 * 60
                };
                Some(self.gather_stats(mesh).encode().to_vec())
            }
            _ => None,
        }
    }

    fn gather_stats(&self, mesh: &Mesh) -> RepeaterStats {
        let stats = mesh.stats();
        RepeaterStats {
            batt_milli_volts: self.board.batt_milli_volts(),
            curr_tx_queue_len: mesh.tx_queue_len() as u16,
            curr_free_queue_len: mesh.free_queue_len() as u16,
            last_rssi: mesh.last_rssi(),
            n_packets_recv: mesh.radio_packets_recv(),
            n_packets_sent: mesh.radio_packets_sent(),
            total_air_time_secs: (mesh.total_air_time_ms() / 1000) as u32,
            total_up_time_secs: (mesh.millis() / 1000) as u32,
            n_sent_flood: stats.n_sent_flood,
            n_sent_direct: stats.n_sent_direct,
            n_recv_flood: stats.n_recv_flood,
            n_recv_direct: stats.n_recv_direct,
            n_full_events: stats.n_full_events,
        }
    }

    fn send_self_advert(&self, mesh: &mut Mesh, delay_ms: u64) -> Result<(), MeshError> {
        let data = AdvertData::new(NodeKind::Repeater, &self.advert_name)
            .with_position(self.advert_lat, self.advert_lon);
        let mut buf = [0u8; crate::packet::MAX_ADVERT_DATA_SIZE];
        let len = data.encode_into(&mut buf).map_err(MeshError::Packet)?;
        let timestamp = mesh.rtc().get();
        let pkt = mesh.create_advert(timestamp, &buf[..len])?;
        mesh.send_flood(pkt, delay_ms)?;
        Ok(())
    }

    /// Textual command parser shared by CLI-over-radio and the serial REPL.
    ///
    /// `sender_timestamp` is 0 for serial lines, which disables clock sync.
    fn handle_command(&mut self, mesh: &mut Mesh, sender_timestamp: u32, command: &str) -> String {
        let command = command.trim_start_matches(' ');

        if command.starts_with("reboot") {
            self.board.reboot(); // does not return on real hardware
            String::new()
        } else if command.starts_with("advert") {
            match self.send_self_advert(mesh, 800) {
                Ok(()) => "OK - Advert sent".to_string(),
                Err(e) => format!("ERR: {e}"),
            }
        } else if command.starts_with("clock sync") {
            let curr = mesh.rtc().get();
            if sender_timestamp > curr {
                mesh.rtc_mut().set(sender_timestamp + 1);
                "OK - clock set".to_string()
            } else {
                "ERR: clock cannot go backwards".to_string()
            }
        } else if command.starts_with("clock") {
            format_clock(mesh.rtc().get())
        } else if let Some(setting) = command.strip_prefix("set ") {
            if setting.starts_with("AF ") || setting.starts_with("af=") {
                match setting[3..].trim().parse::<f32>() {
                    Ok(factor) => {
                        mesh.set_airtime_factor(factor);
                        "OK".to_string()
                    }
                    Err(_) => "ERR: invalid value".to_string(),
                }
            } else {
                format!("unknown config: {setting}")
            }
        } else if command.starts_with("ver") {
            FIRMWARE_VERSION.to_string()
        } else {
            format!("Unknown: {command} (commands: reboot, advert, clock, set, ver)")
        }
    }
}

impl MeshApp for RepeaterSvc {
    fn on_anon_data_recv(
        &mut self,
        mesh: &mut Mesh,
        packet: &Packet,
        payload_type: PayloadType,
        sender: &PeerIdentity,
        plaintext: &[u8],
    ) {
        if payload_type != PayloadType::AnonReq {
            return;
        }
        let timestamp = u32::from_le_bytes(plaintext[..4].try_into().expect("length checked"));
        if !constant_time_eq(&plaintext[4..], self.password.as_bytes()) {
            debug!(sender = %sender, "Incorrect admin password");
            return;
        }
        let Some(idx) = self.put_client(mesh, *sender) else {
            return;
        };
        if timestamp <= self.clients[idx].last_timestamp {
            debug!(sender = %sender, "Login replay dropped");
            return;
        }
        self.clients[idx].last_timestamp = timestamp;
        info!(sender = %sender, "Admin login");

        let mut reply = mesh.rtc().get().to_le_bytes().to_vec();
        reply.extend_from_slice(b"OK");
        self.send_reply(mesh, idx, packet, PayloadType::Response, &reply, 0);
    }

    fn collect_peers_by_hash(&self, hash: u8) -> Vec<PeerSlot> {
        self.clients
            .iter()
            .enumerate()
            .filter(|(_, c)| c.id.hash_matches(hash))
            .map(|(i, _)| PeerSlot(i))
            .collect()
    }

    fn peer_secret(&self, slot: PeerSlot) -> Option<SharedSecret> {
        self.clients.get(slot.0).map(|c| c.secret)
    }

    fn on_peer_data_recv(
        &mut self,
        mesh: &mut Mesh,
        packet: &Packet,
        payload_type: PayloadType,
        slot: PeerSlot,
        plaintext: &[u8],
    ) {
        let idx = slot.0;
        if idx >= self.clients.len() {
            return;
        }
        match payload_type {
            PayloadType::Req => {
                let timestamp =
                    u32::from_le_bytes(plaintext[..4].try_into().expect("length checked"));
                if timestamp <= self.clients[idx].last_timestamp {
                    debug!("Request replay dropped");
                    return;
                }
                let Some(result) = self.handle_request(mesh, &plaintext[4..]) else {
                    debug!("Unknown binary command ignored");
                    return;
                };
                self.clients[idx].last_timestamp = timestamp;

                let mut reply = mesh.rtc().get().to_le_bytes().to_vec();
                reply.extend_from_slice(&result);
                self.send_reply(mesh, idx, packet, PayloadType::Response, &reply, 0);
            }
            PayloadType::TxtMsg if plaintext.len() > 5 => {
                let sender_timestamp =
                    u32::from_le_bytes(plaintext[..4].try_into().expect("length checked"));
                let flags = plaintext[4];
                if flags != 0 {
                    debug!(flags, "Unsupported CLI text received");
                    return;
                }
                if sender_timestamp <= self.clients[idx].last_timestamp {
                    debug!("CLI replay dropped");
                    return;
                }
                self.clients[idx].last_timestamp = sender_timestamp;

                let text_end = 5 + plaintext[5..]
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(plaintext.len() - 5);
                let Ok(text) = std::str::from_utf8(&plaintext[5..text_end]) else {
                    debug!("CLI text with invalid UTF-8 dropped");
                    return;
                };
                let text = text.to_string();

                // prove receipt before acting on the command
                let (client_id_bytes, out_path) = {
                    let client = &self.clients[idx];
                    (*client.id.as_bytes(), client.out_path)
                };
                let ack = crypto::ack_hash(&plaintext[..text_end], &client_id_bytes);
                match mesh.create_ack(ack) {
                    Ok(pkt) => {
                        let result = match out_path {
                            Some(path) => mesh.send_direct(pkt, path.as_slice(), 0),
                            None => mesh.send_flood(pkt, 0),
                        };
                        if let Err(e) = result {
                            warn!(error = %e, "CLI ACK send failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "CLI ACK compose failed"),
                }

                let reply_text = self.handle_command(mesh, sender_timestamp, &text);
                if reply_text.is_empty() {
                    return;
                }
                let mut reply_timestamp = mesh.rtc().get();
                if reply_timestamp == sender_timestamp {
                    // the two stamps must differ in the client's CLI view
                    reply_timestamp += 1;
                }
                let mut reply = reply_timestamp.to_le_bytes().to_vec();
                reply.push(0);
                reply.extend_from_slice(reply_text.as_bytes());

                let client = &self.clients[idx];
                let result = mesh
                    .create_datagram(PayloadType::TxtMsg, &client.id, &client.secret, &reply)
                    .and_then(|pkt| match client.out_path {
                        Some(path) => {
                            mesh.send_direct(pkt, path.as_slice(), CLI_REPLY_DELAY_MILLIS)
                        }
                        None => mesh.send_flood(pkt, CLI_REPLY_DELAY_MILLIS),
                    });
                if let Err(e) = result {
                    warn!(error = %e, "CLI reply send failed");
                }
            }
            _ => {
                debug!(payload_type = ?payload_type, "Unsupported peer datagram ignored");
            }
        }
    }

    fn on_peer_path_recv(
        &mut self,
        _mesh: &mut Mesh,
        _packet: &Packet,
        slot: PeerSlot,
        path: &[u8],
        _extra: Option<(u8, &[u8])>,
    ) -> bool {
        let Some(client) = self.clients.get_mut(slot.0) else {
            return false;
        };
        match RoutePath::from_slice(path) {
            Ok(p) => {
                client.out_path = Some(p);
                debug!(client = %client.id, hops = path.len(), "Client path updated");
            }
            Err(e) => debug!(error = %e, "Client path return rejected"),
        }
        // no reciprocal path send
        false
    }
}

// ============================================================================
// Public wrapper
// ============================================================================

/// A repeater node: forwarding engine plus the admin service.
pub struct Repeater {
    mesh: Mesh,
    svc: RepeaterSvc,
}

impl Repeater {
    /// Create a repeater around an engine and a host board.
    pub fn new(mesh: Mesh, board: Box<dyn Board>, config: &Config) -> Self {
        Self {
            mesh,
            svc: RepeaterSvc {
                clients: Vec::with_capacity(MAX_CLIENTS),
                password: config.node.admin_password.clone(),
                board,
                advert_name: config.node.name.clone(),
                advert_lat: config.node.lat,
                advert_lon: config.node.lon,
            },
        }
    }

    /// Run one tick; returns the next wakeup deadline.
    pub fn poll(&mut self) -> Option<u64> {
        self.mesh.poll(&mut self.svc)
    }

    /// The underlying engine.
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Mutable access to the underlying engine.
    pub fn mesh_mut(&mut self) -> &mut Mesh {
        &mut self.mesh
    }

    /// Flood a self-advertisement.
    pub fn send_self_advert(&mut self, delay_ms: u64) -> Result<(), MeshError> {
        self.svc.send_self_advert(&mut self.mesh, delay_ms)
    }

    /// Feed one completed serial REPL line to the command parser.
    ///
    /// Serial lines carry no sender timestamp, so `clock sync` is refused.
    pub fn handle_serial_line(&mut self, line: &str) -> String {
        self.svc.handle_command(&mut self.mesh, 0, line)
    }

    /// Number of authenticated clients.
    pub fn num_clients(&self) -> usize {
        self.svc.clients.len()
    }

    /// Current telemetry snapshot.
    pub fn stats(&self) -> RepeaterStats {
        self.svc.gather_stats(&self.mesh)
    }
}

// ============================================================================
// Clock formatting
// ============================================================================

/// Format epoch seconds as `HH:MM - D/M/Y UTC`.
fn format_clock(secs: u32) -> String {
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let hh = (secs / 3600) % 24;
    let mm = (secs / 60) % 60;
    format!("{hh:02}:{mm:02} - {day}/{month}/{year} UTC")
}

/// Convert days since the Unix epoch to (year, month, day).
///
/// Howard Hinnant's civil-from-days algorithm.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}
