//! UDP broadcast radio for development and bench testing.
//!
//! Emulates a shared half-duplex channel on a LAN segment: every frame is
//! broadcast to a fixed port, every node listens on that port, and a node
//! ignores its own transmissions. Airtime is the LoRa estimate for the
//! configured modem parameters, so pacing behaves as it would on air.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use tracing::{debug, info};

use crate::config::RadioConfig;
use crate::packet::MAX_PACKET_SIZE;

use super::{lora_airtime_estimate_ms, Radio, RadioError};

/// Default UDP port for the emulated channel.
pub const DEFAULT_CHANNEL_PORT: u16 = 47900;

/// A development radio backed by a nonblocking broadcast UDP socket.
pub struct UdpRadio {
    port: u16,
    socket: Option<UdpSocket>,
    /// Nonce distinguishing our own broadcasts from peers'.
    self_tag: u32,
    config: RadioConfig,
    n_recv: u32,
    n_sent: u32,
}

impl UdpRadio {
    /// Create a radio on the default channel port.
    pub fn new() -> Self {
        Self::with_port(DEFAULT_CHANNEL_PORT)
    }

    /// Create a radio on a specific channel port.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            socket: None,
            self_tag: rand::random(),
            config: RadioConfig::default(),
            n_recv: 0,
            n_sent: 0,
        }
    }
}

impl Default for UdpRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl Radio for UdpRadio {
    fn begin(&mut self, config: &RadioConfig) -> Result<(), RadioError> {
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port));
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| RadioError::InitFailed(format!("bind {bind_addr}: {e}")))?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        info!(port = self.port, freq = %config.freq, sf = config.sf, "UDP radio up");
        self.config = config.clone();
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<u32, RadioError> {
        let socket = self.socket.as_ref().ok_or(RadioError::NotStarted)?;
        let dest = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port));

        // frame = self_tag(4) || packet bytes
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&self.self_tag.to_le_bytes());
        frame.extend_from_slice(bytes);
        socket
            .send_to(&frame, dest)
            .map_err(|e| RadioError::SendFailed(e.to_string()))?;
        self.n_sent += 1;
        Ok(self.est_airtime_for(bytes.len()))
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        let Some(socket) = self.socket.as_ref() else {
            return 0;
        };
        let mut frame = [0u8; MAX_PACKET_SIZE + 4];
        loop {
            match socket.recv_from(&mut frame) {
                Ok((len, from)) => {
                    if len < 4 {
                        continue;
                    }
                    let tag = u32::from_le_bytes(frame[..4].try_into().expect("length checked"));
                    if tag == self.self_tag {
                        continue; // our own broadcast echo
                    }
                    let payload = &frame[4..len];
                    if payload.len() > buf.len() {
                        debug!(from = %from, len, "Oversized frame dropped");
                        continue;
                    }
                    buf[..payload.len()].copy_from_slice(payload);
                    self.n_recv += 1;
                    return payload.len();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return 0,
                Err(e) => {
                    debug!(error = %e, "UDP recv error");
                    return 0;
                }
            }
        }
    }

    fn last_rssi(&self) -> i16 {
        // no RF front end; report a fixed strong signal
        -60
    }

    fn est_airtime_for(&self, len: usize) -> u32 {
        lora_airtime_estimate_ms(len, self.config.bw, self.config.sf, self.config.cr)
    }

    fn packets_recv(&self) -> u32 {
        self.n_recv
    }

    fn packets_sent(&self) -> u32 {
        self.n_sent
    }
}
