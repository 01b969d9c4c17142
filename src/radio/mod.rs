//! Collaborator contracts for the host platform.
//!
//! The mesh engine owns the radio and polls it; clocks, RNG, and board
//! services are narrow traits so hardware drivers, host adapters, and test
//! doubles plug in interchangeably. Radio-chip drivers themselves live
//! outside this crate; [`udp::UdpRadio`] is a development transport that
//! emulates a shared broadcast channel on a LAN segment.

pub mod udp;

use thiserror::Error;

use crate::config::RadioConfig;

/// Errors from radio operations.
#[derive(Debug, Error)]
pub enum RadioError {
    #[error("radio not started")]
    NotStarted,

    #[error("radio init failed: {0}")]
    InitFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Half-duplex packet radio.
///
/// `recv` and `send` never block; the engine polls `recv` each tick and
/// serializes all transmissions through itself.
pub trait Radio {
    /// Initialize the transceiver with the given parameters.
    fn begin(&mut self, config: &RadioConfig) -> Result<(), RadioError>;

    /// Transmit a frame, returning the measured airtime in milliseconds.
    fn send(&mut self, bytes: &[u8]) -> Result<u32, RadioError>;

    /// Poll for a received frame; returns the frame length, or 0 if none.
    fn recv(&mut self, buf: &mut [u8]) -> usize;

    /// RSSI of the most recently received frame, in dBm.
    fn last_rssi(&self) -> i16;

    /// Estimated airtime in milliseconds for a frame of `len` bytes.
    fn est_airtime_for(&self, len: usize) -> u32;

    /// Total frames received since start.
    fn packets_recv(&self) -> u32;

    /// Total frames transmitted since start.
    fn packets_sent(&self) -> u32;
}

/// Monotonic millisecond counter; never goes backward.
pub trait MillisecondClock {
    fn millis(&self) -> u64;
}

/// Advisory wall-clock seconds (no ordering guarantee between nodes).
pub trait RtcClock {
    fn get(&self) -> u32;
    fn set(&mut self, secs: u32);
}

/// Host board services used by the repeater.
pub trait Board {
    /// Battery voltage in millivolts.
    fn batt_milli_volts(&self) -> u16;

    /// Reboot the node. Does not return on real hardware.
    fn reboot(&mut self);
}

/// Monotonic clock backed by [`std::time::Instant`].
pub struct SystemMillis {
    start: std::time::Instant,
}

impl SystemMillis {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for SystemMillis {
    fn default() -> Self {
        Self::new()
    }
}

impl MillisecondClock for SystemMillis {
    fn millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// RTC backed by the host system clock plus a settable offset.
pub struct SystemRtc {
    offset: i64,
}

impl SystemRtc {
    pub fn new() -> Self {
        Self { offset: 0 }
    }

    fn host_secs() -> u32 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
}

impl Default for SystemRtc {
    fn default() -> Self {
        Self::new()
    }
}

impl RtcClock for SystemRtc {
    fn get(&self) -> u32 {
        (Self::host_secs() as i64 + self.offset).max(0) as u32
    }

    fn set(&mut self, secs: u32) {
        self.offset = secs as i64 - Self::host_secs() as i64;
    }
}

/// LoRa airtime estimate for a frame of `len` bytes.
///
/// Computes symbol time from spreading factor and bandwidth and applies
/// the standard payload symbol formula with explicit header and CRC.
pub fn lora_airtime_estimate_ms(len: usize, bw_khz: f32, sf: u8, cr: u8) -> u32 {
    let t_sym_ms = f32::powi(2.0, sf as i32) / bw_khz; // ms per symbol
    let de = if t_sym_ms > 16.0 { 1.0 } else { 0.0 };
    let numer = 8.0 * len as f32 - 4.0 * sf as f32 + 28.0 + 16.0;
    let denom = 4.0 * (sf as f32 - 2.0 * de);
    let code_rate = (cr as f32 - 4.0).max(1.0); // cr is the 4/x denominator
    let payload_syms = 8.0 + (numer / denom).ceil().max(0.0) * code_rate;
    let preamble_syms = 8.0 + 4.25;
    ((preamble_syms + payload_syms) * t_sym_ms).ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_millis_monotonic() {
        let clock = SystemMillis::new();
        let a = clock.millis();
        let b = clock.millis();
        assert!(b >= a);
    }

    #[test]
    fn test_system_rtc_set_get() {
        let mut rtc = SystemRtc::new();
        rtc.set(1_700_000_000);
        let got = rtc.get();
        assert!((1_700_000_000..=1_700_000_002).contains(&got));
    }

    #[test]
    fn test_airtime_grows_with_length() {
        let short = lora_airtime_estimate_ms(16, 250.0, 10, 5);
        let long = lora_airtime_estimate_ms(160, 250.0, 10, 5);
        assert!(long > short);
        assert!(short > 0);
    }

    #[test]
    fn test_airtime_grows_with_sf() {
        let sf7 = lora_airtime_estimate_ms(64, 125.0, 7, 5);
        let sf12 = lora_airtime_estimate_ms(64, 125.0, 12, 5);
        assert!(sf12 > sf7 * 8);
    }
}
