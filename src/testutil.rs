//! Shared test doubles: a scripted radio and manually-advanced clocks.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::config::{Config, RadioConfig};
use crate::radio::{Board, MillisecondClock, Radio, RadioError, RtcClock};

/// Handle for inspecting and feeding a [`TestRadio`] owned by a mesh.
#[derive(Clone)]
pub(crate) struct TestRadioHandle {
    rx: Rc<RefCell<VecDeque<Vec<u8>>>>,
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl TestRadioHandle {
    /// Queue a frame for the radio to receive on the next poll.
    pub fn inject(&self, frame: &[u8]) {
        self.rx.borrow_mut().push_back(frame.to_vec());
    }

    /// Drain everything the radio has transmitted so far.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }

    /// Number of frames transmitted (without draining).
    pub fn sent_count(&self) -> usize {
        self.sent.borrow().len()
    }
}

/// In-memory radio: receive queue in, transmit log out. Airtime is one
/// millisecond per byte so tests can reason about budgets exactly.
pub(crate) struct TestRadio {
    rx: Rc<RefCell<VecDeque<Vec<u8>>>>,
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
    n_recv: u32,
    n_sent: u32,
}

impl TestRadio {
    pub fn new() -> (Self, TestRadioHandle) {
        let rx = Rc::new(RefCell::new(VecDeque::new()));
        let sent = Rc::new(RefCell::new(Vec::new()));
        let handle = TestRadioHandle {
            rx: rx.clone(),
            sent: sent.clone(),
        };
        (
            Self {
                rx,
                sent,
                n_recv: 0,
                n_sent: 0,
            },
            handle,
        )
    }
}

impl Radio for TestRadio {
    fn begin(&mut self, _config: &RadioConfig) -> Result<(), RadioError> {
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<u32, RadioError> {
        self.n_sent += 1;
        self.sent.borrow_mut().push(bytes.to_vec());
        Ok(self.est_airtime_for(bytes.len()))
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        match self.rx.borrow_mut().pop_front() {
            Some(frame) => {
                self.n_recv += 1;
                buf[..frame.len()].copy_from_slice(&frame);
                frame.len()
            }
            None => 0,
        }
    }

    fn last_rssi(&self) -> i16 {
        -90
    }

    fn est_airtime_for(&self, len: usize) -> u32 {
        len as u32
    }

    fn packets_recv(&self) -> u32 {
        self.n_recv
    }

    fn packets_sent(&self) -> u32 {
        self.n_sent
    }
}

/// Manually advanced monotonic clock shared between test and mesh.
#[derive(Clone)]
pub(crate) struct SharedClock(Rc<Cell<u64>>);

impl SharedClock {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(0)))
    }

    pub fn advance(&self, ms: u64) {
        self.0.set(self.0.get() + ms);
    }

    pub fn set(&self, ms: u64) {
        self.0.set(ms);
    }

    pub fn now(&self) -> u64 {
        self.0.get()
    }
}

impl MillisecondClock for SharedClock {
    fn millis(&self) -> u64 {
        self.0.get()
    }
}

/// Manually set RTC shared between test and mesh.
#[derive(Clone)]
pub(crate) struct SharedRtc(Rc<Cell<u32>>);

impl SharedRtc {
    pub fn new(secs: u32) -> Self {
        Self(Rc::new(Cell::new(secs)))
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }

    pub fn set_secs(&self, secs: u32) {
        self.0.set(secs);
    }
}

impl RtcClock for SharedRtc {
    fn get(&self) -> u32 {
        self.0.get()
    }

    fn set(&mut self, secs: u32) {
        self.0.set(secs);
    }
}

/// Board double with a fixed battery and a reboot flag.
pub(crate) struct TestBoard {
    pub rebooted: Rc<Cell<bool>>,
}

impl TestBoard {
    pub fn new() -> (Self, Rc<Cell<bool>>) {
        let rebooted = Rc::new(Cell::new(false));
        (
            Self {
                rebooted: rebooted.clone(),
            },
            rebooted,
        )
    }
}

impl Board for TestBoard {
    fn batt_milli_volts(&self) -> u16 {
        3900
    }

    fn reboot(&mut self) {
        self.rebooted.set(true);
    }
}

/// A default config for engine tests: airtime pacing is disabled so send
/// timing is deterministic. Budget tests set their own factor.
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.node.airtime_factor = 0.0;
    config
}
