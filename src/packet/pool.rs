//! Fixed-capacity packet pool.
//!
//! All outbound traffic flows through a bounded arena of packet slots. A
//! slot is in exactly one of three states:
//!
//! - **Free**: available for allocation
//! - **Outbound**: queued for transmission at a scheduled time
//! - **InFlight**: transmitted once, parked until its retransmit deadline
//!
//! `free + outbound + in_flight == capacity` holds at all times; slot
//! transfer between states is atomic (a single state write). The pool never
//! grows; allocation failure is reported to the caller, which counts it as
//! a full event.

use super::{Packet, PayloadType, RouteType};

/// Default number of pool slots.
pub const POOL_CAPACITY: usize = 32;

/// Index of a pool slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(u8);

impl SlotId {
    /// Raw index value.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Outbound { scheduled_at: u64 },
    InFlight { deadline: u64 },
}

/// Bounded arena of packet records with free/outbound/in-flight lists.
pub struct PacketPool {
    slots: Vec<Packet>,
    state: Vec<SlotState>,
    /// Set once a slot's packet has been transmitted the first time.
    sent_once: Vec<bool>,
    /// Set for packets relayed on behalf of others; these are shed first
    /// under airtime pressure.
    forwarded: Vec<bool>,
}

impl PacketPool {
    /// Create a pool with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= u8::MAX as usize);
        let placeholder = Packet::new(RouteType::Flood, PayloadType::Ack, &[0u8; 4])
            .expect("placeholder packet is valid");
        Self {
            slots: vec![placeholder; capacity],
            state: vec![SlotState::Free; capacity],
            sent_once: vec![false; capacity],
            forwarded: vec![false; capacity],
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of free slots.
    pub fn free_count(&self) -> usize {
        self.state
            .iter()
            .filter(|s| matches!(s, SlotState::Free))
            .count()
    }

    /// Number of slots queued for transmission.
    pub fn outbound_count(&self) -> usize {
        self.state
            .iter()
            .filter(|s| matches!(s, SlotState::Outbound { .. }))
            .count()
    }

    /// Number of slots awaiting a retransmit decision.
    pub fn in_flight_count(&self) -> usize {
        self.state
            .iter()
            .filter(|s| matches!(s, SlotState::InFlight { .. }))
            .count()
    }

    /// Move a packet into a free slot. `None` means the pool is full.
    ///
    /// The slot starts outbound with an unreachable schedule; callers set
    /// the real time with [`enqueue_outbound`](Self::enqueue_outbound).
    pub fn allocate(&mut self, pkt: Packet) -> Option<SlotId> {
        let idx = self
            .state
            .iter()
            .position(|s| matches!(s, SlotState::Free))?;
        self.slots[idx] = pkt;
        self.sent_once[idx] = false;
        self.forwarded[idx] = false;
        self.state[idx] = SlotState::Outbound {
            scheduled_at: u64::MAX,
        };
        Some(SlotId(idx as u8))
    }

    /// Tag a slot as carrying relayed (not originated) traffic.
    pub fn mark_forwarded(&mut self, slot: SlotId) {
        self.forwarded[slot.index()] = true;
    }

    /// Whether a slot carries relayed traffic.
    pub fn is_forwarded(&self, slot: SlotId) -> bool {
        self.forwarded[slot.index()]
    }

    /// Return a slot to the free list.
    pub fn release(&mut self, slot: SlotId) {
        self.state[slot.index()] = SlotState::Free;
    }

    /// Queue a slot for transmission at `when` (milliseconds).
    pub fn enqueue_outbound(&mut self, slot: SlotId, when: u64) {
        self.state[slot.index()] = SlotState::Outbound { scheduled_at: when };
    }

    /// Pop the earliest due outbound slot, if any.
    ///
    /// The slot transitions to in-flight with an unset deadline; the caller
    /// either parks it with [`park_in_flight`](Self::park_in_flight) or
    /// releases it after transmission.
    pub fn pop_due(&mut self, now: u64) -> Option<SlotId> {
        let idx = self
            .state
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                SlotState::Outbound { scheduled_at } if *scheduled_at <= now => {
                    Some((i, *scheduled_at))
                }
                _ => None,
            })
            .min_by_key(|&(_, at)| at)
            .map(|(i, _)| i)?;
        self.state[idx] = SlotState::InFlight { deadline: u64::MAX };
        Some(SlotId(idx as u8))
    }

    /// Park a transmitted slot until its retransmit deadline.
    pub fn park_in_flight(&mut self, slot: SlotId, deadline: u64) {
        self.sent_once[slot.index()] = true;
        self.state[slot.index()] = SlotState::InFlight { deadline };
    }

    /// Whether this slot's packet has already been transmitted once.
    pub fn sent_once(&self, slot: SlotId) -> bool {
        self.sent_once[slot.index()]
    }

    /// Collect in-flight slots whose retransmit deadline has passed.
    pub fn due_retransmits(&self, now: u64) -> Vec<SlotId> {
        self.state
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                SlotState::InFlight { deadline } if *deadline <= now => Some(SlotId(i as u8)),
                _ => None,
            })
            .collect()
    }

    /// Earliest pending deadline across outbound and in-flight slots.
    pub fn next_deadline(&self) -> Option<u64> {
        self.state
            .iter()
            .filter_map(|s| match s {
                SlotState::Outbound { scheduled_at } if *scheduled_at != u64::MAX => {
                    Some(*scheduled_at)
                }
                SlotState::InFlight { deadline } if *deadline != u64::MAX => Some(*deadline),
                _ => None,
            })
            .min()
    }

    /// Borrow the packet in a slot.
    pub fn packet(&self, slot: SlotId) -> &Packet {
        &self.slots[slot.index()]
    }

    /// Mutably borrow the packet in a slot.
    pub fn packet_mut(&mut self, slot: SlotId) -> &mut Packet {
        &mut self.slots[slot.index()]
    }
}
