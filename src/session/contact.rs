//! Contact records and the bounded contact table.

use tracing::debug;

use crate::identity::{LocalIdentity, PeerIdentity, SharedSecret};
use crate::mesh::PeerSlot;
use crate::packet::{NodeKind, RoutePath};

use super::MAX_CONTACTS;

/// A known peer.
///
/// The cached shared secret is the only copy in the system; it is derived
/// once at insertion and never transmitted. Both timestamp floors are
/// monotone: adverts and datagrams at or below them are replays.
#[derive(Clone)]
pub struct Contact {
    pub id: PeerIdentity,
    /// Friendly name from the latest advert (≤ 31 bytes).
    pub name: String,
    pub kind: NodeKind,
    /// Timestamp of the newest verified advert.
    pub last_advert_timestamp: u32,
    /// Timestamp floor for sealed datagrams.
    pub last_timestamp: u32,
    /// Learned source route, if any.
    pub out_path: Option<RoutePath>,
    shared_secret: SharedSecret,
}

impl Contact {
    /// Read-only view of the cached pairwise secret.
    pub fn secret(&self) -> &SharedSecret {
        &self.shared_secret
    }
}

/// Fixed-capacity contact table with hash-prefix lookup.
pub struct ContactTable {
    contacts: Vec<Contact>,
}

impl ContactTable {
    pub fn new() -> Self {
        Self {
            contacts: Vec::with_capacity(MAX_CONTACTS),
        }
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= MAX_CONTACTS
    }

    pub fn get(&self, idx: usize) -> Option<&Contact> {
        self.contacts.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Contact> {
        self.contacts.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    /// Index of the contact with this exact identity.
    pub fn find_by_id(&self, id: &PeerIdentity) -> Option<usize> {
        self.contacts.iter().position(|c| c.id.matches(id))
    }

    /// Insert a new contact, deriving and caching the shared secret.
    ///
    /// Returns `None` when the table is full (the caller counts the drop).
    pub fn insert(
        &mut self,
        self_id: &LocalIdentity,
        id: PeerIdentity,
        name: &str,
        kind: NodeKind,
    ) -> Option<usize> {
        if self.is_full() {
            debug!(capacity = MAX_CONTACTS, "Contact table full, advert dropped");
            return None;
        }
        let shared_secret = self_id.shared_secret(&id);
        self.contacts.push(Contact {
            id,
            name: name.to_string(),
            kind,
            last_advert_timestamp: 0,
            last_timestamp: 0,
            out_path: None,
            shared_secret,
        });
        Some(self.contacts.len() - 1)
    }

    /// Collect slots whose identity hash prefix matches.
    pub fn collect_by_hash(&self, hash: u8) -> Vec<PeerSlot> {
        self.contacts
            .iter()
            .enumerate()
            .filter(|(_, c)| c.id.hash_matches(hash))
            .map(|(i, _)| PeerSlot(i))
            .collect()
    }

    /// First contact whose name starts with `prefix`.
    pub fn search_by_prefix(&self, prefix: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.name.starts_with(prefix))
    }

    /// Indexes of the `last_n` most recently advertised contacts
    /// (all of them when `last_n` is 0), newest first.
    pub fn recent_indexes(&self, last_n: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.contacts.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.contacts[i].last_advert_timestamp));
        if last_n > 0 {
            order.truncate(last_n);
        }
        order
    }
}
