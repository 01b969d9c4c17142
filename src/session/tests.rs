use std::cell::RefCell;
use std::rc::Rc;

use super::chat::{ChatEvents, ChatMesh};
use super::*;
use crate::crypto;
use crate::identity::LocalIdentity;
use crate::mesh::{Mesh, MeshApp};
use crate::packet::{AdvertData, NodeKind, Packet, PayloadType, RouteType, MAX_PACKET_SIZE};
use crate::testutil::{test_config, SharedClock, SharedRtc, TestRadio, TestRadioHandle};

const PSK16: &str = "AAECAwQFBgcICQoLDA0ODw==";

#[derive(Default)]
struct EventLog {
    discovered: Vec<(String, bool)>,
    messages: Vec<(String, bool, u32, String)>,
    channel_msgs: Vec<(String, Option<u8>, u32, String)>,
    acks: Vec<u32>,
    path_updates: Vec<String>,
    timeouts: u32,
}

struct RecordingEvents(Rc<RefCell<EventLog>>);

impl ChatEvents for RecordingEvents {
    fn on_discovered_contact(&mut self, contact: &Contact, is_new: bool) {
        self.0
            .borrow_mut()
            .discovered
            .push((contact.name.clone(), is_new));
    }

    fn on_contact_path_updated(&mut self, contact: &Contact) {
        self.0.borrow_mut().path_updates.push(contact.name.clone());
    }

    fn on_message_recv(&mut self, contact: &Contact, is_flood: bool, timestamp: u32, text: &str) {
        self.0.borrow_mut().messages.push((
            contact.name.clone(),
            is_flood,
            timestamp,
            text.to_string(),
        ));
    }

    fn on_channel_message_recv(
        &mut self,
        channel: &GroupChannel,
        hops: Option<u8>,
        timestamp: u32,
        text: &str,
    ) {
        self.0.borrow_mut().channel_msgs.push((
            channel.name.clone(),
            hops,
            timestamp,
            text.to_string(),
        ));
    }

    fn on_ack_confirmed(&mut self, ack: u32) {
        self.0.borrow_mut().acks.push(ack);
    }

    fn on_send_timeout(&mut self) {
        self.0.borrow_mut().timeouts += 1;
    }
}

struct ChatNode {
    chat: ChatMesh,
    radio: TestRadioHandle,
    rtc: SharedRtc,
    log: Rc<RefCell<EventLog>>,
}

fn make_chat_node(seed: u64, clock: &SharedClock, rtc_secs: u32) -> ChatNode {
    let (radio, handle) = TestRadio::new();
    let rtc = SharedRtc::new(rtc_secs);
    let log = Rc::new(RefCell::new(EventLog::default()));
    let mesh = Mesh::new(
        LocalIdentity::generate(),
        Box::new(radio),
        Box::new(clock.clone()),
        Box::new(rtc.clone()),
        &test_config(),
    )
    .with_seeded_rng(seed);
    ChatNode {
        chat: ChatMesh::new(mesh, Box::new(RecordingEvents(log.clone()))),
        radio: handle,
        rtc,
        log,
    }
}

struct NullApp;
impl MeshApp for NullApp {}

struct RelayNode {
    mesh: Mesh,
    app: NullApp,
    radio: TestRadioHandle,
}

fn make_relay_node(seed: u64, clock: &SharedClock) -> RelayNode {
    let (radio, handle) = TestRadio::new();
    let mesh = Mesh::new(
        LocalIdentity::generate(),
        Box::new(radio),
        Box::new(clock.clone()),
        Box::new(SharedRtc::new(0)),
        &test_config(),
    )
    .with_seeded_rng(seed);
    RelayNode {
        mesh,
        app: NullApp,
        radio: handle,
    }
}

impl RelayNode {
    fn poll(&mut self) {
        self.mesh.poll(&mut self.app);
    }
}

/// Radio links between node indexes; frames cross only where a link exists.
struct Net {
    links: Vec<(usize, usize)>,
    handles: Vec<TestRadioHandle>,
}

impl Net {
    fn deliver(&self) -> bool {
        let mut moved = false;
        for (i, handle) in self.handles.iter().enumerate() {
            for frame in handle.take_sent() {
                moved = true;
                for &(x, y) in &self.links {
                    if x == i {
                        self.handles[y].inject(&frame);
                    } else if y == i {
                        self.handles[x].inject(&frame);
                    }
                }
            }
        }
        moved
    }
}

/// Poll everything and ferry frames until the air goes quiet, stepping
/// the shared clock forward up to `ms` milliseconds.
fn settle(clock: &SharedClock, net: &Net, mut poll_all: impl FnMut(), ms: u64) {
    let end = clock.now() + ms;
    loop {
        loop {
            poll_all();
            if !net.deliver() {
                break;
            }
        }
        if clock.now() >= end {
            break;
        }
        clock.advance(25);
    }
    poll_all();
}

fn encode(pkt: &Packet) -> Vec<u8> {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let len = pkt.encode_into(&mut buf);
    buf[..len].to_vec()
}

#[test]
fn test_two_hop_chat_with_path_learning() {
    // S1: A and B are out of range of each other; R relays.
    let clock = SharedClock::new();
    let mut a = make_chat_node(100, &clock, 1_000_000);
    let mut r = make_relay_node(101, &clock);
    let mut b = make_chat_node(102, &clock, 1_000_000);
    let relay_id = r.mesh.relay_id();

    let net = Net {
        links: vec![(0, 1), (1, 2)],
        handles: vec![a.radio.clone(), r.radio.clone(), b.radio.clone()],
    };

    // both ends advertise so each learns the other's identity
    a.chat
        .send_self_advert(&AdvertData::new(NodeKind::Chat, "alice"), 0)
        .unwrap();
    settle(&clock, &net, || {
        a.chat.poll();
        r.poll();
        b.chat.poll();
    }, 5_000);
    b.chat
        .send_self_advert(&AdvertData::new(NodeKind::Chat, "bob"), 0)
        .unwrap();
    settle(&clock, &net, || {
        a.chat.poll();
        r.poll();
        b.chat.poll();
    }, 5_000);

    assert_eq!(b.log.borrow().discovered, vec![("alice".to_string(), true)]);
    let bob_id = a.chat.search_contacts_by_prefix("bob").map(|c| c.id).unwrap();
    let bob_idx = a.chat.find_contact(&bob_id).unwrap();

    // A floods "hi"; B delivers and answers with a path return + ACK
    let (status, expected_ack) = a.chat.send_message(bob_idx, 0, "hi").unwrap();
    assert_eq!(status, SendStatus::SentFlood);
    settle(&clock, &net, || {
        a.chat.poll();
        r.poll();
        b.chat.poll();
    }, 10_000);

    {
        let blog = b.log.borrow();
        assert_eq!(blog.messages.len(), 1);
        let (from, is_flood, timestamp, text) = &blog.messages[0];
        assert_eq!(from, "alice");
        assert!(*is_flood);
        assert_eq!(*timestamp, 1_000_000);
        assert_eq!(text, "hi");
    }

    // A's pending ACK matched and the timeout was cleared
    assert_eq!(a.log.borrow().acks, vec![expected_ack]);
    assert_eq!(a.log.borrow().timeouts, 0);

    // A learned the one-relay source route to B
    let contact = a.chat.contact(bob_idx).unwrap();
    let out_path = contact.out_path.expect("path learned from path return");
    assert_eq!(out_path.as_slice(), &[relay_id]);

    // the next send goes direct along [R]
    let (status, _) = a.chat.send_message(bob_idx, 0, "again").unwrap();
    assert_eq!(status, SendStatus::SentDirect);
    settle(&clock, &net, || {
        a.chat.poll();
        r.poll();
        b.chat.poll();
    }, 10_000);

    let blog = b.log.borrow();
    assert_eq!(blog.messages.len(), 2);
    assert_eq!(blog.messages[1].3, "again");
    assert!(!blog.messages[1].1, "second delivery must be direct");
}

#[test]
fn test_replay_rejection_orders_by_timestamp() {
    // property 3: after t2 is delivered, an older t1 from the same peer is dropped
    let clock = SharedClock::new();
    let mut a = make_chat_node(200, &clock, 2_000);
    let mut b = make_chat_node(201, &clock, 0);

    let net = Net {
        links: vec![(0, 1)],
        handles: vec![a.radio.clone(), b.radio.clone()],
    };

    a.chat
        .send_self_advert(&AdvertData::new(NodeKind::Chat, "alice"), 0)
        .unwrap();
    b.chat
        .send_self_advert(&AdvertData::new(NodeKind::Chat, "bob"), 0)
        .unwrap();
    settle(&clock, &net, || {
        a.chat.poll();
        b.chat.poll();
    }, 5_000);

    let bob_idx = a
        .chat
        .find_contact(b.chat.mesh().self_id().peer())
        .unwrap();

    a.chat.send_message(bob_idx, 0, "text2").unwrap(); // sender clock at 2000
    settle(&clock, &net, || {
        a.chat.poll();
        b.chat.poll();
    }, 8_000);

    // wind the sender's RTC backward and send an "older" message
    a.rtc.set_secs(1_000);
    a.chat.send_message(bob_idx, 0, "text1").unwrap();
    settle(&clock, &net, || {
        a.chat.poll();
        b.chat.poll();
    }, 8_000);

    let blog = b.log.borrow();
    let texts: Vec<&str> = blog.messages.iter().map(|m| m.3.as_str()).collect();
    assert_eq!(texts, vec!["text2"]);
    assert_eq!(b.chat.n_replays(), 1);
}

#[test]
fn test_advert_replay_dropped_and_update_applied() {
    let clock = SharedClock::new();
    let mut b = make_chat_node(300, &clock, 0);
    let peer = LocalIdentity::generate();

    let mut app_data = [0u8; crate::packet::MAX_ADVERT_DATA_SIZE];
    let len = AdvertData::new(NodeKind::Chat, "carol")
        .encode_into(&mut app_data)
        .unwrap();

    let advert = |ts: u32| {
        let payload = crate::packet::build_advert(&peer, ts, &app_data[..len]).unwrap();
        encode(&Packet::new(RouteType::Flood, PayloadType::Advert, &payload).unwrap())
    };

    b.radio.inject(&advert(100));
    b.chat.poll();
    assert_eq!(b.log.borrow().discovered, vec![("carol".to_string(), true)]);

    // same timestamp again: replay, no event
    b.radio.inject(&advert(100));
    b.chat.poll();
    assert_eq!(b.log.borrow().discovered.len(), 1);
    assert_eq!(b.chat.n_replays(), 1);

    // newer timestamp refreshes the contact
    b.radio.inject(&advert(200));
    b.chat.poll();
    assert_eq!(b.log.borrow().discovered.len(), 2);
    assert_eq!(b.log.borrow().discovered[1], ("carol".to_string(), false));
    let idx = b.chat.find_contact(peer.peer()).unwrap();
    assert_eq!(b.chat.contact(idx).unwrap().last_advert_timestamp, 200);
}

#[test]
fn test_send_message_too_long_fails() {
    let clock = SharedClock::new();
    let mut a = make_chat_node(400, &clock, 0);
    let peer = LocalIdentity::generate();
    let idx = a
        .chat
        .add_contact(*peer.peer(), "dave", NodeKind::Chat)
        .unwrap();

    let long = "x".repeat(MAX_TEXT_LEN + 1);
    assert!(matches!(
        a.chat.send_message(idx, 0, &long),
        Err(SessionError::TextTooLong(_))
    ));
}

#[test]
fn test_send_timeout_fires_and_retry_changes_ack() {
    let clock = SharedClock::new();
    let mut a = make_chat_node(500, &clock, 5_000);
    let peer = LocalIdentity::generate();
    let idx = a
        .chat
        .add_contact(*peer.peer(), "ghost", NodeKind::Chat)
        .unwrap();

    let (_, ack0) = a.chat.send_message(idx, 0, "anyone there").unwrap();
    // nobody answers; step far past the flood timeout
    for _ in 0..40 {
        clock.advance(500);
        a.chat.poll();
    }
    assert_eq!(a.log.borrow().timeouts, 1);

    // the caller retries with a bumped attempt; the expected ACK differs,
    // so the retry is not flood-suppressed as a duplicate
    let (_, ack1) = a.chat.send_message(idx, 1, "anyone there").unwrap();
    assert_ne!(ack0, ack1);
}

#[test]
fn test_group_channel_roundtrip_no_ack() {
    let clock = SharedClock::new();
    let mut a = make_chat_node(600, &clock, 3_000);
    let mut b = make_chat_node(601, &clock, 0);
    a.chat.add_channel("public", PSK16).unwrap();
    b.chat.add_channel("public", PSK16).unwrap();

    let net = Net {
        links: vec![(0, 1)],
        handles: vec![a.radio.clone(), b.radio.clone()],
    };

    a.chat.send_group_message(0, "hello group").unwrap();
    settle(&clock, &net, || {
        a.chat.poll();
        b.chat.poll();
    }, 5_000);

    let blog = b.log.borrow();
    assert_eq!(
        blog.channel_msgs,
        vec![("public".to_string(), Some(0), 3_000, "hello group".to_string())]
    );
    // group frames are never acknowledged
    assert!(a.log.borrow().acks.is_empty());
}

#[test]
fn test_group_frame_ignored_without_matching_channel() {
    let clock = SharedClock::new();
    let mut a = make_chat_node(700, &clock, 0);
    let mut b = make_chat_node(701, &clock, 0);
    a.chat.add_channel("private", PSK16).unwrap();
    // B has no channels at all

    let net = Net {
        links: vec![(0, 1)],
        handles: vec![a.radio.clone(), b.radio.clone()],
    };

    a.chat.send_group_message(0, "secret").unwrap();
    settle(&clock, &net, || {
        a.chat.poll();
        b.chat.poll();
    }, 5_000);

    assert!(b.log.borrow().channel_msgs.is_empty());
}

#[test]
fn test_unsupported_text_flags_not_delivered() {
    let clock = SharedClock::new();
    let mut b = make_chat_node(800, &clock, 0);
    let peer = LocalIdentity::generate();
    b.chat
        .add_contact(*peer.peer(), "eve", NodeKind::Chat)
        .unwrap();

    let secret = peer.shared_secret(b.chat.mesh().self_id().peer());
    let mut plaintext = 1_234u32.to_le_bytes().to_vec();
    plaintext.push(0x04); // flags >> 2 == 1: not plain text
    plaintext.extend_from_slice(b"binary");
    let mut payload = vec![
        b.chat.mesh().self_id().hash_prefix(),
        peer.hash_prefix(),
    ];
    payload.extend_from_slice(&crypto::seal(&secret, &plaintext).unwrap());
    let pkt = Packet::new(RouteType::Flood, PayloadType::TxtMsg, &payload).unwrap();
    b.radio.inject(&encode(&pkt));
    b.chat.poll();

    assert!(b.log.borrow().messages.is_empty());
}

#[test]
fn test_text_null_padding_trimmed() {
    let clock = SharedClock::new();
    let mut b = make_chat_node(900, &clock, 0);
    let peer = LocalIdentity::generate();
    b.chat
        .add_contact(*peer.peer(), "pad", NodeKind::Chat)
        .unwrap();

    let secret = peer.shared_secret(b.chat.mesh().self_id().peer());
    let mut plaintext = 99u32.to_le_bytes().to_vec();
    plaintext.push(0);
    plaintext.extend_from_slice(b"hi\0\0\0");
    let mut payload = vec![
        b.chat.mesh().self_id().hash_prefix(),
        peer.hash_prefix(),
    ];
    payload.extend_from_slice(&crypto::seal(&secret, &plaintext).unwrap());
    let pkt = Packet::new(RouteType::Flood, PayloadType::TxtMsg, &payload).unwrap();
    b.radio.inject(&encode(&pkt));
    b.chat.poll();

    let blog = b.log.borrow();
    assert_eq!(blog.messages.len(), 1);
    assert_eq!(blog.messages[0].3, "hi");
}

#[test]
fn test_reset_path_falls_back_to_flood() {
    let clock = SharedClock::new();
    let mut a = make_chat_node(1000, &clock, 0);
    let peer = LocalIdentity::generate();
    let idx = a
        .chat
        .add_contact(*peer.peer(), "faraway", NodeKind::Chat)
        .unwrap();

    // pretend a path was learned earlier
    let secret = peer.shared_secret(a.chat.mesh().self_id().peer());
    let mut inner = vec![1u8, 0x77];
    inner.push(PayloadType::Ack.to_bits());
    inner.extend_from_slice(&0u32.to_le_bytes());
    let mut payload = vec![
        a.chat.mesh().self_id().hash_prefix(),
        peer.hash_prefix(),
    ];
    payload.extend_from_slice(&crypto::seal(&secret, &inner).unwrap());
    let pkt = Packet::new(RouteType::Flood, PayloadType::Path, &payload).unwrap();
    a.radio.inject(&encode(&pkt));
    a.chat.poll();
    assert!(a.chat.contact(idx).unwrap().out_path.is_some());
    assert_eq!(a.log.borrow().path_updates, vec!["faraway".to_string()]);

    a.chat.reset_path_to(idx).unwrap();
    assert!(a.chat.contact(idx).unwrap().out_path.is_none());

    let (status, _) = a.chat.send_message(idx, 0, "where are you").unwrap();
    assert_eq!(status, SendStatus::SentFlood);
}
