use std::cell::Cell;
use std::rc::Rc;

use super::*;
use crate::crypto;
use crate::identity::LocalIdentity;
use crate::packet::{RouteType, MAX_PACKET_SIZE};
use crate::testutil::{SharedClock, SharedRtc, TestBoard, TestRadio, TestRadioHandle};

struct RepeaterRig {
    rpt: Repeater,
    radio: TestRadioHandle,
    clock: SharedClock,
    rtc: SharedRtc,
    rebooted: Rc<Cell<bool>>,
}

fn make_repeater(seed: u64, rtc_secs: u32) -> RepeaterRig {
    let (radio, handle) = TestRadio::new();
    let clock = SharedClock::new();
    let rtc = SharedRtc::new(rtc_secs);
    let (board, rebooted) = TestBoard::new();
    let config = crate::testutil::test_config();
    let mesh = crate::mesh::Mesh::new(
        LocalIdentity::generate(),
        Box::new(radio),
        Box::new(clock.clone()),
        Box::new(rtc.clone()),
        &config,
    )
    .with_seeded_rng(seed);
    RepeaterRig {
        rpt: Repeater::new(mesh, Box::new(board), &config),
        radio: handle,
        clock,
        rtc,
        rebooted,
    }
}

/// An admin client whose hash prefix is distinct from the repeater's, so
/// reply extraction can never confuse relays with replies.
fn admin_client(rig: &RepeaterRig) -> (LocalIdentity, SharedSecret, u8) {
    let rpt_peer = *rig.rpt.mesh().self_id().peer();
    let client = loop {
        let c = LocalIdentity::generate();
        if c.hash_prefix() != rpt_peer.hash_prefix() {
            break c;
        }
    };
    let secret = client.shared_secret(&rpt_peer);
    (client, secret, rpt_peer.hash_prefix())
}

fn encode(pkt: &Packet) -> Vec<u8> {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let len = pkt.encode_into(&mut buf);
    buf[..len].to_vec()
}

/// Flood-routed anonymous login request from `client`.
fn login_frame(
    rpt_prefix: u8,
    client: &LocalIdentity,
    secret: &SharedSecret,
    timestamp: u32,
    password: &str,
) -> Vec<u8> {
    let mut plaintext = timestamp.to_le_bytes().to_vec();
    plaintext.extend_from_slice(password.as_bytes());

    let mut payload = vec![rpt_prefix];
    payload.extend_from_slice(client.pub_key());
    payload.extend_from_slice(&crypto::seal(secret, &plaintext).unwrap());
    encode(&Packet::new(RouteType::Flood, PayloadType::AnonReq, &payload).unwrap())
}

/// Flood-routed sealed datagram from `client` to the repeater.
fn peer_frame(
    rpt_prefix: u8,
    client: &LocalIdentity,
    secret: &SharedSecret,
    payload_type: PayloadType,
    plaintext: &[u8],
) -> Vec<u8> {
    let mut payload = vec![rpt_prefix, client.hash_prefix()];
    payload.extend_from_slice(&crypto::seal(secret, plaintext).unwrap());
    encode(&Packet::new(RouteType::Flood, payload_type, &payload).unwrap())
}

/// Flood-routed CLI text line from `client`.
fn cli_frame(
    rpt_prefix: u8,
    client: &LocalIdentity,
    secret: &SharedSecret,
    timestamp: u32,
    text: &str,
) -> Vec<u8> {
    let mut plaintext = timestamp.to_le_bytes().to_vec();
    plaintext.push(0);
    plaintext.extend_from_slice(text.as_bytes());
    peer_frame(rpt_prefix, client, secret, PayloadType::TxtMsg, &plaintext)
}

/// Decrypted replies addressed to `client`, as (payload_type, plaintext).
/// Path returns are unwrapped to their piggybacked payload.
fn client_replies(
    frames: &[Vec<u8>],
    client: &LocalIdentity,
    secret: &SharedSecret,
) -> Vec<(PayloadType, Vec<u8>)> {
    let mut out = Vec::new();
    for frame in frames {
        let Ok(pkt) = Packet::decode(frame) else {
            continue;
        };
        match pkt.payload_type() {
            PayloadType::Path | PayloadType::Response | PayloadType::TxtMsg => {
                let payload = pkt.payload();
                if payload.len() < 2 || payload[0] != client.hash_prefix() {
                    continue;
                }
                let Ok(plain) = crypto::open(secret, &payload[2..]) else {
                    continue;
                };
                if pkt.payload_type() == PayloadType::Path {
                    // path_len | path | extra_type | extra
                    let n = plain[0] as usize;
                    let extra_type = PayloadType::from_bits(plain[1 + n]).unwrap();
                    out.push((extra_type, plain[2 + n..].to_vec()));
                } else {
                    out.push((pkt.payload_type(), plain));
                }
            }
            PayloadType::Ack => {
                out.push((PayloadType::Ack, pkt.payload().to_vec()));
            }
            _ => {}
        }
    }
    out
}

/// Step time until the send queue drains, discarding traffic.
fn drain(rig: &mut RepeaterRig) {
    for _ in 0..60 {
        rig.clock.advance(500);
        rig.rpt.poll();
    }
    rig.radio.take_sent();
}

#[test]
fn test_admin_login_success() {
    // S3: correct password inserts the client and answers timestamp ‖ "OK"
    let mut rig = make_repeater(1, 500_000);
    let (client, secret, rpt_prefix) = admin_client(&rig);

    rig.radio
        .inject(&login_frame(rpt_prefix, &client, &secret, 100, "h^(kl@#)"));
    rig.rpt.poll();

    assert_eq!(rig.rpt.num_clients(), 1);
    let replies = client_replies(&rig.radio.take_sent(), &client, &secret);
    assert_eq!(replies.len(), 1);
    let (payload_type, plain) = &replies[0];
    assert_eq!(*payload_type, PayloadType::Response);
    assert_eq!(u32::from_le_bytes(plain[..4].try_into().unwrap()), 500_000);
    assert_eq!(&plain[4..], b"OK");
}

#[test]
fn test_admin_login_wrong_password() {
    let mut rig = make_repeater(2, 500_000);
    let (client, secret, rpt_prefix) = admin_client(&rig);

    rig.radio
        .inject(&login_frame(rpt_prefix, &client, &secret, 100, "wrong"));
    rig.rpt.poll();

    assert_eq!(rig.rpt.num_clients(), 0);
    assert!(client_replies(&rig.radio.take_sent(), &client, &secret).is_empty());
}

#[test]
fn test_admin_login_replay_dropped() {
    let mut rig = make_repeater(3, 500_000);
    let (client, secret, rpt_prefix) = admin_client(&rig);

    rig.radio
        .inject(&login_frame(rpt_prefix, &client, &secret, 100, "h^(kl@#)"));
    rig.rpt.poll();
    assert_eq!(rig.rpt.num_clients(), 1);
    rig.radio.take_sent();

    // identical timestamp: replay, no reply, no second insert
    rig.radio
        .inject(&login_frame(rpt_prefix, &client, &secret, 100, "h^(kl@#)"));
    rig.rpt.poll();
    assert_eq!(rig.rpt.num_clients(), 1);
    assert!(client_replies(&rig.radio.take_sent(), &client, &secret).is_empty());
}

#[test]
fn test_client_table_bounded() {
    let mut rig = make_repeater(4, 500_000);
    for i in 0..MAX_CLIENTS + 1 {
        let (client, secret, rpt_prefix) = admin_client(&rig);
        rig.radio.inject(&login_frame(
            rpt_prefix,
            &client,
            &secret,
            100 + i as u32,
            "h^(kl@#)",
        ));
        rig.rpt.poll();
    }
    assert_eq!(rig.rpt.num_clients(), MAX_CLIENTS);
}

#[test]
fn test_stats_request() {
    // S4: reply is timestamp(4) ‖ RepeaterStats(44), uptime from millis
    let mut rig = make_repeater(5, 600_000);
    let (client, secret, rpt_prefix) = admin_client(&rig);

    rig.radio
        .inject(&login_frame(rpt_prefix, &client, &secret, 100, "h^(kl@#)"));
    rig.rpt.poll();
    drain(&mut rig);

    rig.clock.set(55_000);
    let mut req = 101u32.to_le_bytes().to_vec();
    req.push(CMD_GET_STATS);
    req.extend_from_slice(&3_600u32.to_le_bytes());
    rig.radio
        .inject(&peer_frame(rpt_prefix, &client, &secret, PayloadType::Req, &req));
    rig.rpt.poll();

    let replies = client_replies(&rig.radio.take_sent(), &client, &secret);
    let (_, plain) = replies
        .iter()
        .find(|(t, _)| *t == PayloadType::Response)
        .expect("stats response");
    assert_eq!(plain.len(), 4 + REPEATER_STATS_SIZE);

    let stats = RepeaterStats::decode(&plain[4..]).unwrap();
    assert_eq!(stats.total_up_time_secs, 55);
    assert_eq!(stats.batt_milli_volts, 3900);
    // snapshot taken before the reply itself was queued
    assert_eq!(
        stats.curr_free_queue_len as usize,
        Config::default().limits.pool_capacity
    );
    assert_eq!(stats.curr_tx_queue_len, 0);
    assert_eq!(stats.n_recv_flood, 2); // login + request
    assert_eq!(stats.last_rssi, -90);
}

#[test]
fn test_unknown_binary_command_ignored() {
    let mut rig = make_repeater(6, 600_000);
    let (client, secret, rpt_prefix) = admin_client(&rig);

    rig.radio
        .inject(&login_frame(rpt_prefix, &client, &secret, 100, "h^(kl@#)"));
    rig.rpt.poll();
    drain(&mut rig);

    let mut req = 101u32.to_le_bytes().to_vec();
    req.push(0x7F);
    rig.radio
        .inject(&peer_frame(rpt_prefix, &client, &secret, PayloadType::Req, &req));
    rig.rpt.poll();
    assert!(client_replies(&rig.radio.take_sent(), &client, &secret).is_empty());
}

#[test]
fn test_request_replay_dropped() {
    let mut rig = make_repeater(7, 600_000);
    let (client, secret, rpt_prefix) = admin_client(&rig);

    rig.radio
        .inject(&login_frame(rpt_prefix, &client, &secret, 100, "h^(kl@#)"));
    rig.rpt.poll();
    drain(&mut rig);

    // request timestamp equal to the login timestamp is a replay
    let mut req = 100u32.to_le_bytes().to_vec();
    req.push(CMD_GET_STATS);
    rig.radio
        .inject(&peer_frame(rpt_prefix, &client, &secret, PayloadType::Req, &req));
    rig.rpt.poll();
    assert!(client_replies(&rig.radio.take_sent(), &client, &secret).is_empty());
}

#[test]
fn test_cli_clock_sync() {
    // S5: a CLI "clock sync" moves the RTC forward, never backward
    let mut rig = make_repeater(8, 1_000_000);
    let (client, secret, rpt_prefix) = admin_client(&rig);

    rig.radio
        .inject(&login_frame(rpt_prefix, &client, &secret, 100, "h^(kl@#)"));
    rig.rpt.poll();
    rig.radio.take_sent();

    rig.radio
        .inject(&cli_frame(rpt_prefix, &client, &secret, 2_000_000, "clock sync"));
    rig.rpt.poll();
    assert_eq!(rig.rtc.get(), 2_000_001);

    // ACK immediately, delayed text reply after CLI_REPLY_DELAY_MILLIS
    let early = client_replies(&rig.radio.take_sent(), &client, &secret);
    assert!(early.iter().any(|(t, _)| *t == PayloadType::Ack));
    assert!(!early.iter().any(|(t, _)| *t == PayloadType::TxtMsg));

    rig.clock.advance(CLI_REPLY_DELAY_MILLIS);
    rig.rpt.poll();
    let late = client_replies(&rig.radio.take_sent(), &client, &secret);
    let (_, reply) = late
        .iter()
        .find(|(t, _)| *t == PayloadType::TxtMsg)
        .expect("CLI reply");
    assert_eq!(&reply[5..], b"OK - clock set");

    // second attempt at or below the RTC cannot wind it back
    rig.radio
        .inject(&cli_frame(rpt_prefix, &client, &secret, 2_000_001, "clock sync"));
    rig.rpt.poll();
    rig.clock.advance(CLI_REPLY_DELAY_MILLIS);
    rig.rpt.poll();
    assert_eq!(rig.rtc.get(), 2_000_001);
    let late = client_replies(&rig.radio.take_sent(), &client, &secret);
    let (_, reply) = late
        .iter()
        .find(|(t, _)| *t == PayloadType::TxtMsg)
        .expect("CLI error reply");
    assert_eq!(&reply[5..], b"ERR: clock cannot go backwards");
}

#[test]
fn test_cli_ack_proves_receipt() {
    let mut rig = make_repeater(9, 1_000_000);
    let (client, secret, rpt_prefix) = admin_client(&rig);

    rig.radio
        .inject(&login_frame(rpt_prefix, &client, &secret, 100, "h^(kl@#)"));
    rig.rpt.poll();
    rig.radio.take_sent();

    let mut plain = 200u32.to_le_bytes().to_vec();
    plain.push(0);
    plain.extend_from_slice(b"ver");
    rig.radio
        .inject(&peer_frame(rpt_prefix, &client, &secret, PayloadType::TxtMsg, &plain));
    rig.rpt.poll();

    let expected = crypto::ack_hash(&plain, client.pub_key());
    let replies = client_replies(&rig.radio.take_sent(), &client, &secret);
    let (_, ack) = replies
        .iter()
        .find(|(t, _)| *t == PayloadType::Ack)
        .expect("ACK frame");
    assert_eq!(u32::from_le_bytes(ack[..4].try_into().unwrap()), expected);
}

#[test]
fn test_cli_replay_dropped() {
    let mut rig = make_repeater(10, 1_000_000);
    let (client, secret, rpt_prefix) = admin_client(&rig);

    rig.radio
        .inject(&login_frame(rpt_prefix, &client, &secret, 300, "h^(kl@#)"));
    rig.rpt.poll();
    rig.radio.take_sent();

    rig.radio
        .inject(&cli_frame(rpt_prefix, &client, &secret, 300, "ver"));
    rig.rpt.poll();
    assert!(client_replies(&rig.radio.take_sent(), &client, &secret).is_empty());
}

#[test]
fn test_serial_commands() {
    let mut rig = make_repeater(11, 1_700_000_000);

    assert_eq!(rig.rpt.handle_serial_line("ver"), FIRMWARE_VERSION);
    assert_eq!(
        rig.rpt.handle_serial_line("clock"),
        "22:13 - 14/11/2023 UTC"
    );
    // serial lines carry no sender timestamp, so sync is refused
    assert_eq!(
        rig.rpt.handle_serial_line("clock sync"),
        "ERR: clock cannot go backwards"
    );

    assert_eq!(rig.rpt.handle_serial_line("set AF 0.5"), "OK");
    assert_eq!(rig.rpt.mesh().airtime_factor(), 0.5);
    assert_eq!(rig.rpt.handle_serial_line("set af=0.25"), "OK");
    assert_eq!(rig.rpt.mesh().airtime_factor(), 0.25);
    assert_eq!(
        rig.rpt.handle_serial_line("set volume 11"),
        "unknown config: volume 11"
    );

    assert_eq!(
        rig.rpt.handle_serial_line("help"),
        "Unknown: help (commands: reboot, advert, clock, set, ver)"
    );

    assert_eq!(rig.rpt.handle_serial_line("  ver"), FIRMWARE_VERSION);
}

#[test]
fn test_serial_reboot() {
    let mut rig = make_repeater(12, 0);
    assert!(!rig.rebooted.get());
    assert_eq!(rig.rpt.handle_serial_line("reboot"), "");
    assert!(rig.rebooted.get());
}

#[test]
fn test_advert_command_floods_signed_advert() {
    let mut rig = make_repeater(13, 1_000_000);
    assert_eq!(rig.rpt.handle_serial_line("advert"), "OK - Advert sent");

    // advert goes out with a slight delay
    rig.rpt.poll();
    assert_eq!(rig.radio.sent_count(), 0);
    rig.clock.advance(800);
    rig.rpt.poll();

    let sent = rig.radio.take_sent();
    assert_eq!(sent.len(), 1);
    let pkt = Packet::decode(&sent[0]).unwrap();
    assert_eq!(pkt.payload_type(), PayloadType::Advert);
    let (id, ts, app_data) = crate::packet::parse_advert(pkt.payload()).unwrap();
    assert!(id.matches(rig.rpt.mesh().self_id().peer()));
    assert_eq!(ts, 1_000_000);
    let data = AdvertData::decode(app_data).unwrap();
    assert_eq!(data.kind, NodeKind::Repeater);
    assert_eq!(data.name.as_deref(), Some("repeater"));
}

#[test]
fn test_stats_encode_layout() {
    let stats = RepeaterStats {
        batt_milli_volts: 0x1234,
        curr_tx_queue_len: 1,
        curr_free_queue_len: 31,
        last_rssi: -87,
        n_packets_recv: 10,
        n_packets_sent: 11,
        total_air_time_secs: 12,
        total_up_time_secs: 13,
        n_sent_flood: 14,
        n_sent_direct: 15,
        n_recv_flood: 16,
        n_recv_direct: 17,
        n_full_events: 18,
    };
    let buf = stats.encode();
    assert_eq!(buf.len(), REPEATER_STATS_SIZE);
    assert_eq!(buf[0], 0x34);
    assert_eq!(buf[1], 0x12);
    assert_eq!(i16::from_le_bytes([buf[6], buf[7]]), -87);
    assert_eq!(RepeaterStats::decode(&buf).unwrap(), stats);
    assert!(RepeaterStats::decode(&buf[..REPEATER_STATS_SIZE - 1]).is_none());
}

#[test]
fn test_format_clock() {
    assert_eq!(format_clock(0), "00:00 - 1/1/1970 UTC");
    assert_eq!(format_clock(1_700_000_000), "22:13 - 14/11/2023 UTC");
    // leap-day handling
    assert_eq!(format_clock(1_709_164_800), "00:00 - 29/2/2024 UTC");
}
