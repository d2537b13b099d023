//! Timer-driven behaviour under a manual clock

use std::time::Duration;

use blocka_engine::crypto::generate_keypair;
use blocka_engine::{Action, HandshakePhase, ManualClock, Tunn, TunnelConfig, TunnelError};

const BUF: usize = 2048;
const STEP: Duration = Duration::from_millis(100);

fn config() -> TunnelConfig {
    TunnelConfig {
        max_jitter: Duration::ZERO,
        ..TunnelConfig::default()
    }
}

fn pair(config: TunnelConfig) -> (Tunn, Tunn, ManualClock) {
    let clock = ManualClock::new();
    let (a_secret, a_public) = generate_keypair();
    let (b_secret, b_public) = generate_keypair();
    let a = Tunn::with_clock(a_secret, b_public, config.clone(), Box::new(clock.clone())).unwrap();
    let b = Tunn::with_clock(b_secret, a_public, config, Box::new(clock.clone())).unwrap();
    (a, b, clock)
}

fn ipv4_packet() -> [u8; 20] {
    let mut packet = [0u8; 20];
    packet[0] = 0x45;
    packet[3] = 20;
    packet
}

/// Full handshake plus the initiator's confirming keepalive
fn establish(a: &mut Tunn, b: &mut Tunn) {
    let mut buf = [0u8; BUF];
    let mut out = [0u8; BUF];
    let Action::WriteToNetwork(n) = a.force_handshake(&mut buf) else {
        panic!("no initiation");
    };
    let Action::WriteToNetwork(m) = b.on_inbound_datagram(&buf[..n], &mut out) else {
        panic!("no response");
    };
    assert_eq!(a.on_inbound_datagram(&out[..m], &mut buf), Action::Done);

    let Action::WriteToNetwork(k) = a.on_tick(&mut buf) else {
        panic!("no confirmation keepalive");
    };
    assert_eq!(k, 32);
    assert_eq!(b.on_inbound_datagram(&buf[..k], &mut out), Action::Done);
    assert_eq!(b.handshake_phase(), HandshakePhase::Established);
}

/// Tick every 100 ms for `total`, returning the times (since start) of
/// every datagram produced
fn tick_for(tunnel: &mut Tunn, clock: &ManualClock, total: Duration) -> Vec<(Duration, Action)> {
    let mut buf = [0u8; BUF];
    let mut events = Vec::new();
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        clock.advance(STEP);
        elapsed += STEP;
        match tunnel.on_tick(&mut buf) {
            Action::Done => {}
            action => events.push((elapsed, action)),
        }
    }
    events
}

#[test]
fn test_tick_is_idempotent() {
    let (mut a, mut b, _) = pair(config());
    establish(&mut a, &mut b);

    let mut buf = [0u8; BUF];
    for _ in 0..100 {
        assert_eq!(a.on_tick(&mut buf), Action::Done);
        assert_eq!(b.on_tick(&mut buf), Action::Done);
    }
    assert_eq!(a.handshake_phase(), HandshakePhase::Established);
    assert_eq!(b.handshake_phase(), HandshakePhase::Established);
    assert!(a.is_established() && b.is_established());
}

#[test]
fn test_idle_tunnel_stays_quiet() {
    let (mut a, _, clock) = pair(config());
    assert!(tick_for(&mut a, &clock, Duration::from_secs(600)).is_empty());
    assert_eq!(a.handshake_phase(), HandshakePhase::Idle);
}

#[test]
fn test_retry_cadence() {
    let (mut a, _, clock) = pair(config());
    let mut buf = [0u8; BUF];
    assert_eq!(a.force_handshake(&mut buf), Action::WriteToNetwork(148));

    let events = tick_for(&mut a, &clock, Duration::from_secs(20));
    let times: Vec<u64> = events.iter().map(|(t, _)| t.as_secs()).collect();
    assert_eq!(times, vec![5, 10, 15, 20]);
    assert!(events
        .iter()
        .all(|(_, action)| *action == Action::WriteToNetwork(148)));
}

#[test]
fn test_link_down_after_max_attempts() {
    let (mut a, _, clock) = pair(config());
    let mut buf = [0u8; BUF];
    a.force_handshake(&mut buf);

    let events = tick_for(&mut a, &clock, Duration::from_secs(120));
    let retries = events
        .iter()
        .filter(|(_, action)| *action == Action::WriteToNetwork(148))
        .count();
    assert_eq!(retries, 17);

    let expired: Vec<_> = events
        .iter()
        .filter(|(_, action)| *action == Action::Err(TunnelError::ConnectionExpired))
        .collect();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].0, Duration::from_secs(90));
    assert_eq!(a.handshake_phase(), HandshakePhase::Idle);
}

#[test]
fn test_outbound_after_link_down_restarts_handshake() {
    let (mut a, mut b, clock) = pair(TunnelConfig {
        max_handshake_attempts: 1,
        ..config()
    });
    let mut buf = [0u8; BUF];
    let mut out = [0u8; BUF];
    a.force_handshake(&mut buf);

    let events = tick_for(&mut a, &clock, Duration::from_secs(6));
    assert_eq!(
        events,
        vec![(
            Duration::from_secs(5),
            Action::Err(TunnelError::ConnectionExpired)
        )]
    );

    let Action::WriteToNetwork(n) = a.on_outbound_packet(&ipv4_packet(), &mut buf) else {
        panic!("expected fresh initiation");
    };
    let Action::WriteToNetwork(m) = b.on_inbound_datagram(&buf[..n], &mut out) else {
        panic!("expected response");
    };
    // The queued packet goes out as soon as the session exists
    let Action::WriteToNetwork(k) = a.on_inbound_datagram(&out[..m], &mut buf) else {
        panic!("expected queued packet");
    };
    assert_eq!(
        b.on_inbound_datagram(&buf[..k], &mut out),
        Action::WriteToTunnelV4(20)
    );
}

#[test]
fn test_initiator_rekeys_after_time() {
    let (mut a, mut b, clock) = pair(config());
    establish(&mut a, &mut b);

    let events = tick_for(&mut a, &clock, Duration::from_secs(121));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, Duration::from_secs(120));
    assert_eq!(events[0].1, Action::WriteToNetwork(148));
    assert_eq!(a.handshake_phase(), HandshakePhase::InitiationSent);

    // The old session keeps carrying traffic meanwhile
    assert!(a.is_established());
}

#[test]
fn test_responder_rekeys_earlier() {
    let (mut a, mut b, clock) = pair(config());
    establish(&mut a, &mut b);

    let events = tick_for(&mut b, &clock, Duration::from_secs(168));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, Duration::from_secs(165));
    assert_eq!(events[0].1, Action::WriteToNetwork(148));
}

#[test]
fn test_passive_keepalive() {
    let (mut a, mut b, clock) = pair(config());
    establish(&mut a, &mut b);

    clock.advance(Duration::from_secs(1));
    let mut buf = [0u8; BUF];
    let mut out = [0u8; BUF];
    let Action::WriteToNetwork(n) = a.on_outbound_packet(&ipv4_packet(), &mut buf) else {
        panic!("packet was not encrypted");
    };
    assert_eq!(
        b.on_inbound_datagram(&buf[..n], &mut out),
        Action::WriteToTunnelV4(20)
    );

    // B has sent nothing since the data arrived
    let events = tick_for(&mut b, &clock, Duration::from_secs(12));
    assert_eq!(events, vec![(Duration::from_secs(10), Action::WriteToNetwork(32))]);
}

#[test]
fn test_persistent_keepalive() {
    let (mut a, mut b, clock) = pair(TunnelConfig {
        persistent_keepalive: Some(Duration::from_secs(25)),
        ..config()
    });
    establish(&mut a, &mut b);

    let events = tick_for(&mut a, &clock, Duration::from_secs(60));
    let times: Vec<u64> = events.iter().map(|(t, _)| t.as_secs()).collect();
    assert_eq!(times, vec![25, 50]);
    assert!(events
        .iter()
        .all(|(_, action)| *action == Action::WriteToNetwork(32)));
}

#[test]
fn test_unanswered_data_triggers_handshake() {
    let (mut a, mut b, clock) = pair(config());
    establish(&mut a, &mut b);

    clock.advance(Duration::from_secs(1));
    let mut buf = [0u8; BUF];
    assert!(matches!(
        a.on_outbound_packet(&ipv4_packet(), &mut buf),
        Action::WriteToNetwork(_)
    ));

    // keepalive_timeout + rekey_timeout after the data went out
    let events = tick_for(&mut a, &clock, Duration::from_secs(16));
    assert_eq!(events, vec![(Duration::from_secs(15), Action::WriteToNetwork(148))]);
}

#[test]
fn test_unanswered_rekey_takes_link_down() {
    let (mut a, mut b, clock) = pair(TunnelConfig {
        max_handshake_attempts: 1,
        ..config()
    });
    establish(&mut a, &mut b);

    let events = tick_for(&mut a, &clock, Duration::from_secs(200));
    assert_eq!(events[0], (Duration::from_secs(120), Action::WriteToNetwork(148)));
    assert_eq!(
        events[1],
        (
            Duration::from_secs(125),
            Action::Err(TunnelError::ConnectionExpired)
        )
    );
    assert!(!a.is_established());
}
