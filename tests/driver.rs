//! Packet loop over real localhost UDP sockets

use std::time::Duration;

use blocka_engine::crypto::generate_keypair;
use blocka_engine::driver::{self, PeerDriver};
use blocka_engine::{Tunn, TunnelConfig};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

fn ipv4_packet() -> Vec<u8> {
    let mut packet = vec![0u8; 28];
    packet[0] = 0x45;
    packet[3] = 28;
    packet[9] = 17;
    packet[20..].copy_from_slice(b"hi there");
    packet
}

#[tokio::test]
async fn test_probe_then_exchange_packets() {
    let (a_secret, a_public) = generate_keypair();
    let (b_secret, b_public) = generate_keypair();
    let mut a = Tunn::new(a_secret, b_public, TunnelConfig::default()).unwrap();
    let b = Tunn::new(b_secret, a_public, TunnelConfig::default()).unwrap();

    let a_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let a_addr = a_socket.local_addr().unwrap();
    let b_addr = b_socket.local_addr().unwrap();

    // B learns A's address from the handshake
    let (b_delivered_tx, mut b_delivered) = mpsc::channel(16);
    let (_b_outbound_tx, b_outbound) = mpsc::channel(16);
    let (b_stop, b_stopped) = oneshot::channel::<()>();
    let b_driver = PeerDriver::new(b, b_socket, None, b_delivered_tx);
    let b_task = tokio::spawn(b_driver.run(b_outbound, async move {
        let _ = b_stopped.await;
    }));

    let rtt = driver::probe(&mut a, &a_socket, b_addr, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(rtt < Duration::from_secs(2));
    assert!(a.is_established());

    let (a_delivered_tx, _a_delivered) = mpsc::channel(16);
    let (a_outbound_tx, a_outbound) = mpsc::channel(16);
    let (a_stop, a_stopped) = oneshot::channel::<()>();
    let a_driver = PeerDriver::new(a, a_socket, Some(b_addr), a_delivered_tx);
    let a_task = tokio::spawn(a_driver.run(a_outbound, async move {
        let _ = a_stopped.await;
    }));

    a_outbound_tx.send(ipv4_packet()).await.unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(2), b_delivered.recv())
        .await
        .expect("packet not delivered in time")
        .expect("delivery channel closed");
    assert_eq!(delivered, ipv4_packet());

    a_stop.send(()).unwrap();
    b_stop.send(()).unwrap();
    let a_tunnel = a_task.await.unwrap().unwrap();
    let b_tunnel = b_task.await.unwrap().unwrap();

    assert!(a_tunnel.stats().tx_packets >= 2);
    assert!(b_tunnel.is_established());
    assert_ne!(a_addr, b_addr);
}

#[tokio::test]
async fn test_probe_times_out_without_peer() {
    let (a_secret, _) = generate_keypair();
    let (_, b_public) = generate_keypair();
    let mut a = Tunn::new(a_secret, b_public, TunnelConfig::default()).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // Nobody listens here
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let endpoint = silent.local_addr().unwrap();

    let result = driver::probe(&mut a, &socket, endpoint, Duration::from_millis(100)).await;
    assert!(result.is_err());
    assert!(!a.is_established());
}
