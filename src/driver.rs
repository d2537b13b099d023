//! UDP packet loop for one tunnel
//!
//! Owns the socket and the [`Tunn`] and drives it:
//! - datagrams from the socket go to `on_inbound_datagram_from`
//! - plaintext from the outbound channel goes to `on_outbound_packet`
//! - a 100 ms interval drives `on_tick`
//!
//! Decrypted IP packets are delivered on an mpsc channel. The loop has no
//! TUN device; whoever holds the channels plays that role.

use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::{EngineError, NetworkError, TunnelError};
use crate::tunnel::{Action, Tunn};

/// Errors within [`ERROR_WINDOW`] at which the loop gives up
pub const MAX_ERRORS: u32 = 20;

pub const ERROR_WINDOW: Duration = Duration::from_secs(10);

/// How often the tunnel's timers are driven
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Handshakes tried by [`probe`] before reporting a timeout
pub const PROBE_ATTEMPTS: u32 = 3;

/// Buffer size for packets
const BUFFER_SIZE: usize = 65535;

/// Counts recent errors, forgiving them once the window has passed
#[derive(Debug)]
struct ErrorBudget {
    count: u32,
    window_start: Instant,
}

impl ErrorBudget {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    fn record(&mut self, now: Instant) -> Result<(), NetworkError> {
        if now.duration_since(self.window_start) >= ERROR_WINDOW {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        if self.count >= MAX_ERRORS {
            return Err(NetworkError::TooManyErrors { count: self.count });
        }
        Ok(())
    }
}

/// Drives one [`Tunn`] over a UDP socket
pub struct PeerDriver {
    tunnel: Tunn,
    socket: UdpSocket,
    /// Where datagrams go. Learned from the first authenticated peer packet
    /// when not configured.
    endpoint: Option<SocketAddr>,
    delivered: mpsc::Sender<Vec<u8>>,
    errors: ErrorBudget,
}

impl PeerDriver {
    pub fn new(
        tunnel: Tunn,
        socket: UdpSocket,
        endpoint: Option<SocketAddr>,
        delivered: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            tunnel,
            socket,
            endpoint,
            delivered,
            errors: ErrorBudget::new(Instant::now()),
        }
    }

    pub fn tunnel(&self) -> &Tunn {
        &self.tunnel
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    /// Run until `shutdown` resolves or too many errors pile up.
    ///
    /// Returns the tunnel so the caller can inspect or destroy it.
    pub async fn run<F>(
        mut self,
        mut outbound: mpsc::Receiver<Vec<u8>>,
        shutdown: F,
    ) -> Result<Tunn, EngineError>
    where
        F: Future<Output = ()>,
    {
        let mut recv_buf = vec![0u8; BUFFER_SIZE];
        let mut out = vec![0u8; BUFFER_SIZE];
        let mut outbound_open = true;

        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);

        tracing::info!(
            "Packet loop started on {:?}, peer {}",
            self.socket.local_addr().ok(),
            self.tunnel.peer_public()
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Packet loop shutting down");
                    break;
                }

                result = self.socket.recv_from(&mut recv_buf) => {
                    match result {
                        Ok((len, from)) => {
                            self.handle_datagram(&recv_buf[..len], from, &mut out).await?;
                        }
                        Err(e) => {
                            tracing::warn!("UDP recv error: {}", e);
                            self.record_error()?;
                        }
                    }
                }

                packet = outbound.recv(), if outbound_open => {
                    match packet {
                        Some(packet) => {
                            let action = self.tunnel.on_outbound_packet(&packet, &mut out);
                            self.dispatch(action, &out).await?;
                        }
                        None => {
                            tracing::debug!("Outbound channel closed");
                            outbound_open = false;
                        }
                    }
                }

                _ = ticker.tick() => {
                    let action = self.tunnel.on_tick(&mut out);
                    self.dispatch(action, &out).await?;
                }
            }
        }

        Ok(self.tunnel)
    }

    async fn handle_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        out: &mut [u8],
    ) -> Result<(), EngineError> {
        let action = self
            .tunnel
            .on_inbound_datagram_from(Some(from), datagram, out);

        match action {
            Action::WriteToTunnelV4(_) | Action::WriteToTunnelV6(_) => {
                if self.endpoint != Some(from) {
                    tracing::info!("Peer endpoint now {}", from);
                    self.endpoint = Some(from);
                }
            }
            Action::WriteToNetwork(_) if self.endpoint.is_none() => {
                tracing::info!("Learned peer endpoint {}", from);
                self.endpoint = Some(from);
            }
            _ => {}
        }

        let mut action = action;
        loop {
            let sent = matches!(action, Action::WriteToNetwork(_));
            self.dispatch(action, out).await?;
            if !sent {
                return Ok(());
            }
            // Flush anything queued behind the handshake
            action = self.tunnel.on_inbound_datagram(&[], out);
        }
    }

    async fn dispatch(&mut self, action: Action, out: &[u8]) -> Result<(), EngineError> {
        match action {
            Action::Done => Ok(()),
            Action::WriteToNetwork(n) => {
                let Some(endpoint) = self.endpoint else {
                    tracing::debug!("No endpoint yet, dropping {} byte datagram", n);
                    return Ok(());
                };
                if let Err(e) = self.socket.send_to(&out[..n], endpoint).await {
                    tracing::warn!("UDP send to {} failed: {}", endpoint, e);
                    self.record_error()?;
                }
                Ok(())
            }
            Action::WriteToTunnelV4(n) | Action::WriteToTunnelV6(n) => {
                if self.delivered.send(out[..n].to_vec()).await.is_err() {
                    tracing::debug!("Delivery channel closed, dropping packet");
                }
                Ok(())
            }
            Action::Err(TunnelError::ConnectionExpired) => {
                tracing::warn!("Connection expired, waiting for traffic to reconnect");
                Ok(())
            }
            Action::Err(e) => {
                tracing::debug!("Tunnel error: {}", e);
                self.record_error()
            }
        }
    }

    fn record_error(&mut self) -> Result<(), EngineError> {
        self.errors.record(Instant::now()).map_err(|e| {
            tracing::error!("Giving up: {}", e);
            e.into()
        })
    }
}

/// Perform one handshake with the peer at `endpoint` and report its RTT.
///
/// Each attempt waits `timeout` for an answer; cookie replies are followed
/// transparently.
pub async fn probe(
    tunnel: &mut Tunn,
    socket: &UdpSocket,
    endpoint: SocketAddr,
    timeout: Duration,
) -> Result<Duration, EngineError> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut out = vec![0u8; BUFFER_SIZE];

    for attempt in 1..=PROBE_ATTEMPTS {
        tracing::info!("Handshake attempt {}...", attempt);
        let started = Instant::now();

        let n = match tunnel.force_handshake(&mut out) {
            Action::WriteToNetwork(n) => n,
            Action::Err(e) => return Err(e.into()),
            _ => continue,
        };
        send(socket, &out[..n], endpoint).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        while !tunnel.is_established() {
            let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let Ok(received) = received else {
                tracing::warn!("No answer within {:?}", timeout);
                break;
            };
            let (len, from) = received.map_err(|e| NetworkError::ReceiveFailed {
                reason: e.to_string(),
            })?;

            match tunnel.on_inbound_datagram_from(Some(from), &buf[..len], &mut out) {
                Action::WriteToNetwork(n) => send(socket, &out[..n], endpoint).await?,
                Action::Err(e) => tracing::debug!("Ignoring datagram from {}: {}", from, e),
                _ => {}
            }
        }

        if tunnel.is_established() {
            return Ok(started.elapsed());
        }
    }

    Err(NetworkError::HandshakeTimeout {
        seconds: timeout.as_secs() * u64::from(PROBE_ATTEMPTS),
    }
    .into())
}

async fn send(socket: &UdpSocket, data: &[u8], endpoint: SocketAddr) -> Result<(), NetworkError> {
    socket
        .send_to(data, endpoint)
        .await
        .map(|_| ())
        .map_err(|e| NetworkError::SendFailed {
            reason: e.to_string(),
        })
}
