//! Session state management
//!
//! A [`Session`] is one generation of transport keys. [`SessionSlots`]
//! holds up to three of them (current, previous, next) and
//! [`IndexAllocator`] hands out the local indices that name them.

use std::collections::VecDeque;
use std::time::Duration;

use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::TunnelError;
use crate::protocol::handshake::{Role, SessionMaterial};
use crate::protocol::messages::TransportData;
use crate::protocol::transport::{self, ReplayWindow};
use crate::crypto::aead::TAG_LEN;

/// Session state for one generation of keys
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Session {
    pub local_index: u32,
    pub remote_index: u32,
    sending_key: [u8; 32],
    receiving_key: [u8; 32],
    sending_counter: u64,
    replay: ReplayWindow,
    received_packets: u64,
    /// Counter value at which sending and receiving stop
    reject_after_messages: u64,
    #[zeroize(skip)]
    pub created_at: Duration,
    #[zeroize(skip)]
    pub role: Role,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("sending_counter", &self.sending_counter)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(material: SessionMaterial, now: Duration, reject_after_messages: u64) -> Self {
        Self {
            local_index: material.local_index,
            remote_index: material.remote_index,
            sending_key: material.keys.sending_key,
            receiving_key: material.keys.receiving_key,
            sending_counter: 0,
            replay: ReplayWindow::new(),
            received_packets: 0,
            reject_after_messages,
            created_at: now,
            role: material.role,
        }
    }

    pub fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.created_at)
    }

    /// Next counter this session would send with
    pub fn sending_counter(&self) -> u64 {
        self.sending_counter
    }

    /// Fraction of counters up to the highest seen that never arrived
    pub fn estimated_loss(&self) -> f32 {
        match self.replay.highest() {
            Some(highest) => {
                let expected = highest.saturating_add(1) as f64;
                (1.0 - (self.received_packets as f64 / expected)).max(0.0) as f32
            }
            None => 0.0,
        }
    }

    /// Encrypt `plaintext` into a type-4 message in `dst`.
    pub fn encrypt(&mut self, plaintext: &[u8], dst: &mut [u8]) -> Result<usize, TunnelError> {
        if self.sending_counter >= self.reject_after_messages {
            return Err(TunnelError::SessionExhausted);
        }

        let n = transport::seal_packet(
            &self.sending_key,
            self.remote_index,
            self.sending_counter,
            plaintext,
            dst,
        )?;
        self.sending_counter += 1;
        Ok(n)
    }

    /// Decrypt a type-4 message addressed to this session into `dst`.
    ///
    /// `Ok(None)` means the packet was dropped: replayed, too old, or not
    /// authentic. The replay window only moves for authentic packets.
    pub fn decrypt(
        &mut self,
        packet: &TransportData<'_>,
        dst: &mut [u8],
    ) -> Result<Option<usize>, TunnelError> {
        if packet.counter >= self.reject_after_messages || !self.replay.check(packet.counter) {
            tracing::debug!(
                "Dropping replayed packet: index={} counter={}",
                self.local_index,
                packet.counter
            );
            return Ok(None);
        }

        let needed = packet.payload.len() - TAG_LEN;
        if dst.len() < needed {
            return Err(TunnelError::BufferTooSmall {
                needed,
                available: dst.len(),
            });
        }

        match transport::open_packet(&self.receiving_key, packet, dst) {
            Ok(len) => {
                self.replay.mark(packet.counter);
                self.received_packets += 1;
                Ok(Some(len))
            }
            Err(_) => {
                tracing::debug!(
                    "Dropping unauthenticated packet: index={} counter={}",
                    self.local_index,
                    packet.counter
                );
                Ok(None)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_sending_counter(&mut self, counter: u64) {
        self.sending_counter = counter;
    }
}

/// Which slot a session was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Current,
    Previous,
    Next,
}

/// The current, previous and next sessions of a tunnel
#[derive(Debug, Default)]
pub struct SessionSlots {
    current: Option<Session>,
    previous: Option<Session>,
    next: Option<Session>,
}

impl SessionSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Session> {
        self.current.as_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.previous.is_none() && self.next.is_none()
    }

    /// Local indices of every live session
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        [&self.current, &self.previous, &self.next]
            .into_iter()
            .flatten()
            .map(|s| s.local_index)
    }

    /// Make `session` current. The old current becomes previous; returns the
    /// index of the session pushed out.
    pub fn install_current(&mut self, session: Session) -> Option<u32> {
        let retired = self.previous.take().map(|s| s.local_index);
        self.previous = self.current.replace(session);
        retired
    }

    /// Park an unconfirmed responder session. Returns the index of the
    /// candidate it replaces.
    pub fn install_next(&mut self, session: Session) -> Option<u32> {
        self.next.replace(session).map(|s| s.local_index)
    }

    /// Move next into current. Returns the index pushed out.
    pub fn promote_next(&mut self) -> Option<u32> {
        let session = self.next.take()?;
        self.install_current(session)
    }

    pub fn find_mut(&mut self, local_index: u32) -> Option<(Slot, &mut Session)> {
        if let Some(s) = self.current.as_mut().filter(|s| s.local_index == local_index) {
            return Some((Slot::Current, s));
        }
        if let Some(s) = self.previous.as_mut().filter(|s| s.local_index == local_index) {
            return Some((Slot::Previous, s));
        }
        if let Some(s) = self.next.as_mut().filter(|s| s.local_index == local_index) {
            return Some((Slot::Next, s));
        }
        None
    }

    /// Drop sessions created `reject_after` or longer ago. Returns their indices.
    pub fn expire(&mut self, now: Duration, reject_after: Duration) -> Vec<u32> {
        let mut retired = Vec::new();
        for slot in [&mut self.current, &mut self.previous, &mut self.next] {
            if slot.as_ref().map_or(false, |s| s.age(now) >= reject_after) {
                if let Some(session) = slot.take() {
                    tracing::debug!("Session {} expired", session.local_index);
                    retired.push(session.local_index);
                }
            }
        }
        retired
    }

    /// Drop all sessions. Returns their indices.
    pub fn clear(&mut self) -> Vec<u32> {
        [self.current.take(), self.previous.take(), self.next.take()]
            .into_iter()
            .flatten()
            .map(|s| s.local_index)
            .collect()
    }
}

/// Allocates random local indices.
///
/// An index is never handed out while live, nor while it sits in the
/// quarantine of recently retired indices.
#[derive(Debug)]
pub struct IndexAllocator {
    live: Vec<u32>,
    quarantine: VecDeque<(u32, Duration)>,
    quarantine_time: Duration,
}

impl IndexAllocator {
    pub fn new(quarantine_time: Duration) -> Self {
        Self {
            live: Vec::new(),
            quarantine: VecDeque::new(),
            quarantine_time,
        }
    }

    fn in_use(&self, index: u32) -> bool {
        self.live.contains(&index) || self.quarantine.iter().any(|&(i, _)| i == index)
    }

    pub fn allocate(&mut self, now: Duration) -> u32 {
        self.purge(now);
        loop {
            let index = OsRng.next_u32();
            if !self.in_use(index) {
                self.live.push(index);
                return index;
            }
        }
    }

    /// Move a live index into quarantine. It leaves only by age.
    pub fn retire(&mut self, index: u32, now: Duration) {
        self.purge(now);
        if let Some(pos) = self.live.iter().position(|&i| i == index) {
            self.live.swap_remove(pos);
            self.quarantine.push_back((index, now));
        }
    }

    pub fn is_live(&self, index: u32) -> bool {
        self.live.contains(&index)
    }

    fn purge(&mut self, now: Duration) {
        while let Some(&(_, retired_at)) = self.quarantine.front() {
            if now.saturating_sub(retired_at) < self.quarantine_time {
                break;
            }
            self.quarantine.pop_front();
        }
    }
}
