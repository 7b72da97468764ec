//! Per-peer transport sessions
//!
//! Each peer owns a bounded set of slots: one forming handshake
//! (`pending`), one freshly keyed session (`next`), the session in use
//! (`curr`) and the one it replaced (`prev`). Keys are installed into
//! `next`; the first transport packet authenticated in either direction
//! promotes it to `curr`. `prev` sticks around so in-flight packets
//! still decrypt during rotation, and is destroyed, keys wiped, when
//! the rotation after that happens or its lifetime limit passes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use zeroize::Zeroize;

use super::replay::ReplayWindow;
use crate::crypto::aead;
use crate::error::ProtocolError;
use crate::wire::ipc::SessKeys;
use crate::wire::wg::DataHeader;

/// Ask for a new handshake once the current session is this old.
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// Never use a session older than this.
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Pace handshake requests, retries and queue-triggered rekeys.
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// Give up on a handshake that made no progress for this long.
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);

/// Answer received-only traffic with an empty packet after this long.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ask for a new handshake once this many packets were sent.
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// Hard send limit of one session.
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - 8192;

/// Cookies from a loaded responder stay valid this long.
pub const COOKIE_VALID: Duration = Duration::from_secs(120);

/// Outbound packets queued per peer while no session exists.
pub const QUEUE_CAP: usize = 50;

/// One live transport session.
pub struct Session {
    pub id: u32,
    pub peer_sessid: u32,
    sendkey: [u8; 32],
    recvkey: [u8; 32],
    pub send_counter: u64,
    pub replay: ReplayWindow,
    pub initiator: bool,
    started: Instant,
    /// Set after an unanswered data send; passing it makes the session
    /// unusable until the peer says something.
    pub deadline: Option<Instant>,
    /// When to answer received-only traffic with an empty packet.
    pub keepalive_due: Option<Instant>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.sendkey.zeroize();
        self.recvkey.zeroize();
    }
}

impl Session {
    fn new(keys: &SessKeys, initiator: bool, now: Instant) -> Self {
        Self {
            id: keys.sessid,
            peer_sessid: keys.peersessid,
            sendkey: keys.sendkey,
            recvkey: keys.recvkey,
            send_counter: 0,
            replay: ReplayWindow::new(),
            initiator,
            started: now,
            deadline: None,
            keepalive_due: None,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub fn usable(&self, now: Instant) -> bool {
        if self.send_counter >= REJECT_AFTER_MESSAGES {
            return false;
        }
        if self.age(now) > REJECT_AFTER_TIME {
            return false;
        }
        if let Some(deadline) = self.deadline {
            if now > deadline {
                return false;
            }
        }
        true
    }

    /// Whether this session has outlived any use, even for decryption.
    pub fn expired(&self, now: Instant) -> bool {
        self.age(now) > REJECT_AFTER_TIME
            || self.send_counter >= REJECT_AFTER_MESSAGES
            || self.replay.max_counter() >= REJECT_AFTER_MESSAGES
    }

    /// Whether the owning peer should ask for a fresh handshake.
    pub fn wants_rekey(&self, now: Instant) -> bool {
        self.send_counter >= REKEY_AFTER_MESSAGES
            || (self.initiator && self.age(now) >= REKEY_AFTER_TIME)
    }

    /// Seal one tunnel packet (empty for a keepalive) into a complete
    /// transport message. Plaintext is zero-padded to a multiple of 16.
    pub fn seal_packet(&mut self, packet: &[u8], now: Instant) -> Result<Vec<u8>, ProtocolError> {
        if self.send_counter >= REJECT_AFTER_MESSAGES {
            return Err(ProtocolError::SessionExpired);
        }

        let padded_len = packet.len().div_ceil(16) * 16;
        let mut padded = vec![0u8; padded_len];
        padded[..packet.len()].copy_from_slice(packet);

        let sealed = aead::seal(&self.sendkey, self.send_counter, &padded, &[])
            .map_err(|_| ProtocolError::SessionExpired)?;
        let msg = DataHeader::frame(self.peer_sessid, self.send_counter, &sealed);

        self.send_counter += 1;
        self.keepalive_due = None;
        if !packet.is_empty() && self.deadline.is_none() {
            self.deadline = Some(now + KEEPALIVE_TIMEOUT + REKEY_TIMEOUT);
        }
        Ok(msg)
    }

    /// Authenticate and decrypt a transport message. The replay window
    /// is only probed here; the caller commits the counter with
    /// [`Session::commit_counter`] once the inner packet passed the
    /// allowed-IP check.
    pub fn open_packet(&self, data: &[u8]) -> Result<(u64, Vec<u8>), ProtocolError> {
        let hdr = DataHeader::from_bytes(data)?;
        if !self.replay.is_new(hdr.counter) {
            return Err(ProtocolError::ReplayDetected {
                counter: hdr.counter,
            });
        }
        let plaintext = aead::open(&self.recvkey, hdr.counter, DataHeader::payload(data), &[])
            .map_err(|_| ProtocolError::Unauthenticated)?;
        Ok((hdr.counter, plaintext))
    }

    /// Mark `counter` as seen and the peer as alive.
    pub fn commit_counter(&mut self, counter: u64) {
        self.replay.update(counter);
        self.deadline = None;
    }
}

/// Outstanding handshake bookkeeping, one per peer at most.
pub struct Pending {
    /// Tentative local session id, known once the initiation passed
    /// through on its way to the wire.
    pub sessid: Option<u32>,
    /// mac1 of the last initiation we sent, the AAD of a cookie reply.
    pub mac1: [u8; 16],
    pub first_attempt: Instant,
    pub last_request: Instant,
}

/// A cookie received from a loaded responder, applied as mac2 to the
/// next initiation.
pub struct Cookie {
    pub value: [u8; 16],
    pub received: Instant,
}

impl Cookie {
    pub fn valid(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.received) < COOKIE_VALID
    }
}

/// The per-peer slot structure.
#[derive(Default)]
pub struct SessionSet {
    pub pending: Option<Pending>,
    next: Option<Session>,
    curr: Option<Session>,
    prev: Option<Session>,
}

/// Which slot a session id resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Next,
    Curr,
    Prev,
}

impl SessionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install freshly derived keys as the `next` session. Whether we
    /// initiated is decided by matching the tentative session id.
    pub fn install(&mut self, keys: &SessKeys, now: Instant) -> bool {
        let initiator = self
            .pending
            .as_ref()
            .and_then(|p| p.sessid)
            .is_some_and(|id| id == keys.sessid);
        if initiator {
            self.pending = None;
        }
        self.next = Some(Session::new(keys, initiator, now));
        initiator
    }

    /// The session to send on. A `next` we initiated is promoted on its
    /// first outbound use; a `next` where the peer initiated must wait
    /// for the first authenticated inbound packet, which proves the
    /// peer holds the private key, before we transmit on it.
    pub fn send_session(&mut self, now: Instant) -> Option<&mut Session> {
        if self
            .next
            .as_ref()
            .is_some_and(|s| s.initiator && s.usable(now))
        {
            self.promote_next();
        }
        self.curr.as_mut().filter(|s| s.usable(now))
    }

    /// Find a live session by our local id.
    pub fn by_sessid(&mut self, sessid: u32) -> Option<(&mut Session, Slot)> {
        if self.curr.as_ref().is_some_and(|s| s.id == sessid) {
            return self.curr.as_mut().map(|s| (s, Slot::Curr));
        }
        if self.next.as_ref().is_some_and(|s| s.id == sessid) {
            return self.next.as_mut().map(|s| (s, Slot::Next));
        }
        if self.prev.as_ref().is_some_and(|s| s.id == sessid) {
            return self.prev.as_mut().map(|s| (s, Slot::Prev));
        }
        None
    }

    pub fn current(&self) -> Option<&Session> {
        self.curr.as_ref()
    }

    /// Rotate `next` into `curr`. The old `prev` is destroyed and its
    /// keys wiped; the old `curr` takes its place.
    pub fn promote_next(&mut self) {
        if let Some(next) = self.next.take() {
            self.prev = self.curr.take();
            self.curr = Some(next);
        }
    }

    /// Destroy sessions past their lifetime limits.
    pub fn reap(&mut self, now: Instant) {
        for slot in [&mut self.next, &mut self.curr, &mut self.prev] {
            if slot.as_ref().is_some_and(|s| s.expired(now)) {
                *slot = None;
            }
        }
    }

    /// Drop everything, handshake state included.
    pub fn clear(&mut self) {
        self.pending = None;
        self.next = None;
        self.curr = None;
        self.prev = None;
    }

    pub fn has_live_session(&self, now: Instant) -> bool {
        self.curr.as_ref().is_some_and(|s| s.usable(now))
            || self.next.as_ref().is_some_and(|s| s.usable(now))
    }
}

/// Bounded queue of outbound packets waiting for a session; overflow
/// drops the oldest entry.
#[derive(Default)]
pub struct PacketQueue {
    packets: VecDeque<(Vec<u8>, Instant)>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a packet; returns true if an older one was dropped.
    pub fn push(&mut self, packet: Vec<u8>, now: Instant) -> bool {
        let dropped = if self.packets.len() >= QUEUE_CAP {
            self.packets.pop_front();
            true
        } else {
            false
        };
        self.packets.push_back((packet, now));
        dropped
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.packets.pop_front().map(|(p, _)| p)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Age of the oldest queued packet.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.packets
            .front()
            .map(|(_, t)| now.saturating_duration_since(*t))
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(sessid: u32, peersessid: u32, a: u8, b: u8) -> SessKeys {
        SessKeys {
            sessid,
            peersessid,
            sendkey: [a; 32],
            recvkey: [b; 32],
        }
    }

    fn pending(sessid: u32, now: Instant) -> Pending {
        Pending {
            sessid: Some(sessid),
            mac1: [0u8; 16],
            first_attempt: now,
            last_request: now,
        }
    }

    #[test]
    fn initiated_next_promotes_on_first_send() {
        let now = Instant::now();
        let mut set = SessionSet::new();
        set.pending = Some(pending(1, now));

        assert!(set.install(&keys(1, 101, 1, 2), now));
        assert!(set.current().is_none());

        // first outbound use promotes next to curr
        let sess = set.send_session(now).unwrap();
        assert_eq!(sess.id, 1);
        assert_eq!(set.current().unwrap().id, 1);
    }

    #[test]
    fn responder_next_waits_for_inbound_proof() {
        let now = Instant::now();
        let mut set = SessionSet::new();

        // peer-initiated: no pending of ours matches
        assert!(!set.install(&keys(5, 105, 1, 2), now));

        // we must not transmit on it yet
        assert!(set.send_session(now).is_none());

        // the first authenticated inbound packet promotes it
        set.promote_next();
        assert_eq!(set.send_session(now).unwrap().id, 5);
    }

    #[test]
    fn initiator_flag_follows_the_pending_sessid() {
        let now = Instant::now();
        let mut set = SessionSet::new();
        set.pending = Some(pending(7, now));

        assert!(set.install(&keys(7, 8, 1, 2), now));
        assert!(set.pending.is_none());
        assert!(set.send_session(now).unwrap().initiator);
    }

    #[test]
    fn rotation_keeps_previous_for_in_flight_packets() {
        let now = Instant::now();
        let mut set = SessionSet::new();

        set.pending = Some(pending(1, now));
        set.install(&keys(1, 101, 1, 2), now);
        set.send_session(now);
        set.pending = Some(pending(2, now));
        set.install(&keys(2, 102, 3, 4), now);
        set.send_session(now);

        assert_eq!(set.current().unwrap().id, 2);
        let (prev, slot) = set.by_sessid(1).unwrap();
        assert_eq!(prev.id, 1);
        assert_eq!(slot, Slot::Prev);

        // one more rotation destroys session 1
        set.pending = Some(pending(3, now));
        set.install(&keys(3, 103, 5, 6), now);
        set.send_session(now);
        assert!(set.by_sessid(1).is_none());
    }

    #[test]
    fn transport_roundtrip_with_replay_protection() {
        let now = Instant::now();
        let mut alice = SessionSet::new();
        let mut bob = SessionSet::new();

        // alice initiated; the directional keys mirror
        alice.pending = Some(pending(10, now));
        alice.install(&keys(10, 20, 0xAA, 0xBB), now);
        bob.install(&keys(20, 10, 0xBB, 0xAA), now);

        let a = alice.send_session(now).unwrap();
        let msg = a.seal_packet(b"hello tunnel", now).unwrap();

        let hdr = DataHeader::from_bytes(&msg).unwrap();
        assert_eq!(hdr.receiver, 20);

        let (b, _) = bob.by_sessid(20).unwrap();
        let (counter, plain) = b.open_packet(&msg).unwrap();
        assert_eq!(&plain[..12], b"hello tunnel");
        assert_eq!(plain.len(), 16); // padded
        b.commit_counter(counter);

        // replaying the same message is rejected
        assert!(matches!(
            b.open_packet(&msg),
            Err(ProtocolError::ReplayDetected { .. })
        ));
    }

    #[test]
    fn rekey_wanted_by_message_count() {
        let now = Instant::now();
        let mut set = SessionSet::new();
        set.pending = Some(pending(1, now));
        set.install(&keys(1, 2, 1, 2), now);
        let sess = set.send_session(now).unwrap();

        assert!(!sess.wants_rekey(now));
        sess.send_counter = REKEY_AFTER_MESSAGES;
        assert!(sess.wants_rekey(now));
    }

    #[test]
    fn rekey_wanted_by_age_only_for_initiators() {
        let now = Instant::now();
        let later = now + REKEY_AFTER_TIME + Duration::from_secs(1);

        let mut set = SessionSet::new();
        set.pending = Some(pending(1, now));
        set.install(&keys(1, 2, 1, 2), now);
        let sess = set.send_session(now).unwrap();
        assert!(sess.initiator);
        assert!(sess.wants_rekey(later));

        // the responder side ages out passively
        let mut set = SessionSet::new();
        set.install(&keys(3, 4, 1, 2), now);
        set.promote_next();
        let sess = set.send_session(now).unwrap();
        assert!(!sess.initiator);
        assert!(!sess.wants_rekey(later));
    }

    #[test]
    fn sessions_expire_and_reap() {
        let now = Instant::now();
        let past_reject = now + REJECT_AFTER_TIME + Duration::from_secs(1);

        let mut set = SessionSet::new();
        set.pending = Some(pending(1, now));
        set.install(&keys(1, 2, 1, 2), now);
        set.send_session(now);

        assert!(set.current().unwrap().usable(now));
        assert!(!set.current().unwrap().usable(past_reject));

        set.reap(past_reject);
        assert!(set.current().is_none());
    }

    #[test]
    fn unanswered_sends_hit_the_deadline() {
        let now = Instant::now();
        let mut set = SessionSet::new();
        set.pending = Some(pending(1, now));
        set.install(&keys(1, 2, 1, 2), now);
        let sess = set.send_session(now).unwrap();

        sess.seal_packet(b"data", now).unwrap();
        let deadline = sess.deadline.unwrap();
        assert!(!sess.usable(deadline + Duration::from_secs(1)));

        // hearing back clears it
        sess.commit_counter(1);
        assert!(sess.deadline.is_none());
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let now = Instant::now();
        let mut q = PacketQueue::new();

        for i in 0..QUEUE_CAP {
            assert!(!q.push(vec![i as u8], now));
        }
        assert_eq!(q.len(), QUEUE_CAP);

        assert!(q.push(vec![0xFF], now));
        assert_eq!(q.len(), QUEUE_CAP);
        // the oldest entry is gone
        assert_eq!(q.pop().unwrap(), vec![1u8]);
    }

    #[test]
    fn cookie_expires() {
        let now = Instant::now();
        let cookie = Cookie {
            value: [1u8; 16],
            received: now,
        };
        assert!(cookie.valid(now + Duration::from_secs(119)));
        assert!(!cookie.valid(now + COOKIE_VALID));
    }
}
