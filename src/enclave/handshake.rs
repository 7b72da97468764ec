//! Noise IKpsk2 handshake engine
//!
//! Runs only inside the enclave. Holds each interface's static private
//! key, every peer's precomputed static-static DH secret and PSK, and
//! the single outstanding initiator slot per peer.
//!
//! Responding to an initiation is a pure transaction: the responder
//! state lives on the stack of [`respond`] and is gone when it returns,
//! so an outstanding initiation of our own survives a crossed handshake
//! and both sides can complete.

use std::net::SocketAddr;

use rand::Rng;
use zeroize::Zeroizing;

use crate::crypto::{aead, blake2s, noise, x25519, SecretKey};
use crate::error::ProtocolError;
use crate::wire::ipc::SessKeys;
use crate::wire::wg::{Initiation, Response};

/// Outstanding initiator handshake, at most one per peer. A fresh
/// `ReqWgInit` supersedes any previous slot.
pub struct HsSlot {
    pub sessid: u32,
    epriv: SecretKey,
    st: noise::SymmetricState,
}

/// A configured peer as the enclave sees it.
pub struct Peer {
    pub id: u32,
    pub pubkey: [u8; 32],
    pubkeyhash: [u8; 32],
    mac1key: [u8; 32],
    dhsecret: SecretKey,
    psk: SecretKey,
    pub endpoint: Option<SocketAddr>,
    pub hs: Option<HsSlot>,
    /// Last authenticated TAI64N timestamp; replays must exceed it.
    recvts: [u8; 12],
}

/// A configured interface as the enclave sees it.
pub struct Interface {
    pub id: u32,
    pub name: String,
    privkey: SecretKey,
    pub pubkey: [u8; 32],
    pubkeyhash: [u8; 32],
    pub mac1key: [u8; 32],
    pub peers: Vec<Peer>,
}

impl Interface {
    /// Derive the public key and the protocol hashes from the private
    /// key; the master sends the same values and the results must agree.
    pub fn new(id: u32, name: String, privkey: SecretKey) -> Self {
        let pubkey = privkey.public_key();
        Self {
            id,
            name,
            privkey,
            pubkey,
            pubkeyhash: noise::pubkey_hash(&pubkey),
            mac1key: noise::mac1_key(&pubkey),
            peers: Vec::new(),
        }
    }

    /// Register a peer, precomputing its hashes and the static-static
    /// DH secret.
    pub fn add_peer(&mut self, pubkey: [u8; 32], psk: SecretKey, endpoint: Option<SocketAddr>) {
        let id = self.peers.len() as u32;
        self.peers.push(Peer {
            id,
            pubkey,
            pubkeyhash: noise::pubkey_hash(&pubkey),
            mac1key: noise::mac1_key(&pubkey),
            dhsecret: self.privkey.dh(&pubkey),
            psk,
            endpoint,
            hs: None,
            recvts: [0u8; 12],
        });
    }

    pub fn peer(&self, peerid: u32) -> Option<&Peer> {
        self.peers.get(peerid as usize)
    }

    fn peer_index_by_pubkey(&self, pubkey: &[u8]) -> Option<usize> {
        self.peers.iter().position(|p| p.pubkey[..] == *pubkey)
    }

    fn peer_index_by_sessid(&self, sessid: u32) -> Option<usize> {
        self.peers
            .iter()
            .position(|p| p.hs.as_ref().is_some_and(|hs| hs.sessid == sessid))
    }
}

fn fresh_sessid() -> u32 {
    rand::thread_rng().gen()
}

/// Build a handshake initiation towards `peerid` and store the
/// initiator slot. `ts` is the TAI64N timestamp to seal; the peer
/// rejects anything not newer than what it last accepted from us.
pub fn initiate(
    ifn: &mut Interface,
    peerid: u32,
    ts: [u8; 12],
) -> Result<Initiation, ProtocolError> {
    let ifn_pubkey = ifn.pubkey;
    let peer = ifn
        .peers
        .get_mut(peerid as usize)
        .ok_or(ProtocolError::UnknownPeer)?;

    let sessid = fresh_sessid();
    let (epriv, epub) = x25519::keypair();
    let epriv = SecretKey::from_bytes(epriv);

    let mut st = noise::SymmetricState::new(&peer.pubkey);
    st.mix_hash(&epub);
    st.mix_chain(&epub);

    let es = Zeroizing::new(x25519::dh(epriv.expose(), &peer.pubkey));
    let k = Zeroizing::new(st.mix_key(&*es));
    let sealed_static = st
        .seal_and_hash(&k, &ifn_pubkey)
        .map_err(|_| ProtocolError::Unauthenticated)?;

    let k = Zeroizing::new(st.mix_key(peer.dhsecret.expose()));
    let sealed_timestamp = st
        .seal_and_hash(&k, &ts)
        .map_err(|_| ProtocolError::Unauthenticated)?;

    let mut msg = Initiation {
        sender: sessid,
        ephemeral: epub,
        sealed_static: sealed_static
            .try_into()
            .expect("static field is 48 bytes"),
        sealed_timestamp: sealed_timestamp
            .try_into()
            .expect("timestamp field is 28 bytes"),
        mac1: [0u8; 16],
        mac2: [0u8; 16],
    };
    msg.mac1 = blake2s::mac(&peer.mac1key, &msg.to_bytes()[..Initiation::MAC1_OFFSET]);
    // mac2 stays zero; cookies are applied outside the enclave

    peer.hs = Some(HsSlot { sessid, epriv, st });
    Ok(msg)
}

/// Validate an initiation, identify (or verify) the peer and produce
/// the response plus the responder-side session keys.
///
/// `pinned` is the peer the packet's connected socket belongs to, if
/// any; a decrypted identity that disagrees with the pin is rejected.
pub fn respond(
    ifn: &mut Interface,
    msg: &Initiation,
    pinned: Option<u32>,
) -> Result<(u32, Response, SessKeys), ProtocolError> {
    let bytes = msg.to_bytes();
    if !blake2s::valid_mac(&msg.mac1, &ifn.mac1key, &bytes[..Initiation::MAC1_OFFSET]) {
        return Err(ProtocolError::MacVerificationFailed);
    }

    let mut st = noise::SymmetricState::new(&ifn.pubkey);
    debug_assert_eq!(st.h, ifn.pubkeyhash);
    st.mix_hash(&msg.ephemeral);
    st.mix_chain(&msg.ephemeral);

    let es = Zeroizing::new(x25519::dh(ifn.privkey.expose(), &msg.ephemeral));
    let k = Zeroizing::new(st.mix_key(&*es));
    let stat = st
        .open_and_hash(&k, &msg.sealed_static)
        .map_err(|_| ProtocolError::Unauthenticated)?;

    let idx = ifn
        .peer_index_by_pubkey(&stat)
        .ok_or(ProtocolError::UnknownPeer)?;
    if let Some(pinned) = pinned {
        if pinned as usize != idx {
            return Err(ProtocolError::PeerMismatch);
        }
    }
    let peer = &mut ifn.peers[idx];

    let k = Zeroizing::new(st.mix_key(peer.dhsecret.expose()));
    let ts = st
        .open_and_hash(&k, &msg.sealed_timestamp)
        .map_err(|_| ProtocolError::Unauthenticated)?;
    let ts: [u8; 12] = ts.try_into().expect("timestamp is 12 bytes");

    // TAI64N is big-endian, so byte order is time order
    if ts <= peer.recvts {
        return Err(ProtocolError::ReplayedTimestamp);
    }
    peer.recvts = ts;

    let sessid = fresh_sessid();
    let (epriv, epub) = x25519::keypair();
    let epriv = Zeroizing::new(epriv);

    st.mix_chain(&epub);
    st.mix_hash(&epub);

    let ee = Zeroizing::new(x25519::dh(&epriv, &msg.ephemeral));
    st.mix_chain(&*ee);
    let se = Zeroizing::new(x25519::dh(&epriv, &peer.pubkey));
    st.mix_chain(&*se);

    let k = Zeroizing::new(st.mix_psk(peer.psk.expose()));
    // the sealed empty payload is not hashed back in; the transcript
    // ends here
    let sealed_empty = aead::seal(&k, 0, &[], &st.h).map_err(|_| ProtocolError::Unauthenticated)?;

    let mut resp = Response {
        sender: sessid,
        receiver: msg.sender,
        ephemeral: epub,
        sealed_empty: sealed_empty.try_into().expect("empty field is 16 bytes"),
        mac1: [0u8; 16],
        mac2: [0u8; 16],
    };
    resp.mac1 = blake2s::mac(&peer.mac1key, &resp.to_bytes()[..Response::MAC1_OFFSET]);

    let (sendkey, recvkey) = noise::transport_keys(&st.c, true);
    let keys = SessKeys {
        sessid,
        peersessid: msg.sender,
        sendkey,
        recvkey,
    };

    Ok((idx as u32, resp, keys))
}

/// Validate a response against the outstanding initiation it answers
/// and derive the initiator-side session keys. The slot is consumed on
/// success and kept on failure, so a forged response cannot cancel a
/// handshake in flight.
pub fn absorb_response(
    ifn: &mut Interface,
    msg: &Response,
    pinned: Option<u32>,
) -> Result<(u32, SessKeys), ProtocolError> {
    let bytes = msg.to_bytes();
    if !blake2s::valid_mac(&msg.mac1, &ifn.mac1key, &bytes[..Response::MAC1_OFFSET]) {
        return Err(ProtocolError::MacVerificationFailed);
    }

    // commonly fails right after local session rotation; just drop
    let idx = ifn
        .peer_index_by_sessid(msg.receiver)
        .ok_or(ProtocolError::UnknownSession {
            sessid: msg.receiver,
        })?;
    if let Some(pinned) = pinned {
        if pinned as usize != idx {
            return Err(ProtocolError::PeerMismatch);
        }
    }

    let se = Zeroizing::new(x25519::dh(ifn.privkey.expose(), &msg.ephemeral));
    let peer = &mut ifn.peers[idx];
    let hs = peer.hs.as_ref().expect("slot exists by sessid lookup");

    let mut st = hs.st.clone();
    st.mix_chain(&msg.ephemeral);
    st.mix_hash(&msg.ephemeral);

    let ee = Zeroizing::new(x25519::dh(hs.epriv.expose(), &msg.ephemeral));
    st.mix_chain(&*ee);
    st.mix_chain(&*se);

    let k = Zeroizing::new(st.mix_psk(peer.psk.expose()));
    aead::open(&k, 0, &msg.sealed_empty, &st.h).map_err(|_| ProtocolError::Unauthenticated)?;

    let sessid = hs.sessid;
    peer.hs = None;

    let (sendkey, recvkey) = noise::transport_keys(&st.c, false);
    let keys = SessKeys {
        sessid,
        peersessid: msg.sender,
        sendkey,
        recvkey,
    };

    Ok((idx as u32, keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timestamp(n: u8) -> [u8; 12] {
        let mut ts = [0u8; 12];
        ts[0] = 0x40; // TAI64 epoch bit
        ts[11] = n;
        ts
    }

    /// Two interfaces configured as each other's peer 0.
    fn pair(psk_a: SecretKey, psk_b: SecretKey) -> (Interface, Interface) {
        let a_key = SecretKey::generate();
        let b_key = SecretKey::generate();
        let a_pub = a_key.public_key();
        let b_pub = b_key.public_key();

        let mut a = Interface::new(0, "tun0".into(), a_key);
        a.add_peer(b_pub, psk_a, None);
        let mut b = Interface::new(0, "tun0".into(), b_key);
        b.add_peer(a_pub, psk_b, None);
        (a, b)
    }

    #[test]
    fn full_handshake_derives_matching_keys() {
        let (mut a, mut b) = pair(SecretKey::zero(), SecretKey::zero());

        let init = initiate(&mut a, 0, timestamp(1)).unwrap();
        assert_eq!(init.to_bytes().len(), Initiation::SIZE);

        let (peerid, resp, rkeys) = respond(&mut b, &init, None).unwrap();
        assert_eq!(peerid, 0);
        assert_eq!(resp.receiver, init.sender);

        let (peerid, ikeys) = absorb_response(&mut a, &resp, None).unwrap();
        assert_eq!(peerid, 0);

        // directional keys cross over
        assert_eq!(ikeys.sendkey, rkeys.recvkey);
        assert_eq!(ikeys.recvkey, rkeys.sendkey);
        assert_eq!(ikeys.peersessid, rkeys.sessid);
        assert_eq!(rkeys.peersessid, ikeys.sessid);

        // a user payload travels bit-identically
        let payload = [0x42u8; 100];
        let sealed = aead::seal(&ikeys.sendkey, 0, &payload, &[]).unwrap();
        let opened = aead::open(&rkeys.recvkey, 0, &sealed, &[]).unwrap();
        assert_eq!(opened, payload);

        // the initiator slot is consumed
        assert!(a.peers[0].hs.is_none());
    }

    #[test]
    fn psk_mismatch_fails_on_the_initiator() {
        let (mut a, mut b) = pair(SecretKey::zero(), SecretKey::from_bytes([0x55; 32]));

        let init = initiate(&mut a, 0, timestamp(1)).unwrap();
        // the responder cannot detect the mismatch on the initiation
        let (_, resp, _) = respond(&mut b, &init, None).unwrap();

        // the response's sealed empty payload fails to open
        let err = absorb_response(&mut a, &resp, None).unwrap_err();
        assert!(matches!(err, ProtocolError::Unauthenticated));

        // slot survives for a retry after the rekey timeout
        assert!(a.peers[0].hs.is_some());
    }

    #[test]
    fn replayed_initiation_is_rejected_without_state_change() {
        let (mut a, mut b) = pair(SecretKey::zero(), SecretKey::zero());

        let init = initiate(&mut a, 0, timestamp(3)).unwrap();
        respond(&mut b, &init, None).unwrap();
        let recvts = b.peers[0].recvts;

        let err = respond(&mut b, &init, None).unwrap_err();
        assert!(matches!(err, ProtocolError::ReplayedTimestamp));
        assert_eq!(b.peers[0].recvts, recvts);

        // an older timestamp from a fresh handshake is also a replay
        let init = initiate(&mut a, 0, timestamp(2)).unwrap();
        let err = respond(&mut b, &init, None).unwrap_err();
        assert!(matches!(err, ProtocolError::ReplayedTimestamp));
    }

    #[test]
    fn invalid_mac1_is_rejected() {
        let (mut a, mut b) = pair(SecretKey::zero(), SecretKey::zero());

        let mut init = initiate(&mut a, 0, timestamp(1)).unwrap();
        init.mac1[0] ^= 1;
        let err = respond(&mut b, &init, None).unwrap_err();
        assert!(matches!(err, ProtocolError::MacVerificationFailed));
    }

    #[test]
    fn pinned_flow_rejects_a_different_peer_identity() {
        // b knows two peers: a (peer 0) and c (peer 1)
        let a_key = SecretKey::generate();
        let c_key = SecretKey::generate();
        let b_key = SecretKey::generate();
        let b_pub = b_key.public_key();

        let mut a = Interface::new(0, "tun0".into(), a_key);
        a.add_peer(b_pub, SecretKey::zero(), None);

        let mut b = Interface::new(0, "tun0".into(), b_key);
        b.add_peer(a.pubkey, SecretKey::zero(), None);
        b.add_peer(c_key.public_key(), SecretKey::zero(), None);

        let init = initiate(&mut a, 0, timestamp(1)).unwrap();

        // a's initiation arriving on c's pinned socket must not pass
        let err = respond(&mut b, &init, Some(1)).unwrap_err();
        assert!(matches!(err, ProtocolError::PeerMismatch));

        // on its own pin it does
        assert!(respond(&mut b, &init, Some(0)).is_ok());
    }

    #[test]
    fn crossed_handshakes_both_complete() {
        let (mut a, mut b) = pair(SecretKey::zero(), SecretKey::zero());

        // both sides initiate within the same event turn
        let init_a = initiate(&mut a, 0, timestamp(1)).unwrap();
        let init_b = initiate(&mut b, 0, timestamp(1)).unwrap();

        // each side answers the other's initiation
        let (_, resp_b, keys_b_resp) = respond(&mut b, &init_a, None).unwrap();
        let (_, resp_a, keys_a_resp) = respond(&mut a, &init_b, None).unwrap();

        // both responses still find their initiator slots
        let (_, keys_a_init) = absorb_response(&mut a, &resp_b, None).unwrap();
        let (_, keys_b_init) = absorb_response(&mut b, &resp_a, None).unwrap();

        assert_eq!(keys_a_init.sendkey, keys_b_resp.recvkey);
        assert_eq!(keys_b_init.sendkey, keys_a_resp.recvkey);
    }

    #[test]
    fn response_with_unknown_receiver_is_dropped() {
        let (mut a, mut b) = pair(SecretKey::zero(), SecretKey::zero());

        let init = initiate(&mut a, 0, timestamp(1)).unwrap();
        let (_, mut resp, _) = respond(&mut b, &init, None).unwrap();

        // simulate local rotation: the slot is gone
        a.peers[0].hs = None;
        resp.mac1 = blake2s::mac(
            &noise::mac1_key(&a.pubkey),
            &resp.to_bytes()[..Response::MAC1_OFFSET],
        );
        let err = absorb_response(&mut a, &resp, None).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownSession { .. }));
    }

    #[test]
    fn a_new_initiation_supersedes_the_old_slot() {
        let (mut a, mut b) = pair(SecretKey::zero(), SecretKey::zero());

        let stale = initiate(&mut a, 0, timestamp(1)).unwrap();
        let fresh = initiate(&mut a, 0, timestamp(2)).unwrap();
        assert_ne!(stale.sender, fresh.sender);

        // the stale response no longer matches the slot, the fresh does
        let (_, resp_stale, _) = respond(&mut b, &stale, None).unwrap();
        let err = absorb_response(&mut a, &resp_stale, None).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownSession { .. }));

        let (_, resp_fresh, _) = respond(&mut b, &fresh, None).unwrap();
        assert!(absorb_response(&mut a, &resp_fresh, None).is_ok());
    }
}
