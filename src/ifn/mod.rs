//! Interface worker process
//!
//! One per tunnel device. Owns the tun descriptor, the per-peer session
//! cache and the allowed-IP table. Encrypts packets leaving the device,
//! decrypts transport data arriving on pinned sockets, and asks the
//! enclave for a handshake whenever the rekey policy says so. It never
//! creates sockets: pinned flow sockets arrive from the proxy over
//! `SCM_RIGHTS`, and it never holds a long-term secret.

pub mod replay;
pub mod router;
pub mod session;

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{OwnedFd, RawFd};
use std::task::Poll;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tun_rs::AsyncDevice;

use crate::crypto::{aead, blake2s};
use crate::error::{IpcError, ProtocolError, Result, TunnelError};
use crate::privsep;
use crate::wire::ipc::{
    frame_peer, parse_peer, parse_proxy, AsyncIpc, ConnReq, IpcChannel, SCRATCH,
};
use crate::wire::startup::{SCidrAddr, SIfn, SInit, SPeer};
use crate::wire::wg::{CookieReply, DataHeader, Initiation, Response};
use crate::wire::MsgType;
use router::AllowedIps;
use session::{
    Cookie, PacketQueue, Pending, SessionSet, Slot, KEEPALIVE_TIMEOUT, REJECT_AFTER_TIME,
    REKEY_ATTEMPT_TIME, REKEY_TIMEOUT,
};

/// Tunnel MTU; headroom for the transport header, tag and padding.
const TUN_MTU: usize = 1420;

/// Scratch for one tunnel or UDP packet.
const PKT_SCRATCH: usize = 2048;

#[derive(Default)]
struct Stats {
    dev_in: u64,
    dev_in_err: u64,
    dev_out: u64,
    dev_out_err: u64,
    sock_in: u64,
    sock_out: u64,
    sock_out_err: u64,
    queue_in: u64,
    queue_out: u64,
    queue_drop: u64,
    init_in: u64,
    init_out: u64,
    resp_in: u64,
    resp_out: u64,
    keepalive_out: u64,
    corrupted: u64,
    invalid_mac: u64,
    invalid_peer: u64,
    replayed: u64,
}

struct PeerState {
    id: u32,
    name: String,
    /// hash(label-cookie || peer static pub), precomputed by the master
    /// so the public key itself never reaches this process.
    cookie_key: [u8; 32],
    /// Pinned connected socket, handed over by the proxy.
    sock: Option<UdpSocket>,
    sessions: SessionSet,
    queue: PacketQueue,
    /// Outbound handshake frames waiting for a pinned socket.
    pending_tx: VecDeque<Vec<u8>>,
    cookie: Option<Cookie>,
}

struct IfnWorker {
    id: u32,
    name: String,
    mac1key: [u8; 32],
    tun: AsyncDevice,
    encl: AsyncIpc,
    prox: AsyncIpc,
    peers: Vec<PeerState>,
    router: AllowedIps,
    ifaddrs: Vec<IpNet>,
    stats: Stats,
}

struct PeerConfig {
    name: String,
    cookie_key: [u8; 32],
    allowed_ips: Vec<IpNet>,
}

struct StartupState {
    uid: u32,
    gid: u32,
    verbose: i32,
    enclport: RawFd,
    proxport: RawFd,
    ifnid: u32,
    ifname: String,
    mac1key: [u8; 32],
    ifaddrs: Vec<IpNet>,
    peers: Vec<PeerConfig>,
}

/// Child entry point for `-I <fd>`.
pub fn run(masterport: RawFd) -> Result<()> {
    let master = unsafe { IpcChannel::from_raw_fd(masterport) };
    let state = recv_config(&master)?;

    privsep::init_logging(&format!("ifn {}", state.ifname), state.verbose);
    tracing::info!(peers = state.peers.len(), "configuration received");

    // stdio + master + enclave + proxy; checked before the tun device
    // and the runtime open further descriptors
    privsep::expect_open_fds(3 + 3)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(IpcError::from)?;

    runtime.block_on(async move {
        // the device must exist before privileges go away
        let tun = tun_rs::DeviceBuilder::new()
            .name(state.ifname.as_str())
            .mtu(TUN_MTU as u16)
            .build_async()
            .map_err(|e| TunnelError::OpenFailed {
                name: state.ifname.clone(),
                reason: e.to_string(),
            })?;

        privsep::limit_resources(state.peers.len())?;
        privsep::chroot_empty()?;
        privsep::drop_privileges(state.uid, state.gid)?;

        let mut router = AllowedIps::new();
        let mut peers = Vec::with_capacity(state.peers.len());
        for (id, cfg) in state.peers.into_iter().enumerate() {
            for net in &cfg.allowed_ips {
                router.insert(*net, id as u32);
            }
            peers.push(PeerState {
                id: id as u32,
                name: cfg.name,
                cookie_key: cfg.cookie_key,
                sock: None,
                sessions: SessionSet::new(),
                queue: PacketQueue::new(),
                pending_tx: VecDeque::new(),
                cookie: None,
            });
        }

        let mut worker = IfnWorker {
            id: state.ifnid,
            name: state.ifname,
            mac1key: state.mac1key,
            tun,
            encl: AsyncIpc::new(unsafe { IpcChannel::from_raw_fd(state.enclport) })?,
            prox: AsyncIpc::new(unsafe { IpcChannel::from_raw_fd(state.proxport) })?,
            peers,
            router,
            ifaddrs: state.ifaddrs,
            stats: Stats::default(),
        };
        worker.serv().await
    })
}

fn recv_config(master: &IpcChannel) -> Result<StartupState> {
    let mut buf = [0u8; SCRATCH];

    let (mt, payload) = master.recv_plain(&mut buf)?;
    if mt != MsgType::SInit {
        return Err(IpcError::StartupOrder { expected: "SInit" }.into());
    }
    let sinit = SInit::from_bytes(payload)?;
    if sinit.nifns != 1 {
        return Err(IpcError::StartupOrder {
            expected: "exactly one SIfn",
        }
        .into());
    }

    let (mt, payload) = master.recv_plain(&mut buf)?;
    if mt != MsgType::SIfn {
        return Err(IpcError::StartupOrder { expected: "SIfn" }.into());
    }
    let sifn = SIfn::from_bytes(payload)?;

    let mut ifaddrs = Vec::with_capacity(sifn.nifaddrs as usize);
    for _ in 0..sifn.nifaddrs {
        let (mt, payload) = master.recv_plain(&mut buf)?;
        if mt != MsgType::SCidrAddr {
            return Err(IpcError::StartupOrder {
                expected: "SCidrAddr",
            }
            .into());
        }
        let ca = SCidrAddr::from_bytes(payload)?;
        ifaddrs.push(cidr_to_net(&ca)?);
    }

    // listen addresses are bound by the proxy; recorded only for the
    // statistics dump
    for _ in 0..sifn.nlistenaddrs {
        let (mt, _) = master.recv_plain(&mut buf)?;
        if mt != MsgType::SCidrAddr {
            return Err(IpcError::StartupOrder {
                expected: "SCidrAddr",
            }
            .into());
        }
    }

    let mut peers = Vec::with_capacity(sifn.npeers as usize);
    for m in 0..sifn.npeers {
        let (mt, payload) = master.recv_plain(&mut buf)?;
        if mt != MsgType::SPeer {
            return Err(IpcError::StartupOrder { expected: "SPeer" }.into());
        }
        let speer = SPeer::from_bytes(payload)?;
        if speer.peerid != m {
            return Err(IpcError::UnknownPeerId { peerid: speer.peerid }.into());
        }

        let mut allowed_ips = Vec::with_capacity(speer.nallowedips as usize);
        for _ in 0..speer.nallowedips {
            let (mt, payload) = master.recv_plain(&mut buf)?;
            if mt != MsgType::SCidrAddr {
                return Err(IpcError::StartupOrder {
                    expected: "SCidrAddr",
                }
                .into());
            }
            let ca = SCidrAddr::from_bytes(payload)?;
            allowed_ips.push(cidr_to_net(&ca)?);
        }

        peers.push(PeerConfig {
            name: speer.name.clone(),
            cookie_key: speer.cookiekey,
            allowed_ips,
        });
    }

    let (mt, _) = master.recv_plain(&mut buf)?;
    if mt != MsgType::SEos {
        return Err(IpcError::StartupOrder { expected: "SEos" }.into());
    }

    Ok(StartupState {
        uid: sinit.uid,
        gid: sinit.gid,
        verbose: sinit.verbose,
        enclport: sinit.enclport,
        proxport: sinit.proxport,
        ifnid: sifn.ifnid,
        ifname: sifn.ifname.clone(),
        mac1key: sifn.mac1key,
        ifaddrs,
        peers,
    })
}

fn cidr_to_net(ca: &SCidrAddr) -> Result<IpNet> {
    IpNet::new(ca.addr.ip(), ca.prefixlen)
        .map_err(|_| {
            IpcError::StartupOrder {
                expected: "valid prefix length",
            }
            .into()
        })
}

/// Destination address of a raw IP packet leaving the tunnel device.
fn ip_dst(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::from(
            <[u8; 4]>::try_from(&packet[16..20]).ok()?,
        ))),
        6 if packet.len() >= 40 => Some(IpAddr::V6(Ipv6Addr::from(
            <[u8; 16]>::try_from(&packet[24..40]).ok()?,
        ))),
        _ => None,
    }
}

/// Source address of a decrypted inner IP packet.
fn ip_src(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::from(
            <[u8; 4]>::try_from(&packet[12..16]).ok()?,
        ))),
        6 if packet.len() >= 40 => Some(IpAddr::V6(Ipv6Addr::from(
            <[u8; 16]>::try_from(&packet[8..24]).ok()?,
        ))),
        _ => None,
    }
}

enum Event {
    Encl(usize),
    Prox(usize, Option<OwnedFd>),
    Tun(usize),
    Sock(usize, std::io::Result<usize>),
    Tick,
    Stats,
    Terminate,
}

fn poll_peer_socks(
    peers: &[PeerState],
    cx: &mut std::task::Context<'_>,
    buf: &mut [u8],
) -> Poll<(usize, std::io::Result<usize>)> {
    for (i, peer) in peers.iter().enumerate() {
        if let Some(sock) = &peer.sock {
            let mut rb = ReadBuf::new(buf);
            match sock.poll_recv(cx, &mut rb) {
                Poll::Ready(Ok(())) => return Poll::Ready((i, Ok(rb.filled().len()))),
                Poll::Ready(Err(e)) => return Poll::Ready((i, Err(e))),
                Poll::Pending => {}
            }
        }
    }
    Poll::Pending
}

impl IfnWorker {
    async fn serv(&mut self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate()).map_err(IpcError::from)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(IpcError::from)?;
        let mut sigusr1 = signal(SignalKind::user_defined1()).map_err(IpcError::from)?;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut ebuf = vec![0u8; SCRATCH];
        let mut pbuf = vec![0u8; SCRATCH];
        let mut tbuf = vec![0u8; PKT_SCRATCH];
        let mut sbuf = vec![0u8; PKT_SCRATCH];

        loop {
            let event = {
                let encl = &self.encl;
                let prox = &self.prox;
                let tun = &self.tun;
                let peers = &self.peers;
                tokio::select! {
                    _ = sigterm.recv() => Event::Terminate,
                    _ = sigint.recv() => Event::Terminate,
                    _ = sigusr1.recv() => Event::Stats,
                    _ = ticker.tick() => Event::Tick,
                    r = encl.recv(&mut ebuf) => {
                        let (n, _) = r.map_err(IpcError::from)?;
                        Event::Encl(n)
                    }
                    r = prox.recv(&mut pbuf) => {
                        let (n, fd) = r.map_err(IpcError::from)?;
                        Event::Prox(n, fd)
                    }
                    r = tun.recv(&mut tbuf) => {
                        match r {
                            Ok(n) => Event::Tun(n),
                            Err(e) => {
                                return Err(TunnelError::ReadFailed {
                                    reason: e.to_string(),
                                }
                                .into())
                            }
                        }
                    }
                    r = std::future::poll_fn(|cx| poll_peer_socks(peers, cx, &mut sbuf)) => {
                        let (i, result) = r;
                        Event::Sock(i, result)
                    }
                }
            };

            match event {
                Event::Terminate => {
                    tracing::info!("received termination signal, shutting down");
                    return Ok(());
                }
                Event::Stats => self.log_stats(),
                Event::Tick => self.handle_tick(Instant::now()).await?,
                Event::Encl(n) => {
                    let datagram = ebuf[..n].to_vec();
                    let result = self.handle_enclave_msg(&datagram).await;
                    self.contain(result)?;
                }
                Event::Prox(n, fd) => {
                    let datagram = pbuf[..n].to_vec();
                    let result = self.handle_proxy_msg(&datagram, fd).await;
                    self.contain(result)?;
                }
                Event::Tun(n) => {
                    let packet = tbuf[..n].to_vec();
                    let result = self.handle_tun_packet(&packet).await;
                    self.contain(result)?;
                }
                Event::Sock(i, Ok(n)) => {
                    let packet = sbuf[..n].to_vec();
                    let result = self.handle_sock_packet(i, &packet).await;
                    self.contain(result)?;
                }
                Event::Sock(i, Err(e)) => {
                    // transient; the flow socket stays, the proxy may
                    // also re-pin it
                    tracing::debug!(peer = i, %e, "socket receive error");
                }
            }
        }
    }

    /// Contain untrusted-input failures, propagate everything else.
    fn contain(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_droppable() => {
                tracing::warn!(%err, "dropped packet");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn log_stats(&self) {
        let s = &self.stats;
        tracing::warn!(
            dev_in = s.dev_in,
            dev_out = s.dev_out,
            dev_err = s.dev_in_err + s.dev_out_err,
            sock_in = s.sock_in,
            sock_out = s.sock_out,
            sock_out_err = s.sock_out_err,
            queue = %format_args!("{}/{}/{}", s.queue_in, s.queue_out, s.queue_drop),
            init = %format_args!("{}/{}", s.init_in, s.init_out),
            resp = %format_args!("{}/{}", s.resp_in, s.resp_out),
            keepalive_out = s.keepalive_out,
            corrupted = s.corrupted,
            invalid_mac = s.invalid_mac,
            invalid_peer = s.invalid_peer,
            replayed = s.replayed,
            "statistics"
        );
        for peer in &self.peers {
            tracing::warn!(
                id = peer.id,
                peer = %peer.name,
                connected = peer.sock.is_some(),
                queued = peer.queue.len(),
                curr = peer.sessions.current().map(|s| s.id),
                "peer"
            );
        }
        tracing::warn!(ifn = %self.name, addrs = ?self.ifaddrs, "interface");
    }

    /// A packet read from the tunnel device: route, encrypt, send.
    async fn handle_tun_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.stats.dev_in += 1;
        let now = Instant::now();

        let Some(dst) = ip_dst(packet) else {
            self.stats.dev_in_err += 1;
            return Err(ProtocolError::NoRoute.into());
        };
        let Some(peerid) = self.router.lookup(dst) else {
            self.stats.dev_in_err += 1;
            tracing::debug!(%dst, "no route to destination");
            return Ok(());
        };

        let i = peerid as usize;
        let has_sock = self.peers[i].sock.is_some();
        let mut want_handshake = false;
        let mut rekey = false;

        if has_sock {
            let peer = &mut self.peers[i];
            if let Some(sess) = peer.sessions.send_session(now) {
                match sess.seal_packet(packet, now) {
                    Ok(msg) => {
                        rekey = sess.wants_rekey(now);
                        let sock = peer.sock.as_ref().expect("checked above");
                        match sock.send(&msg).await {
                            Ok(_) => {
                                self.stats.sock_out += 1;
                                self.stats.dev_out += 1;
                            }
                            Err(e) => {
                                // transient; retried by the peer stack
                                self.stats.sock_out_err += 1;
                                tracing::debug!(peer = %peer.name, %e, "send failed");
                            }
                        }
                    }
                    Err(_) => {
                        self.stats.queue_in += 1;
                        if peer.queue.push(packet.to_vec(), now) {
                            self.stats.queue_drop += 1;
                        }
                        want_handshake = true;
                    }
                }
            } else {
                self.stats.queue_in += 1;
                if peer.queue.push(packet.to_vec(), now) {
                    self.stats.queue_drop += 1;
                }
                want_handshake = true;
            }
        } else {
            let peer = &mut self.peers[i];
            self.stats.queue_in += 1;
            if peer.queue.push(packet.to_vec(), now) {
                self.stats.queue_drop += 1;
            }
            want_handshake = true;
        }

        if want_handshake || rekey {
            self.request_handshake(peerid, now).await?;
        }
        Ok(())
    }

    /// A packet arriving on a pinned, connected socket.
    async fn handle_sock_packet(&mut self, i: usize, packet: &[u8]) -> Result<()> {
        self.stats.sock_in += 1;
        let Some(&code) = packet.first() else {
            self.stats.corrupted += 1;
            return Ok(());
        };
        let Ok(mt) = MsgType::try_from(code) else {
            self.stats.corrupted += 1;
            return Ok(());
        };
        if crate::wire::check_payload_size(mt, packet.len()).is_err() {
            self.stats.corrupted += 1;
            return Ok(());
        }

        match mt {
            MsgType::WgInit => {
                self.stats.init_in += 1;
                if !blake2s::valid_mac(
                    &packet[Initiation::MAC1_OFFSET..Initiation::MAC1_OFFSET + 16]
                        .try_into()
                        .expect("sized above"),
                    &self.mac1key,
                    &packet[..Initiation::MAC1_OFFSET],
                ) {
                    self.stats.invalid_mac += 1;
                    return Err(ProtocolError::MacVerificationFailed.into());
                }
                let frame = frame_peer(i as u32, MsgType::WgInit, packet);
                self.encl.send(&frame, None).await.map_err(IpcError::from)?;
            }
            MsgType::WgResp => {
                self.stats.resp_in += 1;
                if !blake2s::valid_mac(
                    &packet[Response::MAC1_OFFSET..Response::MAC1_OFFSET + 16]
                        .try_into()
                        .expect("sized above"),
                    &self.mac1key,
                    &packet[..Response::MAC1_OFFSET],
                ) {
                    self.stats.invalid_mac += 1;
                    return Err(ProtocolError::MacVerificationFailed.into());
                }
                let frame = frame_peer(i as u32, MsgType::WgResp, packet);
                self.encl.send(&frame, None).await.map_err(IpcError::from)?;
            }
            MsgType::WgCookie => {
                let reply = CookieReply::from_bytes(packet)?;
                self.store_cookie(i, &reply)?;
            }
            MsgType::WgData => {
                self.inbound_data(i, packet, Instant::now()).await?;
            }
            _ => {
                self.stats.corrupted += 1;
            }
        }
        Ok(())
    }

    /// Authenticate, decrypt and forward one transport message.
    async fn inbound_data(&mut self, i: usize, packet: &[u8], now: Instant) -> Result<()> {
        let hdr = DataHeader::from_bytes(packet)?;

        let (counter, plain) = {
            let peer = &mut self.peers[i];
            let Some((sess, _)) = peer.sessions.by_sessid(hdr.receiver) else {
                return Err(ProtocolError::UnknownSession {
                    sessid: hdr.receiver,
                }
                .into());
            };
            if !sess.usable(now) {
                return Err(ProtocolError::SessionExpired.into());
            }
            match sess.open_packet(packet) {
                Ok(ok) => ok,
                Err(e) => {
                    if matches!(e, ProtocolError::ReplayDetected { .. }) {
                        self.stats.replayed += 1;
                    } else {
                        self.stats.corrupted += 1;
                    }
                    return Err(e.into());
                }
            }
        };

        if !plain.is_empty() {
            // the decrypted source must route back to this very peer;
            // drop before committing the counter so a spoofed inner
            // packet cannot advance the window either
            let Some(src) = ip_src(&plain) else {
                self.stats.corrupted += 1;
                return Err(ProtocolError::DisallowedSource.into());
            };
            if self.router.lookup(src) != Some(i as u32) {
                self.stats.invalid_peer += 1;
                return Err(ProtocolError::DisallowedSource.into());
            }
        }

        let rekey_ahead = {
            let peer = &mut self.peers[i];
            let (sess, slot) = peer.sessions.by_sessid(hdr.receiver).expect("found above");
            sess.commit_counter(counter);
            if !plain.is_empty() {
                sess.keepalive_due = Some(now + KEEPALIVE_TIMEOUT);
            }
            let rekey_ahead = sess.initiator
                && sess.age(now) > REJECT_AFTER_TIME - KEEPALIVE_TIMEOUT - REKEY_TIMEOUT;

            // the first authenticated packet promotes next to current
            if slot == Slot::Next {
                peer.sessions.promote_next();
            }
            rekey_ahead
        };

        if !plain.is_empty() {
            match self.tun.send(&plain).await {
                Ok(_) => self.stats.dev_out += 1,
                Err(e) => {
                    self.stats.dev_out_err += 1;
                    tracing::debug!(%e, "tunnel write failed");
                }
            }
        }

        if rekey_ahead {
            self.request_handshake(i as u32, now).await?;
        }
        Ok(())
    }

    /// Messages from the enclave: frames to put on the wire and freshly
    /// derived session keys.
    async fn handle_enclave_msg(&mut self, datagram: &[u8]) -> Result<()> {
        let (peerid, mt, payload) = parse_peer(datagram)?;
        let i = peerid as usize;
        if i >= self.peers.len() {
            return Err(IpcError::UnknownPeerId { peerid }.into());
        }
        let now = Instant::now();

        match mt {
            MsgType::WgInit => {
                let msg = Initiation::from_bytes(payload)?;
                let mut bytes = msg.to_bytes();

                let peer = &mut self.peers[i];
                // a still-valid cookie from a loaded responder goes
                // into mac2
                if let Some(cookie) = peer.cookie.as_ref().filter(|c| c.valid(now)) {
                    let mac2 =
                        blake2s::mac_keyed16(&cookie.value, &bytes[..Initiation::MAC2_OFFSET]);
                    bytes[Initiation::MAC2_OFFSET..].copy_from_slice(&mac2);
                }

                match peer.sessions.pending.as_mut() {
                    Some(pending) => {
                        pending.sessid = Some(msg.sender);
                        pending.mac1 = msg.mac1;
                    }
                    None => {
                        // unsolicited but harmless: the enclave is
                        // trusted, track it as a fresh attempt
                        peer.sessions.pending = Some(Pending {
                            sessid: Some(msg.sender),
                            mac1: msg.mac1,
                            first_attempt: now,
                            last_request: now,
                        });
                    }
                }

                self.stats.init_out += 1;
                self.send_or_hold(i, bytes.to_vec()).await;
            }
            MsgType::WgResp => {
                let msg = Response::from_bytes(payload)?;
                self.stats.resp_out += 1;
                self.send_or_hold(i, msg.to_bytes().to_vec()).await;
            }
            MsgType::SessKeys => {
                let keys = crate::wire::ipc::SessKeys::from_bytes(payload)?;
                let peer = &mut self.peers[i];
                let initiator = peer.sessions.install(&keys, now);
                tracing::info!(
                    peer = %peer.name,
                    sessid = %format_args!("{:x}", keys.sessid),
                    initiator,
                    "session installed"
                );
                drop(keys);

                // only the initiator may talk first; flush what queued
                // up while the handshake ran
                if initiator {
                    self.flush_queue(i, now).await;
                }
            }
            other => {
                return Err(IpcError::UnexpectedMessage {
                    mtcode: other as u8,
                }
                .into())
            }
        }
        Ok(())
    }

    /// Messages from the proxy: pinned flow sockets and cookie replies.
    async fn handle_proxy_msg(&mut self, datagram: &[u8], fd: Option<OwnedFd>) -> Result<()> {
        let (env, mt, payload) = parse_proxy(datagram)?;
        if env.ifnid != self.id {
            return Err(IpcError::UnknownIfn { ifnid: env.ifnid }.into());
        }

        match mt {
            MsgType::ConnReq => {
                let req = ConnReq::from_bytes(payload)?;
                let i = req.peerid as usize;
                if i >= self.peers.len() {
                    return Err(IpcError::UnknownPeerId { peerid: req.peerid }.into());
                }
                let fd = fd.ok_or(IpcError::MissingFd)?;

                let std_sock = std::net::UdpSocket::from(fd);
                std_sock.set_nonblocking(true).map_err(IpcError::from)?;
                let sock = UdpSocket::from_std(std_sock).map_err(IpcError::from)?;

                let peer = &mut self.peers[i];
                tracing::info!(
                    peer = %peer.name,
                    local = %req.local,
                    remote = %req.remote,
                    "flow pinned"
                );
                peer.sock = Some(sock);

                // handshake frames held back for want of a socket
                while let Some(frame) = self.peers[i].pending_tx.pop_front() {
                    self.send_or_hold(i, frame).await;
                }
                self.flush_queue(i, Instant::now()).await;
            }
            MsgType::WgCookie => {
                let reply = CookieReply::from_bytes(payload)?;
                let i = self
                    .peers
                    .iter()
                    .position(|p| {
                        p.sessions
                            .pending
                            .as_ref()
                            .and_then(|pending| pending.sessid)
                            == Some(reply.receiver)
                    })
                    .ok_or(ProtocolError::UnknownSession {
                        sessid: reply.receiver,
                    })?;
                self.store_cookie(i, &reply)?;
            }
            other => {
                return Err(IpcError::UnexpectedMessage {
                    mtcode: other as u8,
                }
                .into())
            }
        }
        Ok(())
    }

    /// Decrypt and remember a cookie for the next initiation attempt.
    fn store_cookie(&mut self, i: usize, reply: &CookieReply) -> Result<()> {
        let now = Instant::now();
        let peer = &mut self.peers[i];
        let Some(pending) = peer.sessions.pending.as_ref() else {
            return Err(ProtocolError::UnknownSession {
                sessid: reply.receiver,
            }
            .into());
        };
        if pending.sessid != Some(reply.receiver) {
            return Err(ProtocolError::UnknownSession {
                sessid: reply.receiver,
            }
            .into());
        }

        let value = aead::xopen(
            &peer.cookie_key,
            &reply.nonce,
            &reply.sealed_cookie,
            &pending.mac1,
        )
        .map_err(|_| ProtocolError::Unauthenticated)?;
        let value: [u8; 16] = value
            .try_into()
            .map_err(|_| ProtocolError::Unauthenticated)?;

        peer.cookie = Some(Cookie {
            value,
            received: now,
        });
        tracing::info!(peer = %peer.name, "cookie stored for next attempt");
        Ok(())
    }

    /// Send a handshake frame on the pinned socket, or hold it until
    /// the proxy hands one over.
    async fn send_or_hold(&mut self, i: usize, frame: Vec<u8>) {
        match &self.peers[i].sock {
            Some(sock) => match sock.send(&frame).await {
                Ok(_) => self.stats.sock_out += 1,
                Err(e) => {
                    self.stats.sock_out_err += 1;
                    tracing::debug!(peer = %self.peers[i].name, %e, "send failed");
                }
            },
            None => {
                self.peers[i].pending_tx.push_back(frame);
            }
        }
    }

    /// Drain the packet queue through the current session, if any.
    async fn flush_queue(&mut self, i: usize, now: Instant) {
        loop {
            let peer = &mut self.peers[i];
            if peer.sock.is_none() {
                return;
            }
            let Some(sess) = peer.sessions.send_session(now) else {
                return;
            };
            let Some(packet) = peer.queue.pop() else {
                return;
            };
            let Ok(msg) = sess.seal_packet(&packet, now) else {
                return;
            };
            self.stats.queue_out += 1;
            let sock = peer.sock.as_ref().expect("checked above");
            match sock.send(&msg).await {
                Ok(_) => self.stats.sock_out += 1,
                Err(e) => {
                    self.stats.sock_out_err += 1;
                    tracing::debug!(peer = %peer.name, %e, "send failed");
                }
            }
        }
    }

    /// Ask the enclave for a handshake, paced to once per
    /// `REKEY_TIMEOUT` per peer.
    async fn request_handshake(&mut self, peerid: u32, now: Instant) -> Result<()> {
        let peer = &mut self.peers[peerid as usize];
        match peer.sessions.pending.as_mut() {
            Some(pending) => {
                if now.saturating_duration_since(pending.last_request) < REKEY_TIMEOUT {
                    return Ok(());
                }
                pending.last_request = now;
            }
            None => {
                peer.sessions.pending = Some(Pending {
                    sessid: None,
                    mac1: [0u8; 16],
                    first_attempt: now,
                    last_request: now,
                });
            }
        }
        let frame = frame_peer(peerid, MsgType::ReqWgInit, &[]);
        self.encl.send(&frame, None).await.map_err(IpcError::from)?;
        Ok(())
    }

    /// Once per second: lifetime limits, handshake retries and
    /// keepalives.
    async fn handle_tick(&mut self, now: Instant) -> Result<()> {
        for i in 0..self.peers.len() {
            self.peers[i].sessions.reap(now);

            // give up on a handshake that went nowhere, and the
            // packets that waited for it
            let gave_up = self.peers[i]
                .sessions
                .pending
                .as_ref()
                .is_some_and(|p| {
                    now.saturating_duration_since(p.first_attempt) > REKEY_ATTEMPT_TIME
                });
            if gave_up {
                let peer = &mut self.peers[i];
                tracing::info!(peer = %peer.name, "handshake abandoned");
                peer.sessions.pending = None;
                peer.pending_tx.clear();
                peer.queue.clear();
                continue;
            }

            // retry a pending handshake, rekey an aging session, or
            // resolve a queue that waited too long without a session
            let pending_retry = self.peers[i].sessions.pending.is_some();
            let queue_waiting = self.peers[i]
                .queue
                .oldest_age(now)
                .is_some_and(|age| age >= REKEY_TIMEOUT)
                && !self.peers[i].sessions.has_live_session(now);
            let curr_rekey = self.peers[i]
                .sessions
                .current()
                .is_some_and(|s| s.wants_rekey(now));
            if pending_retry || curr_rekey || queue_waiting {
                self.request_handshake(i as u32, now).await?;
            }

            // answer received-only traffic so the peer knows we live
            let keepalive_due = self.peers[i]
                .sessions
                .current()
                .and_then(|s| s.keepalive_due)
                .is_some_and(|due| now >= due);
            if keepalive_due && self.peers[i].sock.is_some() {
                let peer = &mut self.peers[i];
                if let Some(sess) = peer.sessions.send_session(now) {
                    if let Ok(msg) = sess.seal_packet(&[], now) {
                        let sock = peer.sock.as_ref().expect("checked above");
                        match sock.send(&msg).await {
                            Ok(_) => {
                                self.stats.keepalive_out += 1;
                                self.stats.sock_out += 1;
                            }
                            Err(e) => {
                                self.stats.sock_out_err += 1;
                                tracing::debug!(peer = %peer.name, %e, "keepalive failed");
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_dst_and_src_extraction() {
        // minimal IPv4 header: 10.0.0.1 -> 10.0.0.2
        let mut v4 = vec![0u8; 20];
        v4[0] = 0x45;
        v4[12..16].copy_from_slice(&[10, 0, 0, 1]);
        v4[16..20].copy_from_slice(&[10, 0, 0, 2]);
        assert_eq!(ip_src(&v4), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(ip_dst(&v4), Some("10.0.0.2".parse().unwrap()));

        // minimal IPv6 header: fd00::1 -> fd00::2
        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        v6[8..24].copy_from_slice(&"fd00::1".parse::<Ipv6Addr>().unwrap().octets());
        v6[24..40].copy_from_slice(&"fd00::2".parse::<Ipv6Addr>().unwrap().octets());
        assert_eq!(ip_src(&v6), Some("fd00::1".parse().unwrap()));
        assert_eq!(ip_dst(&v6), Some("fd00::2".parse().unwrap()));

        // truncated headers and junk versions yield nothing
        assert_eq!(ip_dst(&v4[..16]), None);
        assert_eq!(ip_dst(&[0x90, 0, 0]), None);
        assert_eq!(ip_dst(&[]), None);
    }
}
