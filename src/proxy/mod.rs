//! Proxy process
//!
//! Owns every listening UDP socket. Reads only the type byte and, for
//! handshake frames, the mac1 region; everything that validates is
//! relayed to the enclave together with the observed 5-tuple. When the
//! enclave confirms a handshake it answers with a `ConnReq`; the proxy
//! then binds a connected socket for that exact flow (sharing the
//! listen port via `SO_REUSEPORT` so the kernel steers the flow away
//! from the listener) and hands the descriptor to the owning interface
//! worker. No plaintext and no long-term secret ever enters this
//! process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsFd, OwnedFd, RawFd};
use std::task::Poll;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};

use crate::crypto::blake2s;
use crate::error::{IpcError, ProtocolError, Result};
use crate::privsep;
use crate::wire::ipc::{
    frame_proxy, parse_proxy, AsyncIpc, ConnReq, IpcChannel, ProxyEnvelope, SCRATCH,
};
use crate::wire::startup::{SCidrAddr, SIfn, SInit};
use crate::wire::wg::{Initiation, Response};
use crate::wire::MsgType;

/// Scratch for one UDP datagram.
const PKT_SCRATCH: usize = 2048;

#[derive(Default)]
struct Stats {
    recv: u64,
    fwd_enclave: u64,
    fwd_ifn: u64,
    flows: u64,
    dropped_data: u64,
    corrupted: u64,
    invalid_mac: u64,
}

struct Listener {
    ifnid: u32,
    local: SocketAddr,
    /// Closed (set to None) on a socket error; service continues on
    /// the other listeners.
    sock: Option<UdpSocket>,
}

struct IfnPort {
    mac1key: [u8; 32],
    listen_addrs: Vec<SocketAddr>,
    chan: AsyncIpc,
}

struct Proxy {
    ifns: Vec<IfnPort>,
    listeners: Vec<Listener>,
    encl: AsyncIpc,
    /// Live pinned flows. The proxy keeps each descriptor so a
    /// duplicate `ConnReq` reuses the socket instead of binding a
    /// second one.
    flows: HashMap<(u32, SocketAddr, SocketAddr), OwnedFd>,
    /// Active flow key per peer, to drop a replaced flow on re-pin.
    peer_flows: HashMap<(u32, u32), (SocketAddr, SocketAddr)>,
    stats: Stats,
}

struct StartupState {
    uid: u32,
    gid: u32,
    verbose: i32,
    enclport: RawFd,
    ifns: Vec<(IfnConfig, RawFd)>,
}

struct IfnConfig {
    ifnid: u32,
    mac1key: [u8; 32],
    listen_addrs: Vec<SocketAddr>,
}

/// Child entry point for `-P <fd>`.
pub fn run(masterport: RawFd) -> Result<()> {
    let master = unsafe { IpcChannel::from_raw_fd(masterport) };
    let state = recv_config(&master)?;

    privsep::init_logging("proxy", state.verbose);
    tracing::info!(ifns = state.ifns.len(), "configuration received");

    // listening sockets need the privileges we are about to drop
    let mut listeners = Vec::new();
    for (cfg, _) in &state.ifns {
        for &addr in &cfg.listen_addrs {
            let sock = bind_listener(addr)?;
            tracing::info!(ifn = cfg.ifnid, %addr, "listening");
            listeners.push((cfg.ifnid, addr, sock));
        }
    }

    // stdio + master + enclave + ifn channels + listeners
    privsep::expect_open_fds(3 + 2 + state.ifns.len() + listeners.len())?;
    privsep::limit_resources(listeners.len())?;
    privsep::chroot_empty()?;
    privsep::drop_privileges(state.uid, state.gid)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(IpcError::from)?;

    runtime.block_on(async move {
        let mut proxy = Proxy {
            ifns: state
                .ifns
                .iter()
                .map(|(cfg, fd)| {
                    Ok(IfnPort {
                        mac1key: cfg.mac1key,
                        listen_addrs: cfg.listen_addrs.clone(),
                        chan: AsyncIpc::new(unsafe { IpcChannel::from_raw_fd(*fd) })?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            listeners: listeners
                .into_iter()
                .map(|(ifnid, local, sock)| {
                    sock.set_nonblocking(true).map_err(IpcError::from)?;
                    Ok(Listener {
                        ifnid,
                        local,
                        sock: Some(UdpSocket::from_std(sock).map_err(IpcError::from)?),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            encl: AsyncIpc::new(unsafe { IpcChannel::from_raw_fd(state.enclport) })?,
            flows: HashMap::new(),
            peer_flows: HashMap::new(),
            stats: Stats::default(),
        };
        proxy.serv().await
    })
}

fn recv_config(master: &IpcChannel) -> Result<StartupState> {
    let mut buf = [0u8; SCRATCH];

    let (mt, payload) = master.recv_plain(&mut buf)?;
    if mt != MsgType::SInit {
        return Err(IpcError::StartupOrder { expected: "SInit" }.into());
    }
    let sinit = SInit::from_bytes(payload)?;

    let mut ifns = Vec::with_capacity(sinit.nifns as usize);
    for n in 0..sinit.nifns {
        let (mt, payload) = master.recv_plain(&mut buf)?;
        if mt != MsgType::SIfn {
            return Err(IpcError::StartupOrder { expected: "SIfn" }.into());
        }
        let sifn = SIfn::from_bytes(payload)?;
        // the proxy is peer-blind and address-blind except listeners
        if sifn.ifnid != n || sifn.nifaddrs != 0 || sifn.npeers != 0 {
            return Err(IpcError::UnknownIfn { ifnid: sifn.ifnid }.into());
        }

        let mut listen_addrs = Vec::with_capacity(sifn.nlistenaddrs as usize);
        for _ in 0..sifn.nlistenaddrs {
            let (mt, payload) = master.recv_plain(&mut buf)?;
            if mt != MsgType::SCidrAddr {
                return Err(IpcError::StartupOrder {
                    expected: "SCidrAddr",
                }
                .into());
            }
            let ca = SCidrAddr::from_bytes(payload)?;
            listen_addrs.push(ca.addr);
        }

        ifns.push((
            IfnConfig {
                ifnid: sifn.ifnid,
                mac1key: sifn.mac1key,
                listen_addrs,
            },
            sifn.ifnport,
        ));
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
        ifns,
    })
}

/// A reusable-address datagram socket bound to `addr`, still blocking.
fn bind_listener(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(IpcError::from)?;
    sock.set_reuse_address(true).map_err(IpcError::from)?;
    sock.set_reuse_port(true).map_err(IpcError::from)?;
    sock.bind(&addr.into()).map_err(IpcError::from)?;
    Ok(sock.into())
}

/// A connected socket for one flow, sharing the listen address.
fn bind_flow(local: SocketAddr, remote: SocketAddr) -> std::io::Result<OwnedFd> {
    let domain = if remote.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.set_reuse_port(true)?;
    sock.bind(&local.into())?;
    sock.connect(&remote.into())?;
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

enum Event {
    Wire(usize, std::io::Result<(usize, SocketAddr)>),
    Enclave(usize),
    Stats,
    Terminate,
}

fn poll_listeners(
    listeners: &[Listener],
    cx: &mut std::task::Context<'_>,
    buf: &mut [u8],
) -> Poll<(usize, std::io::Result<(usize, SocketAddr)>)> {
    for (i, listener) in listeners.iter().enumerate() {
        if let Some(sock) = &listener.sock {
            let mut rb = ReadBuf::new(buf);
            match sock.poll_recv_from(cx, &mut rb) {
                Poll::Ready(Ok(from)) => {
                    return Poll::Ready((i, Ok((rb.filled().len(), from))))
                }
                Poll::Ready(Err(e)) => return Poll::Ready((i, Err(e))),
                Poll::Pending => {}
            }
        }
    }
    Poll::Pending
}

impl Proxy {
    async fn serv(&mut self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate()).map_err(IpcError::from)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(IpcError::from)?;
        let mut sigusr1 = signal(SignalKind::user_defined1()).map_err(IpcError::from)?;

        let mut wbuf = vec![0u8; PKT_SCRATCH];
        let mut ebuf = vec![0u8; SCRATCH];

        loop {
            let event = {
                let listeners = &self.listeners;
                let encl = &self.encl;
                tokio::select! {
                    _ = sigterm.recv() => Event::Terminate,
                    _ = sigint.recv() => Event::Terminate,
                    _ = sigusr1.recv() => Event::Stats,
                    r = std::future::poll_fn(|cx| poll_listeners(listeners, cx, &mut wbuf)) => {
                        let (i, result) = r;
                        Event::Wire(i, result)
                    }
                    r = encl.recv(&mut ebuf) => {
                        let (n, _) = r.map_err(IpcError::from)?;
                        Event::Enclave(n)
                    }
                }
            };

            match event {
                Event::Terminate => {
                    tracing::info!("received termination signal, shutting down");
                    return Ok(());
                }
                Event::Stats => self.log_stats(),
                Event::Wire(i, Ok((n, from))) => {
                    let packet = wbuf[..n].to_vec();
                    if let Err(err) = self.handle_wire(i, &packet, from).await {
                        if err.is_droppable() {
                            tracing::warn!(%err, "dropped packet");
                        } else {
                            return Err(err);
                        }
                    }
                }
                Event::Wire(i, Err(e)) => {
                    // one bad listener must not take the others down
                    tracing::warn!(listener = i, %e, "listener error, closing socket");
                    self.listeners[i].sock = None;
                }
                Event::Enclave(n) => {
                    let datagram = ebuf[..n].to_vec();
                    self.handle_enclave_msg(&datagram).await?;
                }
            }
        }
    }

    fn log_stats(&self) {
        let s = &self.stats;
        tracing::warn!(
            recv = s.recv,
            fwd_enclave = s.fwd_enclave,
            fwd_ifn = s.fwd_ifn,
            flows = s.flows,
            live_flows = self.flows.len(),
            dropped_data = s.dropped_data,
            corrupted = s.corrupted,
            invalid_mac = s.invalid_mac,
            "statistics"
        );
    }

    /// One datagram from the Internet: classify by type byte and mac1,
    /// relay or drop.
    async fn handle_wire(&mut self, i: usize, packet: &[u8], from: SocketAddr) -> Result<()> {
        self.stats.recv += 1;
        let listener = &self.listeners[i];
        let ifnid = listener.ifnid;
        let local = listener.local;
        let port = &self.ifns[ifnid as usize];

        let Some(&code) = packet.first() else {
            self.stats.corrupted += 1;
            return Ok(());
        };
        let Ok(mt) = MsgType::try_from(code) else {
            self.stats.corrupted += 1;
            return Err(ProtocolError::InvalidMessageType { mtcode: code }.into());
        };
        if crate::wire::check_payload_size(mt, packet.len()).is_err() {
            self.stats.corrupted += 1;
            return Err(ProtocolError::InvalidMessageLength {
                expected: crate::wire::payload_size(mt).0,
                got: packet.len(),
            }
            .into());
        }

        let env = ProxyEnvelope {
            ifnid,
            local: Some(local),
            remote: Some(from),
        };

        match mt {
            MsgType::WgInit => {
                if !blake2s::valid_mac(
                    &packet[Initiation::MAC1_OFFSET..Initiation::MAC1_OFFSET + 16]
                        .try_into()
                        .expect("sized above"),
                    &port.mac1key,
                    &packet[..Initiation::MAC1_OFFSET],
                ) {
                    self.stats.invalid_mac += 1;
                    return Err(ProtocolError::MacVerificationFailed.into());
                }
                let frame = frame_proxy(&env, MsgType::WgInit, packet);
                self.encl.send(&frame, None).await.map_err(IpcError::from)?;
                self.stats.fwd_enclave += 1;
            }
            MsgType::WgResp => {
                if !blake2s::valid_mac(
                    &packet[Response::MAC1_OFFSET..Response::MAC1_OFFSET + 16]
                        .try_into()
                        .expect("sized above"),
                    &port.mac1key,
                    &packet[..Response::MAC1_OFFSET],
                ) {
                    self.stats.invalid_mac += 1;
                    return Err(ProtocolError::MacVerificationFailed.into());
                }
                let frame = frame_proxy(&env, MsgType::WgResp, packet);
                self.encl.send(&frame, None).await.map_err(IpcError::from)?;
                self.stats.fwd_enclave += 1;
            }
            MsgType::WgCookie => {
                // the worker does its own cookie bookkeeping
                let frame = frame_proxy(&env, MsgType::WgCookie, packet);
                port.chan.send(&frame, None).await.map_err(IpcError::from)?;
                self.stats.fwd_ifn += 1;
            }
            MsgType::WgData => {
                // transport data belongs on a connected socket; it only
                // lands here in the short window while a flow is pinned
                self.stats.dropped_data += 1;
                tracing::debug!(%from, "transport data on listener, dropped");
            }
            _ => {
                self.stats.corrupted += 1;
                return Err(ProtocolError::InvalidMessageType { mtcode: code }.into());
            }
        }
        Ok(())
    }

    /// A `ConnReq` from the enclave: pin the flow and hand the socket
    /// to the owning worker.
    async fn handle_enclave_msg(&mut self, datagram: &[u8]) -> Result<()> {
        let (env, mt, payload) = parse_proxy(datagram)?;
        if mt != MsgType::ConnReq {
            return Err(IpcError::UnexpectedMessage {
                mtcode: mt as u8,
            }
            .into());
        }
        let req = ConnReq::from_bytes(payload)?;
        let i = env.ifnid as usize;
        if i >= self.ifns.len() {
            return Err(IpcError::UnknownIfn { ifnid: env.ifnid }.into());
        }

        // an unspecified local address means: use our listen address of
        // the matching family
        let local = if req.local.ip().is_unspecified() || req.local.port() == 0 {
            match self.ifns[i]
                .listen_addrs
                .iter()
                .find(|a| a.is_ipv4() == req.remote.is_ipv4())
            {
                Some(&addr) => addr,
                None => {
                    tracing::warn!(
                        ifn = env.ifnid,
                        remote = %req.remote,
                        "no listen address for remote family, flow not pinned"
                    );
                    return Ok(());
                }
            }
        } else {
            req.local
        };

        let key = (env.ifnid, local, req.remote);
        if self.flows.contains_key(&key) {
            // duplicate request, the worker already holds this flow
            return Ok(());
        }

        let sock = match bind_flow(local, req.remote) {
            Ok(sock) => sock,
            Err(e) => {
                tracing::warn!(%local, remote = %req.remote, %e, "flow bind failed");
                return Ok(());
            }
        };

        let fwd = ConnReq {
            peerid: req.peerid,
            local,
            remote: req.remote,
        };
        let frame = frame_proxy(
            &ProxyEnvelope {
                ifnid: env.ifnid,
                local: Some(local),
                remote: Some(req.remote),
            },
            MsgType::ConnReq,
            &fwd.to_bytes(),
        );
        self.ifns[i]
            .chan
            .send(&frame, Some(sock.as_fd()))
            .await
            .map_err(IpcError::from)?;

        // a re-pin of the same peer replaces its previous flow
        if let Some(old) = self
            .peer_flows
            .insert((env.ifnid, req.peerid), (local, req.remote))
        {
            if old != (local, req.remote) {
                self.flows.remove(&(env.ifnid, old.0, old.1));
            }
        }
        self.flows.insert(key, sock);
        self.stats.flows += 1;

        tracing::info!(
            ifn = env.ifnid,
            peerid = req.peerid,
            %local,
            remote = %req.remote,
            "flow pinned"
        );
        Ok(())
    }
}
