//! Enclave process
//!
//! The only process that ever holds a long-term secret. It consumes
//! handshake messages forwarded by the proxy (with the observed
//! 5-tuple) or by an interface worker (from a pinned socket, with the
//! peer id), validates them, and emits session keys, responses and flow
//! pin requests. Derived transport keys are wiped here the moment the
//! delivering write returns.
//!
//! The enclave carries no timers; rekey pacing lives in the interface
//! workers, which ask for new initiations over `ReqWgInit`.

pub mod handshake;

use std::os::fd::RawFd;
use std::task::Poll;

use tai64::Tai64N;
use tokio::signal::unix::{signal, SignalKind};
use zeroize::Zeroize;

use crate::crypto::SecretKey;
use crate::error::{IpcError, Result};
use crate::privsep;
use crate::wire::ipc::{
    frame_peer, frame_proxy, parse_peer, parse_proxy, wildcard_for, AsyncIpc, ConnReq,
    IpcChannel, ProxyEnvelope, SCRATCH,
};
use crate::wire::startup::{SIfn, SInit, SPeer};
use crate::wire::wg::{Initiation, Response};
use crate::wire::MsgType;

#[derive(Default)]
struct Stats {
    init_in: u64,
    init_out: u64,
    resp_in: u64,
    resp_out: u64,
    keys_out: u64,
    dropped: u64,
}

struct IfnPort {
    ifn: handshake::Interface,
    chan: AsyncIpc,
}

struct Enclave {
    ifns: Vec<IfnPort>,
    proxy: AsyncIpc,
    stats: Stats,
}

/// Configuration received over the master channel, before hardening.
struct StartupState {
    uid: u32,
    gid: u32,
    verbose: i32,
    proxport: RawFd,
    ifns: Vec<(handshake::Interface, RawFd)>,
}

/// Child entry point for `-E <fd>`.
pub fn run(masterport: RawFd) -> Result<()> {
    let master = unsafe { IpcChannel::from_raw_fd(masterport) };
    let state = recv_config(&master)?;

    privsep::init_logging("enclave", state.verbose);
    tracing::info!(ifns = state.ifns.len(), "configuration received");

    // stdio + master + proxy + one channel per interface; checked
    // before the runtime opens its own descriptors
    privsep::expect_open_fds(3 + 2 + state.ifns.len())?;
    privsep::limit_resources(state.ifns.iter().map(|(i, _)| i.peers.len()).sum())?;
    privsep::chroot_empty()?;
    privsep::drop_privileges(state.uid, state.gid)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(IpcError::from)?;

    runtime.block_on(async move {
        let mut enclave = Enclave {
            proxy: AsyncIpc::new(unsafe { IpcChannel::from_raw_fd(state.proxport) })?,
            ifns: state
                .ifns
                .into_iter()
                .map(|(ifn, fd)| {
                    Ok(IfnPort {
                        ifn,
                        chan: AsyncIpc::new(unsafe { IpcChannel::from_raw_fd(fd) })?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            stats: Stats::default(),
        };
        enclave.serv(master).await
    })
}

/// Receive the startup sequence. Anything out of order is fatal.
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
        if sifn.ifnid != n {
            return Err(IpcError::UnknownIfn { ifnid: sifn.ifnid }.into());
        }
        // the enclave receives no address records
        if sifn.nifaddrs != 0 || sifn.nlistenaddrs != 0 {
            return Err(IpcError::StartupOrder { expected: "SPeer" }.into());
        }

        let privkey = SecretKey::from_bytes(sifn.privkey);
        let ifn = handshake::Interface::new(sifn.ifnid, sifn.ifname.clone(), privkey);
        if ifn.pubkey != sifn.pubkey {
            // master and enclave disagree on key derivation
            return Err(IpcError::StartupOrder {
                expected: "matching public key",
            }
            .into());
        }

        let mut ifn = ifn;
        for m in 0..sifn.npeers {
            let (mt, payload) = master.recv_plain(&mut buf)?;
            if mt != MsgType::SPeer {
                return Err(IpcError::StartupOrder { expected: "SPeer" }.into());
            }
            let speer = SPeer::from_bytes(payload)?;
            if speer.ifnid != n || speer.peerid != m || speer.nallowedips != 0 {
                return Err(IpcError::UnknownPeerId { peerid: speer.peerid }.into());
            }
            ifn.add_peer(
                speer.pubkey,
                SecretKey::from_bytes(speer.psk),
                speer.endpoint,
            );
        }

        ifns.push((ifn, sifn.ifnport));
    }

    let (mt, _) = master.recv_plain(&mut buf)?;
    if mt != MsgType::SEos {
        return Err(IpcError::StartupOrder { expected: "SEos" }.into());
    }

    buf.zeroize();

    Ok(StartupState {
        uid: sinit.uid,
        gid: sinit.gid,
        verbose: sinit.verbose,
        proxport: sinit.proxport,
        ifns,
    })
}

enum Event {
    Proxy(usize),
    Ifn(usize, usize),
    Stats,
    Terminate,
}

impl Enclave {
    async fn serv(&mut self, _master: IpcChannel) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate()).map_err(IpcError::from)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(IpcError::from)?;
        let mut sigusr1 = signal(SignalKind::user_defined1()).map_err(IpcError::from)?;
        let mut buf = vec![0u8; SCRATCH];

        loop {
            let event = {
                let proxy = &self.proxy;
                let ifns = &self.ifns;
                let buf = &mut buf[..];
                tokio::select! {
                    _ = sigterm.recv() => Event::Terminate,
                    _ = sigint.recv() => Event::Terminate,
                    _ = sigusr1.recv() => Event::Stats,
                    ready = std::future::poll_fn(|cx| {
                        if let Poll::Ready(r) = proxy.poll_recv(cx, buf) {
                            let (n, _) = r?;
                            return Poll::Ready(std::io::Result::Ok(Event::Proxy(n)));
                        }
                        for (i, port) in ifns.iter().enumerate() {
                            if let Poll::Ready(r) = port.chan.poll_recv(cx, buf) {
                                let (n, _) = r?;
                                return Poll::Ready(Ok(Event::Ifn(i, n)));
                            }
                        }
                        Poll::Pending
                    }) => ready.map_err(IpcError::from)?,
                }
            };

            match event {
                Event::Terminate => {
                    tracing::info!("received termination signal, shutting down");
                    return Ok(());
                }
                Event::Stats => self.log_stats(),
                Event::Proxy(n) => {
                    let datagram = buf[..n].to_vec();
                    let result = self.handle_proxy_msg(&datagram).await;
                    self.dispatch(result)?;
                }
                Event::Ifn(i, n) => {
                    let datagram = buf[..n].to_vec();
                    let result = self.handle_ifn_msg(i, &datagram).await;
                    self.dispatch(result)?;
                }
            }
        }
    }

    /// Contain untrusted-input failures, propagate everything else.
    fn dispatch(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_droppable() => {
                self.stats.dropped += 1;
                tracing::warn!(%err, "dropped packet");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn log_stats(&self) {
        let s = &self.stats;
        tracing::warn!(
            init_in = s.init_in,
            init_out = s.init_out,
            resp_in = s.resp_in,
            resp_out = s.resp_out,
            keys_out = s.keys_out,
            dropped = s.dropped,
            "statistics"
        );
    }

    /// Messages from an interface worker: handshake frames that arrived
    /// on a pinned socket, or a request to start a handshake.
    async fn handle_ifn_msg(&mut self, i: usize, datagram: &[u8]) -> Result<()> {
        let (peerid, mt, payload) = parse_peer(datagram)?;
        if self.ifns[i].ifn.peer(peerid).is_none() {
            return Err(IpcError::UnknownPeerId { peerid }.into());
        }

        match mt {
            MsgType::WgInit => {
                self.stats.init_in += 1;
                let msg = Initiation::from_bytes(payload)?;
                self.respond_and_emit(i, &msg, Some(peerid), None).await
            }
            MsgType::WgResp => {
                self.stats.resp_in += 1;
                let msg = Response::from_bytes(payload)?;
                self.absorb_and_emit(i, &msg, Some(peerid), None).await
            }
            MsgType::ReqWgInit => self.start_handshake(i, peerid).await,
            other => Err(IpcError::UnexpectedMessage {
                mtcode: other as u8,
            }
            .into()),
        }
    }

    /// Messages relayed by the proxy carry the 5-tuple of their origin;
    /// a validated handshake additionally pins that flow.
    async fn handle_proxy_msg(&mut self, datagram: &[u8]) -> Result<()> {
        let (env, mt, payload) = parse_proxy(datagram)?;
        let i = env.ifnid as usize;
        if i >= self.ifns.len() {
            return Err(IpcError::UnknownIfn { ifnid: env.ifnid }.into());
        }

        match mt {
            MsgType::WgInit => {
                self.stats.init_in += 1;
                let msg = Initiation::from_bytes(payload)?;
                self.respond_and_emit(i, &msg, None, Some(env)).await
            }
            MsgType::WgResp => {
                self.stats.resp_in += 1;
                let msg = Response::from_bytes(payload)?;
                self.absorb_and_emit(i, &msg, None, Some(env)).await
            }
            other => Err(IpcError::UnexpectedMessage {
                mtcode: other as u8,
            }
            .into()),
        }
    }

    async fn start_handshake(&mut self, i: usize, peerid: u32) -> Result<()> {
        // a configured endpoint gets its flow pinned up front so the
        // worker has a socket to send the initiation on
        let endpoint = self.ifns[i].ifn.peer(peerid).and_then(|p| p.endpoint);
        if let Some(remote) = endpoint {
            let local = wildcard_for(&remote);
            let env = ProxyEnvelope {
                ifnid: self.ifns[i].ifn.id,
                local: Some(local),
                remote: Some(remote),
            };
            send_connreq(&self.proxy, &env, peerid).await?;
        }

        let port = &mut self.ifns[i];
        let msg = handshake::initiate(&mut port.ifn, peerid, Tai64N::now().to_bytes())?;
        let frame = frame_peer(peerid, MsgType::WgInit, &msg.to_bytes());
        port.chan.send(&frame, None).await.map_err(IpcError::from)?;
        self.stats.init_out += 1;

        tracing::info!(ifn = %self.ifns[i].ifn.name, peerid, "sent handshake initiation");
        Ok(())
    }

    async fn respond_and_emit(
        &mut self,
        i: usize,
        msg: &Initiation,
        pinned: Option<u32>,
        env: Option<ProxyEnvelope>,
    ) -> Result<()> {
        let port = &mut self.ifns[i];
        let (peerid, resp, keys) = handshake::respond(&mut port.ifn, msg, pinned)?;

        if let Some(env) = env {
            send_connreq(&self.proxy, &env, peerid).await?;
        }

        // keys must reach the worker before the response reaches the
        // peer, or data sent against them would find no session
        let port = &self.ifns[i];
        let mut frame = frame_peer(peerid, MsgType::SessKeys, &keys.to_bytes());
        let sent = port.chan.send(&frame, None).await;
        frame.zeroize();
        sent.map_err(IpcError::from)?;
        drop(keys);
        self.stats.keys_out += 1;

        let frame = frame_peer(peerid, MsgType::WgResp, &resp.to_bytes());
        port.chan.send(&frame, None).await.map_err(IpcError::from)?;
        self.stats.resp_out += 1;

        tracing::info!(ifn = %port.ifn.name, peerid, "handshake responded");
        Ok(())
    }

    async fn absorb_and_emit(
        &mut self,
        i: usize,
        msg: &Response,
        pinned: Option<u32>,
        env: Option<ProxyEnvelope>,
    ) -> Result<()> {
        let port = &mut self.ifns[i];
        let (peerid, keys) = handshake::absorb_response(&mut port.ifn, msg, pinned)?;

        if let Some(env) = env {
            send_connreq(&self.proxy, &env, peerid).await?;
        }

        let port = &self.ifns[i];
        let mut frame = frame_peer(peerid, MsgType::SessKeys, &keys.to_bytes());
        let sent = port.chan.send(&frame, None).await;
        frame.zeroize();
        sent.map_err(IpcError::from)?;
        drop(keys);
        self.stats.keys_out += 1;

        tracing::info!(ifn = %port.ifn.name, peerid, "handshake completed");
        Ok(())
    }
}

/// Ask the proxy to pin `(local, remote)` onto a connected socket for
/// `peerid` of the enveloped interface.
async fn send_connreq(proxy: &AsyncIpc, env: &ProxyEnvelope, peerid: u32) -> Result<()> {
    let (Some(local), Some(remote)) = (env.local, env.remote) else {
        return Ok(());
    };
    let req = ConnReq {
        peerid,
        local,
        remote,
    };
    let frame = frame_proxy(env, MsgType::ConnReq, &req.to_bytes());
    proxy.send(&frame, None).await.map_err(IpcError::from)?;
    Ok(())
}
