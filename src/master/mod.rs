//! Master bootstrap and supervisor
//!
//! Boots the whole arrangement: parse the configuration, derive the
//! per-interface and per-peer protocol keys, open one datagram
//! socketpair per pair of processes that must talk, fork and re-exec
//! the children so each inherits exactly its own descriptors, feed
//! each its role-minimized configuration, and finally re-exec into a
//! stripped-down supervisor image that holds no secrets, releases the
//! children into service and waits for the first one to die, at which
//! point the whole process group is taken down.

use std::ffi::CString;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, killpg, SigHandler, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, fork, getpgrp, ForkResult, Pid};

use crate::config::{Config, IfnConfig};
use crate::crypto::noise;
use crate::error::{ConfigError, Result, SepwireError};
use crate::privsep;
use crate::wire::ipc::IpcChannel;
use crate::wire::startup::{SCidrAddr, SIfn, SInit, SPeer};
use crate::wire::wg::{CookieReply, DataHeader, Initiation, Response};
use crate::wire::MsgType;

pub const DEFAULT_CONFIG: &str = "/etc/sepwire/sepwire.conf";

/// Command line state relevant to the master.
pub struct Options {
    pub config: Option<PathBuf>,
    pub foreground: bool,
    pub configtest: bool,
    pub verbose: i32,
}

/// Keys derived from the configuration before any fork.
struct DerivedIfn {
    cfg: IfnConfig,
    pubkey: [u8; 32],
    pubkeyhash: [u8; 32],
    mac1key: [u8; 32],
    cookiekey: [u8; 32],
    /// Per peer: mac1 key and cookie key over the peer's public key.
    peer_keys: Vec<([u8; 32], [u8; 32])>,
}

/// Child-side descriptor numbers of one worker's enclave and proxy
/// channels, as the worker sees them after exec. The master channel
/// itself travels as the `-I` argument.
struct WorkerFds {
    encl: RawFd,
    prox: RawFd,
}

fn sys(e: nix::errno::Errno) -> SepwireError {
    SepwireError::System(std::io::Error::from(e))
}

fn close_fds(fds: &[RawFd]) {
    for &fd in fds {
        let _ = nix::unistd::close(fd);
    }
}

/// Replace this image with `sepwire <flag> <fd>`. Only returns on
/// failure.
fn exec_self(flag: &str, fd: RawFd) -> SepwireError {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return SepwireError::System(e),
    };
    let prog = CString::new(exe.as_os_str().as_encoded_bytes()).expect("no NUL in exe path");
    let flag = CString::new(flag).expect("static flag");
    let arg = CString::new(fd.to_string()).expect("fd digits");
    match execv(&prog, &[prog.clone(), flag, arg]) {
        Ok(infallible) => match infallible {},
        Err(e) => sys(e),
    }
}

/// Derive the public key, the protocol hashes and the per-peer mac1
/// and cookie keys an interface needs.
fn derive_keys(cfg: IfnConfig) -> DerivedIfn {
    let pubkey = cfg.privkey.public_key();
    let peer_keys = cfg
        .peers
        .iter()
        .map(|p| (noise::mac1_key(&p.pubkey), noise::cookie_key(&p.pubkey)))
        .collect();
    DerivedIfn {
        pubkeyhash: noise::pubkey_hash(&pubkey),
        mac1key: noise::mac1_key(&pubkey),
        cookiekey: noise::cookie_key(&pubkey),
        pubkey,
        peer_keys,
        cfg,
    }
}

/// Bootstrap. On success this never returns: the process image is
/// replaced by the supervisor. The only ordinary return is after `-n`.
pub fn run(opts: Options) -> Result<()> {
    // fixed by the protocol; a layout mistake must not reach a socket
    assert_eq!(Initiation::SIZE, 148);
    assert_eq!(Response::SIZE, 92);
    assert_eq!(CookieReply::SIZE, 64);
    assert_eq!(DataHeader::SIZE, 16);

    let path = opts
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let cfg = Config::from_file(&path)?;

    if opts.configtest {
        println!("configuration OK");
        return Ok(());
    }

    if !nix::unistd::geteuid().is_root() {
        return Err(SepwireError::System(std::io::Error::new(
            ErrorKind::PermissionDenied,
            "must run as the superuser",
        )));
    }

    let user = nix::unistd::User::from_name(&cfg.user)
        .map_err(sys)?
        .ok_or(ConfigError::UnknownId {
            name: cfg.user.clone(),
        })?;
    let (uid, gid) = (user.uid.as_raw(), user.gid.as_raw());

    let background = !opts.foreground;
    if background {
        // keep stderr for the log stream
        nix::unistd::daemon(false, true).map_err(sys)?;
    }
    privsep::init_logging("master", opts.verbose);

    let ifns: Vec<DerivedIfn> = cfg.ifns.into_iter().map(derive_keys).collect();

    // fork one worker per interface; each keeps only its own triple of
    // channel descriptors
    let mut ifn_mast: Vec<IpcChannel> = Vec::with_capacity(ifns.len());
    let mut ifn_encl: Vec<IpcChannel> = Vec::with_capacity(ifns.len());
    let mut ifn_prox: Vec<IpcChannel> = Vec::with_capacity(ifns.len());
    let mut worker_fds: Vec<WorkerFds> = Vec::with_capacity(ifns.len());

    for ifn in &ifns {
        let (mast_p, mast_c) = IpcChannel::pair()?;
        let (encl_p, encl_c) = IpcChannel::pair()?;
        let (prox_p, prox_c) = IpcChannel::pair()?;

        // everything the worker must not inherit
        let mut parent_side: Vec<RawFd> = Vec::new();
        for chan in ifn_mast.iter().chain(&ifn_encl).chain(&ifn_prox) {
            parent_side.push(chan.as_raw_fd());
        }
        parent_side.push(mast_p.as_raw_fd());
        parent_side.push(encl_p.as_raw_fd());
        parent_side.push(prox_p.as_raw_fd());

        match unsafe { fork() }.map_err(sys)? {
            ForkResult::Child => {
                close_fds(&parent_side);
                let err = exec_self("-I", mast_c.as_raw_fd());
                eprintln!("sepwire: worker exec: {err}");
                std::process::exit(1);
            }
            ForkResult::Parent { child } => {
                tracing::debug!(ifn = %ifn.cfg.name, pid = %child, "worker forked");
                worker_fds.push(WorkerFds {
                    encl: encl_c.as_raw_fd(),
                    prox: prox_c.as_raw_fd(),
                });
                // the worker holds the child sides now
                drop(mast_c);
                drop(encl_c);
                drop(prox_c);
                ifn_mast.push(mast_p);
                ifn_encl.push(encl_p);
                ifn_prox.push(prox_p);
            }
        }
    }

    // channels between master, enclave and proxy
    let (mast_encl_p, mast_encl_c) = IpcChannel::pair()?;
    let (mast_prox_p, mast_prox_c) = IpcChannel::pair()?;
    let (encl_prox_e, encl_prox_p) = IpcChannel::pair()?;

    // fork the enclave: it keeps its master channel, its proxy channel
    // and the enclave side of every worker channel
    {
        let close_in_child: Vec<RawFd> = ifn_mast
            .iter()
            .chain(&ifn_prox)
            .map(|c| c.as_raw_fd())
            .chain([
                mast_encl_p.as_raw_fd(),
                mast_prox_p.as_raw_fd(),
                mast_prox_c.as_raw_fd(),
                encl_prox_p.as_raw_fd(),
            ])
            .collect();

        match unsafe { fork() }.map_err(sys)? {
            ForkResult::Child => {
                close_fds(&close_in_child);
                let err = exec_self("-E", mast_encl_c.as_raw_fd());
                eprintln!("sepwire: enclave exec: {err}");
                std::process::exit(1);
            }
            ForkResult::Parent { child } => {
                tracing::debug!(pid = %child, "enclave forked");
            }
        }
    }
    let encl_fds = EnclaveFds {
        proxport: encl_prox_e.as_raw_fd(),
        ifnports: ifn_encl.iter().map(|c| c.as_raw_fd()).collect(),
    };
    drop(mast_encl_c);
    drop(encl_prox_e);
    ifn_encl.clear();

    // fork the proxy: it keeps its master channel, its enclave channel
    // and the proxy side of every worker channel
    {
        let close_in_child: Vec<RawFd> = ifn_mast
            .iter()
            .map(|c| c.as_raw_fd())
            .chain([mast_encl_p.as_raw_fd(), mast_prox_p.as_raw_fd()])
            .collect();

        match unsafe { fork() }.map_err(sys)? {
            ForkResult::Child => {
                close_fds(&close_in_child);
                let err = exec_self("-P", mast_prox_c.as_raw_fd());
                eprintln!("sepwire: proxy exec: {err}");
                std::process::exit(1);
            }
            ForkResult::Parent { child } => {
                tracing::debug!(pid = %child, "proxy forked");
            }
        }
    }
    let prox_fds = ProxyFds {
        enclport: encl_prox_p.as_raw_fd(),
        ifnports: ifn_prox.iter().map(|c| c.as_raw_fd()).collect(),
    };
    drop(mast_prox_c);
    drop(encl_prox_p);
    ifn_prox.clear();

    // hand each process its role-minimized slice of the configuration
    let common = SInitCommon {
        background,
        verbose: opts.verbose,
        uid,
        gid,
    };
    send_config_enclave(&mast_encl_p, &common, &encl_fds, &ifns)?;
    send_config_proxy(&mast_prox_p, &common, &prox_fds, &ifns)?;
    for (n, ifn) in ifns.iter().enumerate() {
        send_config_worker(&ifn_mast[n], &common, &worker_fds[n], n as u32, ifn)?;
    }

    // pump the surviving descriptors to our future self over a stream,
    // then re-exec to expunge every secret from this address space
    let (sv_here, sv_next) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(sys)?;

    write_i32(sv_here.as_raw_fd(), mast_encl_p.as_raw_fd())?;
    write_i32(sv_here.as_raw_fd(), mast_prox_p.as_raw_fd())?;
    write_i32(sv_here.as_raw_fd(), ifn_mast.len() as i32)?;
    for chan in &ifn_mast {
        write_i32(sv_here.as_raw_fd(), chan.as_raw_fd())?;
    }
    drop(sv_here);

    let err = exec_self("-M", sv_next.as_raw_fd());
    tracing::error!(%err, "supervisor re-exec impossible");
    std::process::exit(3);
}

struct SInitCommon {
    background: bool,
    verbose: i32,
    uid: u32,
    gid: u32,
}

struct EnclaveFds {
    proxport: RawFd,
    ifnports: Vec<RawFd>,
}

struct ProxyFds {
    enclport: RawFd,
    ifnports: Vec<RawFd>,
}

/// The enclave gets every key but no addresses.
fn send_config_enclave(
    chan: &IpcChannel,
    common: &SInitCommon,
    fds: &EnclaveFds,
    ifns: &[DerivedIfn],
) -> Result<()> {
    let sinit = SInit {
        background: common.background,
        verbose: common.verbose,
        uid: common.uid,
        gid: common.gid,
        enclport: -1,
        proxport: fds.proxport,
        nifns: ifns.len() as u32,
    };
    chan.send_plain(MsgType::SInit, &sinit.to_bytes())?;

    for (n, ifn) in ifns.iter().enumerate() {
        let sifn = SIfn {
            ifnid: n as u32,
            ifnport: fds.ifnports[n],
            ifname: ifn.cfg.name.clone(),
            ifdesc: ifn.cfg.description.clone(),
            privkey: *ifn.cfg.privkey.expose(),
            pubkey: ifn.pubkey,
            pubkeyhash: ifn.pubkeyhash,
            mac1key: ifn.mac1key,
            cookiekey: ifn.cookiekey,
            nifaddrs: 0,
            nlistenaddrs: 0,
            npeers: ifn.cfg.peers.len() as u32,
        };
        chan.send_plain(MsgType::SIfn, &sifn.to_bytes())?;

        for (m, peer) in ifn.cfg.peers.iter().enumerate() {
            let speer = SPeer {
                ifnid: n as u32,
                peerid: m as u32,
                name: peer.name.clone(),
                endpoint: peer.endpoint,
                psk: *peer.psk.expose(),
                pubkey: peer.pubkey,
                mac1key: ifn.peer_keys[m].0,
                cookiekey: [0u8; 32],
                nallowedips: 0,
            };
            chan.send_plain(MsgType::SPeer, &speer.to_bytes())?;
        }
    }
    Ok(())
}

/// The proxy gets mac1/cookie keys and listen addresses, nothing
/// per-peer.
fn send_config_proxy(
    chan: &IpcChannel,
    common: &SInitCommon,
    fds: &ProxyFds,
    ifns: &[DerivedIfn],
) -> Result<()> {
    let sinit = SInit {
        background: common.background,
        verbose: common.verbose,
        uid: common.uid,
        gid: common.gid,
        enclport: fds.enclport,
        proxport: -1,
        nifns: ifns.len() as u32,
    };
    chan.send_plain(MsgType::SInit, &sinit.to_bytes())?;

    for (n, ifn) in ifns.iter().enumerate() {
        let sifn = SIfn {
            ifnid: n as u32,
            ifnport: fds.ifnports[n],
            ifname: ifn.cfg.name.clone(),
            ifdesc: String::new(),
            privkey: [0u8; 32],
            pubkey: [0u8; 32],
            pubkeyhash: [0u8; 32],
            mac1key: ifn.mac1key,
            cookiekey: ifn.cookiekey,
            nifaddrs: 0,
            nlistenaddrs: ifn.cfg.listen_addrs.len() as u32,
            npeers: 0,
        };
        chan.send_plain(MsgType::SIfn, &sifn.to_bytes())?;

        for &addr in &ifn.cfg.listen_addrs {
            let ca = SCidrAddr {
                ifnid: n as u32,
                peerid: 0,
                addr,
                prefixlen: 0,
            };
            chan.send_plain(MsgType::SCidrAddr, &ca.to_bytes())?;
        }
    }
    Ok(())
}

/// A worker gets everything it needs to route and filter, but no
/// static keys; peer public keys are folded into cookie keys here.
fn send_config_worker(
    chan: &IpcChannel,
    common: &SInitCommon,
    fds: &WorkerFds,
    n: u32,
    ifn: &DerivedIfn,
) -> Result<()> {
    let sinit = SInit {
        background: common.background,
        verbose: common.verbose,
        uid: common.uid,
        gid: common.gid,
        enclport: fds.encl,
        proxport: fds.prox,
        nifns: 1,
    };
    chan.send_plain(MsgType::SInit, &sinit.to_bytes())?;

    let sifn = SIfn {
        ifnid: n,
        ifnport: -1,
        ifname: ifn.cfg.name.clone(),
        ifdesc: ifn.cfg.description.clone(),
        privkey: [0u8; 32],
        pubkey: [0u8; 32],
        pubkeyhash: [0u8; 32],
        mac1key: ifn.mac1key,
        cookiekey: ifn.cookiekey,
        nifaddrs: ifn.cfg.addrs.len() as u32,
        nlistenaddrs: ifn.cfg.listen_addrs.len() as u32,
        npeers: ifn.cfg.peers.len() as u32,
    };
    chan.send_plain(MsgType::SIfn, &sifn.to_bytes())?;

    for net in &ifn.cfg.addrs {
        let ca = SCidrAddr {
            ifnid: n,
            peerid: 0,
            addr: std::net::SocketAddr::new(net.addr(), 0),
            prefixlen: net.prefix_len(),
        };
        chan.send_plain(MsgType::SCidrAddr, &ca.to_bytes())?;
    }
    for &addr in &ifn.cfg.listen_addrs {
        let ca = SCidrAddr {
            ifnid: n,
            peerid: 0,
            addr,
            prefixlen: 0,
        };
        chan.send_plain(MsgType::SCidrAddr, &ca.to_bytes())?;
    }

    for (m, peer) in ifn.cfg.peers.iter().enumerate() {
        let speer = SPeer {
            ifnid: n,
            peerid: m as u32,
            name: peer.name.clone(),
            endpoint: peer.endpoint,
            psk: [0u8; 32],
            pubkey: [0u8; 32],
            mac1key: [0u8; 32],
            cookiekey: ifn.peer_keys[m].1,
            nallowedips: peer.allowed_ips.len() as u32,
        };
        chan.send_plain(MsgType::SPeer, &speer.to_bytes())?;

        for net in &peer.allowed_ips {
            let ca = SCidrAddr {
                ifnid: n,
                peerid: m as u32,
                addr: std::net::SocketAddr::new(net.addr(), 0),
                prefixlen: net.prefix_len(),
            };
            chan.send_plain(MsgType::SCidrAddr, &ca.to_bytes())?;
        }
    }
    Ok(())
}

fn write_i32(fd: RawFd, value: i32) -> Result<()> {
    let bytes = value.to_le_bytes();
    let mut off = 0;
    while off < bytes.len() {
        off += nix::unistd::write(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
            &bytes[off..],
        )
        .map_err(sys)?;
    }
    Ok(())
}

fn read_i32(fd: RawFd) -> Result<i32> {
    let mut bytes = [0u8; 4];
    let mut off = 0;
    while off < bytes.len() {
        let n = nix::unistd::read(fd, &mut bytes[off..]).map_err(sys)?;
        if n == 0 {
            return Err(SepwireError::System(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "short descriptor handoff",
            )));
        }
        off += n;
    }
    Ok(i32::from_le_bytes(bytes))
}

static GOT_TERM: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term(_: i32) {
    GOT_TERM.store(true, Ordering::SeqCst);
}

/// The re-exec'd supervisor image (`-M <fd>`): adopt the child
/// channels, release the children into service, wait for the first
/// death, tear the group down.
pub fn supervise(streamfd: RawFd) -> Result<()> {
    privsep::init_logging("master", 0);
    privsep::chroot_empty()?;

    unsafe {
        signal::signal(Signal::SIGUSR1, SigHandler::SigIgn).map_err(sys)?;
        signal::signal(Signal::SIGTERM, SigHandler::Handler(on_term)).map_err(sys)?;
    }

    let encl = unsafe { IpcChannel::from_raw_fd(read_i32(streamfd)?) };
    let prox = unsafe { IpcChannel::from_raw_fd(read_i32(streamfd)?) };
    let nifns = read_i32(streamfd)?;
    let mut workers = Vec::with_capacity(nifns as usize);
    for _ in 0..nifns {
        workers.push(unsafe { IpcChannel::from_raw_fd(read_i32(streamfd)?) });
    }
    let _ = nix::unistd::close(streamfd);

    // only now may the children touch untrusted input
    encl.send_plain(MsgType::SEos, &[])?;
    prox.send_plain(MsgType::SEos, &[])?;
    for chan in &workers {
        chan.send_plain(MsgType::SEos, &[])?;
    }
    tracing::info!(workers = workers.len(), "startup complete");

    match waitpid(Pid::from_raw(-1), None) {
        Ok(WaitStatus::Exited(pid, code)) => {
            tracing::warn!(%pid, code, "child exited");
        }
        Ok(WaitStatus::Signaled(pid, sig, core)) => {
            tracing::warn!(%pid, %sig, core, "child killed by signal");
        }
        Ok(status) => {
            tracing::warn!(?status, "unexpected child status");
        }
        Err(nix::errno::Errno::EINTR) if GOT_TERM.load(Ordering::SeqCst) => {
            tracing::info!("received termination signal, shutting down");
        }
        Err(e) => return Err(sys(e)),
    }

    // our own handler only sets a flag, so signalling the group does
    // not cut this exit short
    killpg(getpgrp(), Signal::SIGTERM).map_err(sys)?;
    Ok(())
}
