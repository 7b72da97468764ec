//! Internal datagram channels
//!
//! Every pair of processes that must talk shares a pre-opened
//! `SOCK_DGRAM` Unix socketpair. Three envelope shapes exist:
//!
//! - plain: `mtcode | payload` (master to child, startup only)
//! - peer: `peerid | mtcode | payload` (enclave and IFN)
//! - proxy: `ifnid | local | remote | mtcode | payload` (anything the
//!   proxy relays; carries the observed 5-tuple, and for `ConnReq`
//!   towards an IFN, one passed descriptor via `SCM_RIGHTS`)
//!
//! Datagrams on these channels come from sibling processes; anything
//! malformed here is a protocol violation and fatal to the receiver.

use std::io::{IoSlice, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use tokio::io::unix::AsyncFd;
use zeroize::Zeroize;

use super::MsgType;
use crate::error::IpcError;

/// Scratch buffer size for one internal datagram; comfortably above the
/// proxy envelope plus a maximum-size UDP frame.
pub const SCRATCH: usize = 4096;

/// Encoded socket address: family, port, address bytes, scope id.
pub const SOCKADDR_LEN: usize = 23;

const PEER_HDR: usize = 5;
const PROXY_HDR: usize = 4 + 2 * SOCKADDR_LEN + 1;

/// Encode an optional socket address into its fixed 23-byte form.
pub fn encode_sockaddr(sa: Option<SocketAddr>, out: &mut [u8]) {
    out[..SOCKADDR_LEN].fill(0);
    let Some(sa) = sa else { return };
    out[1..3].copy_from_slice(&sa.port().to_le_bytes());
    match sa.ip() {
        IpAddr::V4(ip) => {
            out[0] = 4;
            out[3..7].copy_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out[0] = 6;
            out[3..19].copy_from_slice(&ip.octets());
            if let SocketAddr::V6(sa6) = sa {
                out[19..23].copy_from_slice(&sa6.scope_id().to_le_bytes());
            }
        }
    }
}

/// Decode the fixed 23-byte socket address form.
pub fn decode_sockaddr(data: &[u8]) -> Result<Option<SocketAddr>, IpcError> {
    if data.len() < SOCKADDR_LEN {
        return Err(IpcError::ShortMessage {
            expected: SOCKADDR_LEN,
            got: data.len(),
        });
    }
    let port = u16::from_le_bytes(data[1..3].try_into().unwrap());
    match data[0] {
        0 => Ok(None),
        4 => {
            let ip = Ipv4Addr::from(<[u8; 4]>::try_from(&data[3..7]).unwrap());
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        6 => {
            let ip = Ipv6Addr::from(<[u8; 16]>::try_from(&data[3..19]).unwrap());
            let scope = u32::from_le_bytes(data[19..23].try_into().unwrap());
            Ok(Some(SocketAddr::V6(std::net::SocketAddrV6::new(
                ip, port, 0, scope,
            ))))
        }
        other => Err(IpcError::UnexpectedMessage { mtcode: other }),
    }
}

/// Session keys travelling enclave to IFN. The key material is wiped on
/// drop; the enclave drops its copy as soon as the send completes.
#[derive(Debug)]
pub struct SessKeys {
    pub sessid: u32,
    pub peersessid: u32,
    pub sendkey: [u8; 32],
    pub recvkey: [u8; 32],
}

impl SessKeys {
    pub const SIZE: usize = 72;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.sessid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.peersessid.to_le_bytes());
        buf[8..40].copy_from_slice(&self.sendkey);
        buf[40..72].copy_from_slice(&self.recvkey);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, IpcError> {
        if data.len() != Self::SIZE {
            return Err(IpcError::ShortMessage {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            sessid: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            peersessid: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            sendkey: data[8..40].try_into().unwrap(),
            recvkey: data[40..72].try_into().unwrap(),
        })
    }
}

impl Drop for SessKeys {
    fn drop(&mut self) {
        self.sendkey.zeroize();
        self.recvkey.zeroize();
    }
}

/// Flow pin request: bind a connected UDP socket on `(local, remote)`
/// for `peerid`. Travels enclave to proxy, then proxy to IFN with the
/// socket attached. A local port of 0 or an unspecified local address
/// asks the proxy to substitute its first listen address of matching
/// family.
#[derive(Debug, Clone, Copy)]
pub struct ConnReq {
    pub peerid: u32,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl ConnReq {
    pub const SIZE: usize = 4 + 2 * SOCKADDR_LEN;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.peerid.to_le_bytes());
        encode_sockaddr(Some(self.local), &mut buf[4..4 + SOCKADDR_LEN]);
        encode_sockaddr(Some(self.remote), &mut buf[4 + SOCKADDR_LEN..]);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, IpcError> {
        if data.len() != Self::SIZE {
            return Err(IpcError::ShortMessage {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        let peerid = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let local = decode_sockaddr(&data[4..4 + SOCKADDR_LEN])?;
        let remote = decode_sockaddr(&data[4 + SOCKADDR_LEN..])?;
        match (local, remote) {
            (Some(local), Some(remote)) => Ok(Self {
                peerid,
                local,
                remote,
            }),
            _ => Err(IpcError::UnexpectedMessage {
                mtcode: MsgType::ConnReq as u8,
            }),
        }
    }
}

/// The family-matched wildcard address, used in a `ConnReq` when the
/// sender wants the proxy to pick the local listen address itself.
pub fn wildcard_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// The 5-tuple envelope on proxy channels.
#[derive(Debug, Clone, Copy)]
pub struct ProxyEnvelope {
    pub ifnid: u32,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

pub fn frame_plain(mt: MsgType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(mt as u8);
    buf.extend_from_slice(payload);
    buf
}

pub fn frame_peer(peerid: u32, mt: MsgType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PEER_HDR + payload.len());
    buf.extend_from_slice(&peerid.to_le_bytes());
    buf.push(mt as u8);
    buf.extend_from_slice(payload);
    buf
}

pub fn frame_proxy(env: &ProxyEnvelope, mt: MsgType, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; PROXY_HDR];
    buf[0..4].copy_from_slice(&env.ifnid.to_le_bytes());
    encode_sockaddr(env.local, &mut buf[4..4 + SOCKADDR_LEN]);
    encode_sockaddr(env.remote, &mut buf[4 + SOCKADDR_LEN..4 + 2 * SOCKADDR_LEN]);
    buf[PROXY_HDR - 1] = mt as u8;
    buf.extend_from_slice(payload);
    buf
}

fn checked(mt: MsgType, payload: &[u8]) -> Result<(), IpcError> {
    super::check_payload_size(mt, payload.len()).map_err(|_| {
        let (expected, _) = super::payload_size(mt);
        IpcError::ShortMessage {
            expected,
            got: payload.len(),
        }
    })
}

pub fn parse_plain(data: &[u8]) -> Result<(MsgType, &[u8]), IpcError> {
    if data.is_empty() {
        return Err(IpcError::ShortMessage {
            expected: 1,
            got: 0,
        });
    }
    let mt = MsgType::try_from(data[0]).map_err(|_| IpcError::UnexpectedMessage {
        mtcode: data[0],
    })?;
    let payload = &data[1..];
    checked(mt, payload)?;
    Ok((mt, payload))
}

pub fn parse_peer(data: &[u8]) -> Result<(u32, MsgType, &[u8]), IpcError> {
    if data.len() < PEER_HDR {
        return Err(IpcError::ShortMessage {
            expected: PEER_HDR,
            got: data.len(),
        });
    }
    let peerid = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let mt = MsgType::try_from(data[4]).map_err(|_| IpcError::UnexpectedMessage {
        mtcode: data[4],
    })?;
    let payload = &data[PEER_HDR..];
    checked(mt, payload)?;
    Ok((peerid, mt, payload))
}

pub fn parse_proxy(data: &[u8]) -> Result<(ProxyEnvelope, MsgType, &[u8]), IpcError> {
    if data.len() < PROXY_HDR {
        return Err(IpcError::ShortMessage {
            expected: PROXY_HDR,
            got: data.len(),
        });
    }
    let ifnid = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let local = decode_sockaddr(&data[4..4 + SOCKADDR_LEN])?;
    let remote = decode_sockaddr(&data[4 + SOCKADDR_LEN..4 + 2 * SOCKADDR_LEN])?;
    let code = data[PROXY_HDR - 1];
    let mt =
        MsgType::try_from(code).map_err(|_| IpcError::UnexpectedMessage { mtcode: code })?;
    let payload = &data[PROXY_HDR..];
    checked(mt, payload)?;
    Ok((
        ProxyEnvelope {
            ifnid,
            local,
            remote,
        },
        mt,
        payload,
    ))
}

/// One end of a pre-opened datagram socketpair.
///
/// Synchronous by default (master and the startup phase); event loops
/// wrap it in [`AsyncIpc`].
#[derive(Debug)]
pub struct IpcChannel {
    fd: OwnedFd,
}

impl IpcChannel {
    /// Adopt an inherited descriptor (the `-E`/`-I`/`-P`/`-M` fd).
    ///
    /// # Safety
    /// `fd` must be an open descriptor owned by the caller.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    pub fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// A connected socketpair. Descriptors are inheritable: they must
    /// survive the fork+exec into the child images.
    pub fn pair() -> Result<(Self, Self), IpcError> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .map_err(std::io::Error::from)?;
        Ok((Self { fd: a }, Self { fd: b }))
    }

    pub fn set_nonblocking(&self) -> Result<(), IpcError> {
        use nix::fcntl::{fcntl, FcntlArg, OFlag};
        let flags = fcntl(self.fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(self.fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Send one datagram, optionally attaching a descriptor.
    pub fn send_raw(&self, data: &[u8], fd: Option<BorrowedFd<'_>>) -> std::io::Result<()> {
        let iov = [IoSlice::new(data)];
        let raw_fds = fd.map(|fd| [fd.as_raw_fd()]);
        let scm = raw_fds
            .as_ref()
            .map(|fds| [ControlMessage::ScmRights(fds)]);
        let cmsgs: &[ControlMessage] = scm.as_ref().map(|a| &a[..]).unwrap_or(&[]);

        let sent = sendmsg::<()>(self.fd.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
            .map_err(std::io::Error::from)?;
        if sent != data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short datagram write",
            ));
        }
        Ok(())
    }

    /// Receive one datagram; returns its length and any passed
    /// descriptor.
    pub fn recv_raw(&self, buf: &mut [u8]) -> std::io::Result<(usize, Option<OwnedFd>)> {
        let mut iov = [IoSliceMut::new(buf)];
        let mut cmsg = nix::cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )
        .map_err(std::io::Error::from)?;
        let n = msg.bytes;
        let mut passed = None;
        if let Ok(cmsgs) = msg.cmsgs() {
            for c in cmsgs {
                if let ControlMessageOwned::ScmRights(fds) = c {
                    for fd in fds {
                        // one descriptor per ConnReq; extras would leak
                        if passed.is_none() {
                            passed = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                        } else {
                            drop(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }
            }
        }
        Ok((n, passed))
    }

    pub fn send_plain(&self, mt: MsgType, payload: &[u8]) -> Result<(), IpcError> {
        self.send_raw(&frame_plain(mt, payload), None)
            .map_err(IpcError::from)
    }

    pub fn recv_plain<'a>(&self, buf: &'a mut [u8]) -> Result<(MsgType, &'a [u8]), IpcError> {
        let (n, _) = self.recv_raw(buf)?;
        parse_plain(&buf[..n])
    }

    pub fn send_peer(&self, peerid: u32, mt: MsgType, payload: &[u8]) -> Result<(), IpcError> {
        self.send_raw(&frame_peer(peerid, mt, payload), None)
            .map_err(IpcError::from)
    }

    pub fn recv_peer<'a>(
        &self,
        buf: &'a mut [u8],
    ) -> Result<(u32, MsgType, &'a [u8]), IpcError> {
        let (n, _) = self.recv_raw(buf)?;
        parse_peer(&buf[..n])
    }
}

impl AsRawFd for IpcChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for IpcChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Readiness-driven wrapper used inside the per-process event loops.
#[derive(Debug)]
pub struct AsyncIpc {
    inner: AsyncFd<IpcChannel>,
}

impl AsyncIpc {
    pub fn new(channel: IpcChannel) -> Result<Self, IpcError> {
        channel.set_nonblocking()?;
        Ok(Self {
            inner: AsyncFd::new(channel).map_err(IpcError::from)?,
        })
    }

    pub fn get_ref(&self) -> &IpcChannel {
        self.inner.get_ref()
    }

    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, Option<OwnedFd>)> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|ch| ch.get_ref().recv_raw(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn send(&self, data: &[u8], fd: Option<BorrowedFd<'_>>) -> std::io::Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|ch| ch.get_ref().send_raw(data, fd)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Poll-based receive, for multiplexing a dynamic set of channels
    /// inside one `poll_fn`.
    pub fn poll_recv(
        &self,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<(usize, Option<OwnedFd>)>> {
        loop {
            let mut guard = std::task::ready!(self.inner.poll_read_ready(cx))?;
            match guard.try_io(|ch| ch.get_ref().recv_raw(buf)) {
                Ok(result) => return std::task::Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_codec_roundtrip() {
        let mut buf = [0u8; SOCKADDR_LEN];

        let v4: SocketAddr = "192.0.2.7:51820".parse().unwrap();
        encode_sockaddr(Some(v4), &mut buf);
        assert_eq!(decode_sockaddr(&buf).unwrap(), Some(v4));

        let v6: SocketAddr = "[2001:db8::1]:7777".parse().unwrap();
        encode_sockaddr(Some(v6), &mut buf);
        assert_eq!(decode_sockaddr(&buf).unwrap(), Some(v6));

        encode_sockaddr(None, &mut buf);
        assert_eq!(decode_sockaddr(&buf).unwrap(), None);
    }

    #[test]
    fn peer_frame_roundtrip() {
        let keys = SessKeys {
            sessid: 7,
            peersessid: 9,
            sendkey: [1u8; 32],
            recvkey: [2u8; 32],
        };
        let frame = frame_peer(3, MsgType::SessKeys, &keys.to_bytes());
        let (peerid, mt, payload) = parse_peer(&frame).unwrap();
        assert_eq!(peerid, 3);
        assert_eq!(mt, MsgType::SessKeys);
        let parsed = SessKeys::from_bytes(payload).unwrap();
        assert_eq!(parsed.sessid, 7);
        assert_eq!(parsed.peersessid, 9);
        assert_eq!(parsed.sendkey, [1u8; 32]);
    }

    #[test]
    fn proxy_frame_roundtrip() {
        let env = ProxyEnvelope {
            ifnid: 2,
            local: Some("10.0.0.1:51820".parse().unwrap()),
            remote: Some("203.0.113.9:12345".parse().unwrap()),
        };
        let payload = [0u8; 148];
        let mut framed = frame_proxy(&env, MsgType::WgInit, &payload);
        framed[PROXY_HDR + 4] = 0xFF; // payload content is opaque here
        let (parsed, mt, body) = parse_proxy(&framed).unwrap();
        assert_eq!(parsed.ifnid, 2);
        assert_eq!(parsed.local, env.local);
        assert_eq!(parsed.remote, env.remote);
        assert_eq!(mt, MsgType::WgInit);
        assert_eq!(body.len(), 148);
    }

    #[test]
    fn short_internal_datagram_is_an_error() {
        assert!(parse_peer(&[1, 2, 3]).is_err());
        let frame = frame_peer(1, MsgType::SessKeys, &[0u8; 10]);
        assert!(parse_peer(&frame).is_err());
    }

    #[test]
    fn socketpair_send_recv() {
        let (a, b) = IpcChannel::pair().unwrap();
        a.send_peer(5, MsgType::ReqWgInit, &[]).unwrap();
        let mut buf = [0u8; SCRATCH];
        let (peerid, mt, payload) = b.recv_peer(&mut buf).unwrap();
        assert_eq!(peerid, 5);
        assert_eq!(mt, MsgType::ReqWgInit);
        assert!(payload.is_empty());
    }

    #[test]
    fn descriptor_passing_roundtrip() {
        let (a, b) = IpcChannel::pair().unwrap();
        let (x, y) = IpcChannel::pair().unwrap();

        // hand x's descriptor from a to b
        a.send_raw(b"flow", Some(x.as_fd())).unwrap();
        let mut buf = [0u8; 16];
        let (n, passed) = b.recv_raw(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"flow");
        let passed = IpcChannel::from_owned(passed.expect("descriptor attached"));

        // the passed descriptor is x: traffic from y arrives on it
        y.send_raw(b"ping", None).unwrap();
        let (n, none) = passed.recv_raw(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert!(none.is_none());
    }
}
