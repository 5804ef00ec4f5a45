//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The connection layer (§4.C6): a framed, non-blocking wrapper around a TCP
//! socket with partial-read/partial-write tolerance, an optional TCP MD5
//! signature option, and a bounded outgoing ring that implements the
//! backpressure contract of §4.C9/§5.

use std::io;
use std::net::{IpAddr, SocketAddr};

use bytes::BytesMut;
use socket2::{Domain, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::error::IoError;
use crate::packet::attribute::{DecodeCxt, EncodeCxt};
use crate::packet::cache::AttributeCache;
use crate::packet::error::DecodeError;
use crate::packet::message::Message;

/// Outgoing ring high-water mark: above this many buffered bytes, Adj-RIB-Out
/// draining for this peer is suspended (§4.C9 "Backpressure").
pub const RING_HIGH_WATERMARK: usize = 1 << 20;
/// Outgoing ring low-water mark: draining resumes once the ring falls below
/// this many buffered bytes.
pub const RING_LOW_WATERMARK: usize = 1 << 16;

/// Information about a peer's TCP connection, as reported at accept/connect
/// time: used by `open_validate`-adjacent checks (shared-subnet detection)
/// and by `show neighbor`.
#[derive(Clone, Copy, Debug)]
pub struct ConnInfo {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

/// Which side initiated this TCP connection; load-bearing for RFC 4271 §6.8
/// collision resolution (§4.C8 "Collision detection").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnDirection {
    /// We connected out to the peer.
    Active,
    /// The peer connected in to us.
    Passive,
}

/// A single framed BGP connection: buffers partial frames on read and
/// unwritten bytes on write, so every operation can be attempted without
/// blocking the reactor's single thread.
pub struct Connection {
    stream: TcpStream,
    pub direction: ConnDirection,
    pub info: ConnInfo,
    read_buf: BytesMut,
    write_ring: BytesMut,
}

impl Connection {
    fn new(stream: TcpStream, direction: ConnDirection, info: ConnInfo) -> Connection {
        Connection {
            stream,
            direction,
            info,
            read_buf: BytesMut::with_capacity(4096),
            write_ring: BytesMut::new(),
        }
    }

    /// Opens an outgoing TCP connection to `remote`, applying the optional
    /// MD5 signature and TTL-security options before the connect attempt, as
    /// required for external peers beyond a single hop (§5 "File
    /// descriptors and sockets").
    pub async fn connect(
        local_addr: Option<IpAddr>,
        remote: SocketAddr,
        md5_key: Option<&str>,
        ttl: Option<u8>,
    ) -> Result<Connection, IoError> {
        let domain = if remote.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None).map_err(IoError::TcpSocket)?;
        socket.set_nonblocking(true).map_err(IoError::TcpSocket)?;
        if let Some(local_addr) = local_addr {
            let bind_addr = SocketAddr::new(local_addr, 0);
            socket.bind(&bind_addr.into()).map_err(IoError::TcpConnect)?;
        }
        if let Some(key) = md5_key {
            apply_md5_signature(&socket, remote, key)?;
        }
        if let Some(ttl) = ttl {
            socket.set_ttl(ttl as u32).map_err(IoError::TcpAuth)?;
        }
        match socket.connect(&remote.into()) {
            Ok(()) => {}
            Err(error) if error.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(error) => return Err(IoError::TcpConnect(error)),
        }
        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream).map_err(IoError::TcpConnect)?;
        stream.writable().await.map_err(IoError::TcpConnect)?;
        if let Some(error) = stream.take_error().map_err(IoError::TcpConnect)? {
            return Err(IoError::TcpConnect(error));
        }
        let local_addr = stream.local_addr().map_err(IoError::TcpInfo)?;
        let remote_addr = stream.peer_addr().map_err(IoError::TcpInfo)?;
        Ok(Connection::new(
            stream,
            ConnDirection::Active,
            ConnInfo { local_addr, remote_addr },
        ))
    }

    /// Wraps a socket handed to us by [`Listener::accept`].
    fn accepted(stream: TcpStream, md5_key: Option<&str>) -> Result<Connection, IoError> {
        stream.set_nodelay(true).map_err(IoError::TcpAccept)?;
        let local_addr = stream.local_addr().map_err(IoError::TcpInfo)?;
        let remote_addr = stream.peer_addr().map_err(IoError::TcpInfo)?;
        if let Some(key) = md5_key {
            let socket = socket2::SockRef::from(&stream);
            apply_md5_signature_ref(&socket, remote_addr, key)?;
        }
        Ok(Connection::new(
            stream,
            ConnDirection::Passive,
            ConnInfo { local_addr, remote_addr },
        ))
    }

    /// Reads and decodes as many complete frames as are currently available
    /// without blocking. Returns an empty vector (not an error) when the
    /// socket would block; returns `Err` on a hard I/O failure or a decode
    /// failure within a frame, at which point the connection should be torn
    /// down by the caller.
    pub fn try_recv(
        &mut self,
        max_message_size: usize,
        dcxt: &DecodeCxt,
        cache: &mut AttributeCache,
    ) -> Result<Vec<Message>, RecvError> {
        let mut messages = Vec::new();
        loop {
            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Err(RecvError::Closed),
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(RecvError::Io(error)),
            }
        }
        loop {
            match Message::decode(&mut self.read_buf, max_message_size, dcxt, cache) {
                Ok(Some(msg)) => messages.push(msg),
                Ok(None) => break,
                Err(error) => return Err(RecvError::Decode(error)),
            }
        }
        Ok(messages)
    }

    /// Appends an encoded message to the outgoing ring. Returns the ring's
    /// byte length after the append, so callers can compare against the
    /// watermarks.
    pub fn queue(&mut self, msg: &Message, cxt: EncodeCxt) -> usize {
        msg.encode(&mut self.write_ring, cxt);
        self.write_ring.len()
    }

    /// Flushes as much of the outgoing ring as the socket accepts without
    /// blocking. Returns `true` once the ring is fully drained.
    pub fn try_flush(&mut self) -> Result<bool, IoError> {
        while !self.write_ring.is_empty() {
            match self.stream.try_write(&self.write_ring) {
                Ok(n) => {
                    let _ = self.write_ring.split_to(n);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(false);
                }
                Err(error) => return Err(IoError::TcpSend(error)),
            }
        }
        Ok(true)
    }

    pub fn ring_len(&self) -> usize {
        self.write_ring.len()
    }

    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    pub async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }
}

/// Errors observed while reading frames from a peer connection.
#[derive(Debug)]
pub enum RecvError {
    Closed,
    Io(io::Error),
    Decode(DecodeError),
}

/// The BGP listener socket (§5 "the listener is `SO_REUSEPORT` where
/// available").
pub struct Listener {
    inner: TcpListener,
    md5_key: Option<String>,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, md5_key: Option<String>) -> Result<Listener, IoError> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None).map_err(IoError::TcpSocket)?;
        socket.set_reuse_address(true).map_err(IoError::TcpSocket)?;
        #[cfg(target_os = "linux")]
        socket.set_reuse_port(true).map_err(IoError::TcpSocket)?;
        socket.set_nonblocking(true).map_err(IoError::TcpSocket)?;
        socket.bind(&addr.into()).map_err(IoError::TcpSocket)?;
        socket.listen(1024).map_err(IoError::TcpSocket)?;
        let std_listener: std::net::TcpListener = socket.into();
        let inner = TcpListener::from_std(std_listener).map_err(IoError::TcpSocket)?;
        Ok(Listener { inner, md5_key })
    }

    /// Accepts one pending connection without blocking, if any is ready.
    pub fn try_accept(&self) -> Result<Option<(Connection, SocketAddr)>, IoError> {
        match self.inner.try_accept() {
            Ok((stream, remote)) => {
                let conn = Connection::accepted(stream, self.md5_key.as_deref())?;
                Ok(Some((conn, remote)))
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(IoError::TcpAccept(error)),
        }
    }

    pub async fn readable(&self) -> io::Result<()> {
        self.inner.ready(tokio::io::Interest::READABLE).await.map(|_| ())
    }
}

fn apply_md5_signature(socket: &Socket, remote: SocketAddr, key: &str) -> Result<(), IoError> {
    apply_md5_signature_ref(&socket2::SockRef::from(socket), remote, key)
}

/// Applies `TCP_MD5SIG` (RFC 2385) to the given socket for `remote`. Linux
/// only; the sockaddr/key layout matches `linux/tcp.h`'s `tcp_md5sig`.
#[cfg(target_os = "linux")]
fn apply_md5_signature_ref(
    socket: &socket2::SockRef<'_>,
    remote: SocketAddr,
    key: &str,
) -> Result<(), IoError> {
    use std::mem;
    use std::os::fd::AsRawFd;

    #[repr(C)]
    struct TcpMd5Sig {
        ss: libc::sockaddr_storage,
        flags: u16,
        prefixlen: u8,
        keylen: u8,
        ifindex: i32,
        key: [u8; 80],
    }

    const TCP_MD5SIG_EXT: libc::c_int = 14;

    let mut sig: TcpMd5Sig = unsafe { mem::zeroed() };
    match remote {
        SocketAddr::V4(addr) => {
            let sin: &mut libc::sockaddr_in =
                unsafe { &mut *(&mut sig.ss as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            let sin6: &mut libc::sockaddr_in6 =
                unsafe { &mut *(&mut sig.ss as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_addr.s6_addr = addr.ip().octets();
        }
    }
    let key_bytes = key.as_bytes();
    let keylen = key_bytes.len().min(sig.key.len());
    sig.key[..keylen].copy_from_slice(&key_bytes[..keylen]);
    sig.keylen = keylen as u8;

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            TCP_MD5SIG_EXT,
            &sig as *const _ as *const libc::c_void,
            mem::size_of::<TcpMd5Sig>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(IoError::TcpAuth(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_md5_signature_ref(
    _socket: &socket2::SockRef<'_>,
    _remote: SocketAddr,
    _key: &str,
) -> Result<(), IoError> {
    Err(IoError::TcpAuth(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP MD5 signature is only supported on Linux",
    )))
}

/// Builds a `TcpKeepalive` profile from the neighbor's configured interval.
/// Unused by default (BGP relies on its own hold-timer, not TCP keepalive),
/// kept for operators who want the belt-and-braces combination.
pub fn keepalive_profile(interval_secs: u64) -> TcpKeepalive {
    TcpKeepalive::new().with_time(std::time::Duration::from_secs(interval_secs))
}
