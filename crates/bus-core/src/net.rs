//! Non-blocking duplex byte buffer over one OS socket (TCP or UNIX).
//! Framing lives one layer up in the marshaler; this module only knows
//! about bytes in and bytes out.

use std::{
    collections::VecDeque,
    io::{self, IoSlice, Read, Write},
};

use mio::{
    Interest, Registry, Token,
    net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream, UnixListener as MioUnixListener, UnixStream as MioUnixStream},
};
use tracing::debug;

use crate::xmsg::XmsgBuffer;

const READ_CHUNK: usize = 32 * 1024;

pub trait ByteSink {
    fn extend(&mut self, bytes: &[u8]);
}

impl ByteSink for Vec<u8> {
    fn extend(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl ByteSink for XmsgBuffer {
    fn extend(&mut self, bytes: &[u8]) {
        self.append(bytes);
    }
}

pub enum RawSocket {
    Tcp(MioTcpStream),
    Unix(MioUnixStream),
}

impl RawSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write_vectored(bufs),
            Self::Unix(s) => s.write_vectored(bufs),
        }
    }

    pub fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(s) => registry.register(s, token, interest),
            Self::Unix(s) => registry.register(s, token, interest),
        }
    }

    pub fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(s) => registry.reregister(s, token, interest),
            Self::Unix(s) => registry.reregister(s, token, interest),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(s) => registry.deregister(s),
            Self::Unix(s) => registry.deregister(s),
        }
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(how),
            Self::Unix(s) => s.shutdown(how),
        }
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Self::Tcp(s) => s.take_error(),
            Self::Unix(s) => s.take_error(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

pub struct StreamBuffer {
    sock: RawSocket,
    token: Token,
    read_buf: [u8; READ_CHUNK],
    send_backlog: VecDeque<Vec<u8>>,
    out_len: usize,
    /// Invariant: `writable_armed == !send_backlog.is_empty()`.
    writable_armed: bool,
    eof: bool,
    last_errno: Option<i32>,
}

impl StreamBuffer {
    pub fn new(sock: RawSocket, token: Token) -> Self {
        Self {
            sock,
            token,
            read_buf: [0; READ_CHUNK],
            send_backlog: VecDeque::new(),
            out_len: 0,
            writable_armed: false,
            eof: false,
            last_errno: None,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Fixes up the token once the caller knows which arena slot this
    /// stream landed in (construction order: build, insert into the arena,
    /// assign the real token, then register).
    pub fn set_token(&mut self, token: Token) {
        self.token = token;
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn errno(&self) -> Option<i32> {
        self.last_errno
    }

    /// Unsent byte count (`tellp`).
    pub fn out_len(&self) -> usize {
        self.out_len
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        self.sock.register(registry, self.token, Interest::READABLE)
    }

    /// Reads whatever is available into `sink`. Returns `Disconnected` on a
    /// hard error or peer half-close; otherwise `Alive` (possibly having
    /// read nothing, i.e. `WouldBlock`).
    pub fn read_into<S: ByteSink>(&mut self, sink: &mut S) -> ConnState {
        loop {
            match self.sock.read(&mut self.read_buf) {
                Ok(0) => {
                    self.eof = true;
                    return ConnState::Alive;
                }
                Ok(n) => sink.extend(&self.read_buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ConnState::Alive,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(?err, "net: read");
                    self.last_errno = err.raw_os_error();
                    return ConnState::Disconnected;
                }
            }
        }
    }

    /// Enqueues `bytes` for sending, attempting an immediate write first.
    pub fn write(&mut self, registry: &Registry, bytes: &[u8]) -> ConnState {
        if bytes.is_empty() {
            return ConnState::Alive;
        }
        if !self.send_backlog.is_empty() {
            self.out_len += bytes.len();
            return self.enqueue(registry, bytes.to_vec());
        }
        match self.sock.write(bytes) {
            Ok(0) => ConnState::Disconnected,
            Ok(n) if n == bytes.len() => ConnState::Alive,
            Ok(n) => {
                self.out_len += bytes.len() - n;
                self.enqueue(registry, bytes[n..].to_vec())
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.out_len += bytes.len();
                self.enqueue(registry, bytes.to_vec())
            }
            Err(err) => {
                debug!(?err, "net: write");
                self.last_errno = err.raw_os_error();
                ConnState::Disconnected
            }
        }
    }

    /// Writes a header+payload pair back-to-back with no intervening I/O,
    /// so envelopes never interleave on the wire.
    pub fn write_framed(&mut self, registry: &Registry, header: &[u8], payload: &[u8]) -> ConnState {
        if !self.send_backlog.is_empty() {
            self.out_len += header.len() + payload.len();
            if self.enqueue(registry, header.to_vec()) == ConnState::Disconnected {
                return ConnState::Disconnected;
            }
            return self.enqueue(registry, payload.to_vec());
        }
        match self.sock.write_vectored(&[IoSlice::new(header), IoSlice::new(payload)]) {
            Ok(0) => ConnState::Disconnected,
            Ok(n) if n == header.len() + payload.len() => ConnState::Alive,
            Ok(n) if n < header.len() => {
                self.out_len += header.len() + payload.len() - n;
                if self.enqueue(registry, header[n..].to_vec()) == ConnState::Disconnected {
                    return ConnState::Disconnected;
                }
                self.enqueue(registry, payload.to_vec())
            }
            Ok(n) => {
                let payload_sent = n - header.len();
                self.out_len += payload.len() - payload_sent;
                self.enqueue(registry, payload[payload_sent..].to_vec())
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.out_len += header.len() + payload.len();
                if self.enqueue(registry, header.to_vec()) == ConnState::Disconnected {
                    return ConnState::Disconnected;
                }
                self.enqueue(registry, payload.to_vec())
            }
            Err(err) => {
                debug!(?err, "net: write_framed");
                self.last_errno = err.raw_os_error();
                ConnState::Disconnected
            }
        }
    }

    fn enqueue(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        self.arm_writable(registry)
    }

    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) =
                self.sock.reregister(registry, self.token, Interest::READABLE | Interest::WRITABLE)
            {
                debug!(?err, "net: arm writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    /// Flushes the backlog until the kernel blocks or it empties.
    pub fn flush(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.sock.write(front) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    self.out_len -= n;
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, "net: flush");
                    self.last_errno = err.raw_os_error();
                    return ConnState::Disconnected;
                }
            }
        }

        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) = self.sock.reregister(registry, self.token, Interest::READABLE) {
                debug!(?err, "net: disarm writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }
        ConnState::Alive
    }

    pub fn set_readable_only(&mut self, registry: &Registry) -> io::Result<()> {
        self.sock.reregister(registry, self.token, Interest::READABLE)
    }

    pub fn clear_readable(&mut self, registry: &Registry) -> io::Result<()> {
        if self.writable_armed {
            self.sock.reregister(registry, self.token, Interest::WRITABLE)
        } else {
            // mio has no "no interest" registration; deregistering and
            // re-registering on resume is handled by `resume_readable`.
            self.sock.deregister(registry)
        }
    }

    /// Re-enables POLLIN, e.g. from the "read-restart" cross-link once an
    /// egress buffer drains. No-op if already readable.
    pub fn resume_readable(&mut self, registry: &Registry) -> io::Result<()> {
        let interest =
            if self.writable_armed { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        self.sock.register(registry, self.token, interest).or_else(|_| {
            self.sock.reregister(registry, self.token, interest)
        })
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = self.sock.deregister(registry);
        let _ = self.sock.shutdown(std::net::Shutdown::Both);
    }

    /// Half-closes the write side only, e.g. forwarding a STOP onto a raw
    /// backend that has no framing of its own to carry it.
    pub fn shutdown_write(&self) {
        let _ = self.sock.shutdown(std::net::Shutdown::Write);
    }
}

/// A listening socket, accepted in a drain loop until `WouldBlock`.
pub enum RawListener {
    Tcp(MioTcpListener),
    Unix(MioUnixListener),
}

impl RawListener {
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match self {
            Self::Tcp(l) => registry.register(l, token, Interest::READABLE),
            Self::Unix(l) => registry.register(l, token, Interest::READABLE),
        }
    }

    /// Accepts one pending connection, or `None` on `WouldBlock`.
    pub fn accept_one(&mut self) -> io::Result<Option<RawSocket>> {
        let result = match self {
            Self::Tcp(l) => l.accept().map(|(s, _)| {
                let _ = s.set_nodelay(true);
                RawSocket::Tcp(s)
            }),
            Self::Unix(l) => l.accept().map(|(s, _)| RawSocket::Unix(s)),
        };
        match result {
            Ok(sock) => Ok(Some(sock)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Binds a listener from `tcp://host:port` or `unix://path`, removing any
/// stale socket file left behind by a previous run in the unix case.
pub fn bind_listener(uri: &str) -> io::Result<(RawListener, crate::interface::Transport)> {
    use crate::interface::Transport;

    if let Some(hostport) = uri.strip_prefix("tcp://") {
        let addr = hostport
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("bad tcp address {hostport:?}")))?;
        return Ok((RawListener::Tcp(MioTcpListener::bind(addr)?), Transport::Tcp));
    }
    if let Some(path) = uri.strip_prefix("unix://") {
        let path = std::path::Path::new(path);
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        return Ok((RawListener::Unix(MioUnixListener::bind(path)?), Transport::Unix));
    }
    Err(io::Error::new(io::ErrorKind::InvalidInput, format!("unrecognized bind scheme {uri:?}")))
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a raw fd.
pub fn set_socket_buf_size(fd: std::os::fd::RawFd, size: usize) {
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
