//! Per-connection state.
//!
//! A `Session` is created by the acceptor, owned by the `SessionTable`
//! (as `Arc<Session>`) and borrowed by engine threads for the duration of
//! one event or one in-flight operation. The socket fd lives inside the
//! `TcpStream` and is only closed when the last `Arc` drops, so the kernel
//! cannot hand the same fd number to a new connection while any thread
//! still holds this session.
//!
//! Receive and send state sit behind separate locks: the reassembler holds
//! the receive lock while it calls into the dispatcher, and the dispatcher
//! is allowed to `send` back on the same session.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sessmux_core::{CloseMode, Error, Identity, Result, RingBuffer, ServerConfig, Token};
use socket2::SockRef;
use tracing::debug;

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Active = 0,
    /// Close has been claimed by one thread and is in progress.
    Closing = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Active,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Buffer sizing applied to every new session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub recv_chunk: usize,
    pub max_recv_buffer: usize,
    pub max_send_buffer: usize,
}

impl From<&ServerConfig> for SessionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            recv_chunk: config.recv_chunk,
            max_recv_buffer: config.max_recv_buffer,
            max_send_buffer: config.max_send_buffer,
        }
    }
}

pub(crate) struct RecvState {
    pub(crate) buffer: RingBuffer,
    /// Protocol violations seen so far.
    pub(crate) errors: u32,
    /// Unconsumed bytes left by the last arrival; sizes the next reserve.
    pub(crate) remaining: usize,
}

impl RecvState {
    /// Make room for the next receive and return how much was reserved.
    ///
    /// Asks for `chunk` bytes (more if the last arrival left a large
    /// remainder) but settles for whatever fits under the ceiling. Fails
    /// only when the buffer is full of unconsumed bytes.
    pub(crate) fn reserve(&mut self, chunk: usize) -> Result<usize> {
        let readable = self.buffer.readable();
        let room = self.buffer.limit().saturating_sub(readable);
        let want = chunk.max(self.remaining).min(room);
        if want == 0 {
            return Err(Error::BufferOverflow {
                needed: readable + chunk,
                limit: self.buffer.limit(),
            });
        }
        self.buffer.ensure_writable(want)?;
        Ok(want)
    }
}

pub(crate) struct SendState {
    pub(crate) buffer: RingBuffer,
    /// A completion-engine send is outstanding for this session.
    pub(crate) in_flight: bool,
}

pub struct Session {
    identity: Identity,
    generation: u32,
    fd: RawFd,
    peer: SocketAddr,
    stream: TcpStream,
    state: AtomicU8,
    pub(crate) recv: Mutex<RecvState>,
    pub(crate) send: Mutex<SendState>,
}

impl Session {
    pub(crate) fn new(
        identity: Identity,
        generation: u32,
        stream: TcpStream,
        peer: SocketAddr,
        limits: &SessionLimits,
    ) -> Self {
        Self {
            identity,
            generation,
            fd: stream.as_raw_fd(),
            peer,
            stream,
            state: AtomicU8::new(SessionState::Active as u8),
            recv: Mutex::new(RecvState {
                buffer: RingBuffer::with_limit(limits.recv_chunk, limits.max_recv_buffer),
                errors: 0,
                remaining: 0,
            }),
            send: Mutex::new(SendState {
                // grows on demand up to the ceiling
                buffer: RingBuffer::with_limit(0, limits.max_send_buffer),
                in_flight: false,
            }),
        }
    }

    #[inline]
    pub fn identity(&self) -> Identity {
        self.identity
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub fn token(&self) -> Token {
        Token::new(self.identity, self.generation)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Claim the close. Exactly one caller ever gets `true`.
    pub(crate) fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }

    /// Socket options applied right after admission.
    ///
    /// The readiness engine needs a non-blocking socket; the completion
    /// engine keeps it blocking so the kernel parks receives instead of
    /// completing them with `EAGAIN`.
    pub(crate) fn configure(&self, nonblocking: bool, nodelay: bool) -> io::Result<()> {
        self.stream.set_nonblocking(nonblocking)?;
        if nodelay {
            self.stream.set_nodelay(true)?;
        }
        Ok(())
    }

    /// Append outbound bytes. False if they would exceed the send ceiling
    /// or the session is no longer active; nothing is staged in that case.
    pub(crate) fn stage(&self, bytes: &[u8]) -> bool {
        if !self.is_active() {
            return false;
        }
        self.send.lock().buffer.append(bytes).is_ok()
    }

    /// Bytes staged but not yet written.
    pub fn pending_send(&self) -> usize {
        self.send.lock().buffer.readable()
    }

    /// One non-blocking read into the receive buffer's free tail.
    pub(crate) fn read_into(&self, recv: &mut RecvState) -> io::Result<usize> {
        (&self.stream).read(recv.buffer.write_slice())
    }

    /// Write staged bytes until the socket would block or nothing is left.
    ///
    /// Returns the number of bytes written. Partial progress is kept: the
    /// rest goes out on the next writable edge.
    pub(crate) fn write_pending(&self) -> io::Result<usize> {
        let mut send = self.send.lock();
        let mut total = 0;
        while !send.buffer.is_empty() {
            match (&self.stream).write(send.buffer.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    send.buffer.consume(n).map_err(io::Error::other)?;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Tear the connection down. The fd itself is released on last drop.
    pub(crate) fn shutdown_transport(&self, mode: CloseMode) {
        if mode == CloseMode::Force {
            if let Err(e) = SockRef::from(&self.stream).set_linger(Some(Duration::ZERO)) {
                debug!(identity = %self.identity, fd = self.fd, error = %e, "set_linger failed");
            }
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!(identity = %self.identity, fd = self.fd, error = %e, "shutdown failed");
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("generation", &self.generation)
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::TcpListener;

    /// Connected loopback pair: (server side, client side).
    pub(crate) fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn limits(max_send: usize) -> SessionLimits {
        SessionLimits {
            recv_chunk: 64,
            max_recv_buffer: 256,
            max_send_buffer: max_send,
        }
    }

    fn session(max_send: usize) -> (Session, TcpStream) {
        let (server, client) = tcp_pair();
        let peer = client.local_addr().unwrap();
        (Session::new(Identity::new(1), 7, server, peer, &limits(max_send)), client)
    }

    #[test]
    fn test_close_is_claimed_once() {
        let (s, _client) = session(64);
        assert!(s.is_active());
        assert!(s.begin_close());
        assert!(!s.begin_close());
        assert_eq!(s.state(), SessionState::Closing);
        s.mark_closed();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(!s.begin_close());
    }

    #[test]
    fn test_stage_respects_ceiling() {
        let (s, _client) = session(8);
        assert!(s.stage(b"12345"));
        assert!(!s.stage(b"6789"));
        assert_eq!(s.pending_send(), 5);
        assert!(s.stage(b"678"));
        assert_eq!(s.pending_send(), 8);
    }

    #[test]
    fn test_stage_refused_after_close() {
        let (s, _client) = session(64);
        assert!(s.begin_close());
        assert!(!s.stage(b"late"));
    }

    #[test]
    fn test_write_pending_reaches_peer() {
        let (s, mut client) = session(64);
        s.configure(true, true).unwrap();
        assert!(s.stage(b"hello"));
        assert_eq!(s.write_pending().unwrap(), 5);
        assert_eq!(s.pending_send(), 0);

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_reserve_settles_for_remaining_room() {
        let (s, _client) = session(64);
        let mut recv = s.recv.lock();
        recv.buffer.append(&[0u8; 250]).unwrap();
        // 6 bytes of room under the 256 ceiling
        assert_eq!(recv.reserve(64).unwrap(), 6);
        assert_eq!(recv.buffer.writable(), 6);
        recv.buffer.append(&[0u8; 6]).unwrap();
        assert!(recv.reserve(64).is_err());
    }

    #[test]
    fn test_token_carries_generation() {
        let (s, _client) = session(64);
        assert_eq!(s.token().identity(), Identity::new(1));
        assert_eq!(s.token().generation(), 7);
    }
}
