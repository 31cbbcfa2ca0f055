//! Server assembly and lifecycle.
//!
//! `Server::start` validates the configuration, creates the engine, binds
//! the listener and spawns every thread. `ServerShared` is the state all
//! of those threads reach through one `Arc`; `ServerHandle` is the
//! application's `SessionControl` view of it.
//!
//! Shutdown order:
//!
//! ```text
//!  1. running = false, table stops admitting
//!  2. engine stops accepting (listener shut down / deregistered)
//!  3. every live session closed (reason: shutdown)
//!  4. engine threads woken and drained, timer stopped
//!  5. all threads joined
//! ```

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use sessmux_core::{
    CloseMode, Dispatcher, Identity, Reassembler, Result, ServerConfig, SessionControl, Token,
};
use tracing::{debug, error, info, warn};

use crate::engine::{create_engine, Multiplexer};
use crate::listener;
use crate::session::Session;
use crate::stats::{Stats, StatsSnapshot};
use crate::table::SessionTable;
use crate::timer::{Scheduler, TimerAction, TimerCallback, TimerEntry};
use crate::worker;

/// Why a session was closed. Carried into the disconnect log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Zero-byte read.
    PeerClosed,
    /// Hangup or error readiness flag.
    Hangup,
    Io(io::ErrorKind),
    /// Protocol error counter reached `max_errors`.
    ErrorLimit,
    /// Receive buffer full of unconsumed bytes.
    BufferOverflow,
    /// Closed through `SessionControl`.
    Administrative,
    Shutdown,
    /// Socket setup or engine registration failed after admission.
    Setup,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Hangup => f.write_str("hangup"),
            CloseReason::Io(kind) => write!(f, "i/o error: {}", kind),
            CloseReason::ErrorLimit => f.write_str("protocol error limit"),
            CloseReason::BufferOverflow => f.write_str("receive buffer overflow"),
            CloseReason::Administrative => f.write_str("closed by application"),
            CloseReason::Shutdown => f.write_str("server shutdown"),
            CloseReason::Setup => f.write_str("setup failed"),
        }
    }
}

/// State shared by every server thread.
pub struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) table: SessionTable,
    pub(crate) engine: Arc<dyn Multiplexer>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) reassembler: Reassembler,
    pub(crate) stats: Stats,
    running: AtomicBool,
}

impl ServerShared {
    pub(crate) fn new(
        config: ServerConfig,
        engine: Arc<dyn Multiplexer>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            table: SessionTable::new(&config),
            reassembler: Reassembler::new(config.max_errors, config.max_frame_len),
            config,
            engine,
            dispatcher,
            stats: Stats::new(),
            running: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Resolve an event token to its live session.
    ///
    /// A miss means the session was closed (or its identity reissued)
    /// after the event was queued. That is expected; it is logged once per
    /// identity per maintenance window.
    pub(crate) fn resolve(&self, token: Token) -> Option<Arc<Session>> {
        let session = self.table.lookup(token);
        if session.is_none() {
            Stats::bump(&self.stats.stale_events);
            if self.table.record_miss(token.identity()) {
                warn!(
                    identity = %token.identity(),
                    generation = token.generation(),
                    "event for unknown session ignored"
                );
            }
        }
        session
    }

    /// Close a session exactly once.
    ///
    /// Returns false if another caller already closed (or is closing) it.
    /// Safe to call from inside `Dispatcher::enqueue`. From any other
    /// context it waits for a dispatch running on another thread to finish,
    /// so `on_close` always follows the session's last delivered frame.
    pub(crate) fn close_session(&self, session: &Session, mode: CloseMode, reason: CloseReason) -> bool {
        if !session.begin_close() {
            return false;
        }
        self.engine.deregister(session);
        self.table.remove(session);
        // wait out a dispatch in progress on another thread; it sees the
        // state change before its next frame and stops
        if !worker::in_dispatch() {
            drop(session.recv.lock());
        }
        self.dispatcher.on_close(session.identity());
        session.shutdown_transport(mode);
        session.mark_closed();
        Stats::bump(&self.stats.closed);
        info!(
            identity = %session.identity(),
            fd = session.fd(),
            peer = %session.peer(),
            %reason,
            "session closed"
        );
        true
    }

    pub(crate) fn close_identity(&self, identity: Identity, mode: CloseMode) -> bool {
        match self.table.get(identity) {
            Some(session) => self.close_session(&session, mode, CloseReason::Administrative),
            None => false,
        }
    }

    pub(crate) fn send(&self, identity: Identity, bytes: &[u8]) -> bool {
        let Some(session) = self.table.get(identity) else {
            Stats::bump(&self.stats.send_refused);
            debug!(%identity, "send to unknown session");
            return false;
        };
        if !session.stage(bytes) {
            Stats::bump(&self.stats.send_refused);
            warn!(
                %identity,
                len = bytes.len(),
                pending = session.pending_send(),
                "send refused: session closing or send buffer full"
            );
            return false;
        }
        match self.engine.flush(&session) {
            Ok(n) => Stats::add(&self.stats.bytes_out, n as u64),
            Err(e) => {
                self.close_session(&session, CloseMode::Graceful, CloseReason::Io(e.kind()));
            }
        }
        true
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.table.begin_shutdown();
    }
}

impl TimerCallback for ServerShared {
    fn on_timer(&self, action: TimerAction) {
        match action {
            TimerAction::ClearInvalidated => {
                let done = self.table.maintain(Instant::now());
                if done.cleared > 0 || done.released > 0 {
                    debug!(
                        cleared = done.cleared,
                        released = done.released,
                        "maintenance"
                    );
                }
            }
            TimerAction::ReportStats => {
                info!(
                    backend = %self.engine.backend(),
                    sessions = self.table.len(),
                    identities_free = self.table.available_identities(),
                    "{}",
                    self.stats.snapshot()
                );
            }
        }
    }
}

/// Application-side control of a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    pub fn session_count(&self) -> usize {
        self.shared.table.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }
}

impl SessionControl for ServerHandle {
    fn send(&self, identity: Identity, bytes: &[u8]) -> bool {
        self.shared.send(identity, bytes)
    }

    fn close_with(&self, identity: Identity, mode: CloseMode) -> bool {
        self.shared.close_identity(identity, mode)
    }

    fn identity_of(&self, fd: RawFd) -> Option<Identity> {
        self.shared.table.identity_of(fd)
    }
}

/// A running session server.
pub struct Server {
    shared: Arc<ServerShared>,
    scheduler: Scheduler,
    threads: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Server {
    /// Validate, bind and spawn every thread.
    ///
    /// Errors here are fatal: the engine could not be created, the
    /// listener could not be bound, or a thread could not be spawned.
    pub fn start(config: ServerConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        config.validate()?;
        let engine = create_engine(&config)?;
        let listener: TcpListener = listener::bind(&config)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared::new(config, engine, dispatcher));
        let mut threads = shared.engine.start(Arc::clone(&shared), listener)?;

        let scheduler = Scheduler::new();
        scheduler.schedule(TimerEntry::periodic(
            TimerAction::ClearInvalidated,
            shared.config.maintenance_interval,
        ));
        if !shared.config.stats_interval.is_zero() {
            scheduler.schedule(TimerEntry::periodic(
                TimerAction::ReportStats,
                shared.config.stats_interval,
            ));
        }
        match scheduler.start(Arc::clone(&shared)) {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                let mut partial = Self {
                    shared,
                    scheduler,
                    threads,
                    local_addr,
                };
                partial.stop();
                return Err(e.into());
            }
        }

        info!(
            addr = %local_addr,
            backend = %shared.engine.backend(),
            workers = shared.config.effective_workers(),
            max_sessions = shared.config.max_sessions,
            "server started"
        );

        Ok(Self {
            shared,
            scheduler,
            threads,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn shared(&self) -> &Arc<ServerShared> {
        &self.shared
    }

    /// Stop everything and return the final counters.
    pub fn shutdown(mut self) -> StatsSnapshot {
        self.stop();
        self.shared.stats.snapshot()
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        info!("server shutting down");
        self.shared.stop();
        self.shared.engine.stop_accepting();

        for session in self.shared.table.sessions() {
            self.shared
                .close_session(&session, CloseMode::Graceful, CloseReason::Shutdown);
        }

        self.shared.engine.shutdown();
        self.scheduler.shutdown();

        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("?").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "thread panicked");
            }
        }
        info!(final_stats = %self.shared.stats.snapshot(), "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Inbound, QueueDispatcher};
    use crossbeam_channel::Receiver;
    use sessmux_core::frame::encode_frame;
    use sessmux_core::{Backend, FrameHeader};
    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::thread;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(backend: Backend) -> ServerConfig {
        ServerConfig::new()
            .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(0)
            .backend(backend)
            .worker_threads(2)
            .stats_interval(Duration::ZERO)
    }

    fn start(config: ServerConfig) -> Option<(Server, Receiver<Inbound>)> {
        let backend = config.backend;
        let (dispatcher, rx) = QueueDispatcher::unbounded();
        match Server::start(config, Arc::new(dispatcher)) {
            Ok(server) => Some((server, rx)),
            // io_uring may be unavailable (old kernel, seccomp)
            Err(e) if backend == Backend::Completion => {
                eprintln!("skipping io_uring test: {}", e);
                None
            }
            Err(e) => panic!("server start failed: {}", e),
        }
    }

    fn connect(server: &Server) -> TcpStream {
        let client = TcpStream::connect(server.local_addr()).unwrap();
        client.set_read_timeout(Some(WAIT)).unwrap();
        client
    }

    fn expect_open(rx: &Receiver<Inbound>) -> Identity {
        match rx.recv_timeout(WAIT).unwrap() {
            Inbound::Open { identity, .. } => identity,
            other => panic!("expected open, got {:?}", other),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn echo_roundtrip(backend: Backend) {
        let Some((server, rx)) = start(config(backend)) else {
            return;
        };
        let handle = server.handle();
        let mut client = connect(&server);
        let identity = expect_open(&rx);

        let mut bytes = encode_frame(7, b"hello").unwrap();
        bytes.extend(encode_frame(9, b"world!").unwrap());
        // split inside the first header
        client.write_all(&bytes[..5]).unwrap();
        thread::sleep(Duration::from_millis(20));
        client.write_all(&bytes[5..]).unwrap();

        for (kind, payload) in [(7, &b"hello"[..]), (9, &b"world!"[..])] {
            assert_eq!(
                rx.recv_timeout(WAIT).unwrap(),
                Inbound::Frame {
                    identity,
                    kind,
                    payload: payload.to_vec()
                }
            );
        }

        let reply = encode_frame(1, b"pong").unwrap();
        assert!(handle.send(identity, &reply));
        let mut got = vec![0u8; reply.len()];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, reply);

        drop(client);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Inbound::Close { identity });
        wait_until(|| handle.session_count() == 0);

        let stats = server.shutdown();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.frames_in, 2);
        assert_eq!(stats.bytes_in, bytes.len() as u64);
        assert_eq!(stats.bytes_out, reply.len() as u64);
    }

    #[test]
    fn test_epoll_echo_roundtrip() {
        echo_roundtrip(Backend::Readiness);
    }

    #[test]
    fn test_uring_echo_roundtrip() {
        echo_roundtrip(Backend::Completion);
    }

    /// Tiny reads, a large burst of frames and a send far bigger than one
    /// socket write.
    fn bulk_transfer(backend: Backend) {
        let cfg = config(backend).recv_chunk(16).max_send_buffer(8 << 20);
        let Some((server, rx)) = start(cfg) else {
            return;
        };
        let handle = server.handle();
        let mut client = connect(&server);
        let identity = expect_open(&rx);

        let mut burst = Vec::new();
        for i in 0..2000u32 {
            burst.extend(encode_frame(i + 1, &i.to_be_bytes()).unwrap());
        }
        client.write_all(&burst).unwrap();

        for i in 0..2000u32 {
            assert_eq!(
                rx.recv_timeout(WAIT).unwrap(),
                Inbound::Frame {
                    identity,
                    kind: i + 1,
                    payload: i.to_be_bytes().to_vec()
                }
            );
        }

        let big: Vec<u8> = (0..4usize << 20).map(|i| (i % 251) as u8).collect();
        assert!(handle.send(identity, &big));
        let mut got = vec![0u8; big.len()];
        client.read_exact(&mut got).unwrap();
        assert!(got == big, "large send corrupted");

        let stats = server.shutdown();
        assert_eq!(stats.frames_in, 2000);
        assert_eq!(stats.bytes_in, burst.len() as u64);
        assert_eq!(stats.bytes_out, big.len() as u64);
    }

    #[test]
    fn test_epoll_bulk_transfer() {
        bulk_transfer(Backend::Readiness);
    }

    #[test]
    fn test_uring_bulk_transfer() {
        bulk_transfer(Backend::Completion);
    }

    /// Closes each session from inside its first frame's dispatch.
    #[derive(Default)]
    struct CloseOnFirstFrame {
        handle: parking_lot::Mutex<Option<ServerHandle>>,
        log: parking_lot::Mutex<Vec<&'static str>>,
    }

    impl Dispatcher for CloseOnFirstFrame {
        fn enqueue(&self, identity: Identity, _frame: sessmux_core::Frame<'_>) {
            self.log.lock().push("frame");
            let handle = self.handle.lock().clone();
            if let Some(handle) = handle {
                handle.close(identity);
            }
        }

        fn on_close(&self, _identity: Identity) {
            self.log.lock().push("close");
        }
    }

    fn close_inside_enqueue(backend: Backend) {
        let dispatcher = Arc::new(CloseOnFirstFrame::default());
        let server = match Server::start(config(backend), dispatcher.clone()) {
            Ok(server) => server,
            Err(e) if backend == Backend::Completion => {
                eprintln!("skipping io_uring test: {}", e);
                return;
            }
            Err(e) => panic!("server start failed: {}", e),
        };
        *dispatcher.handle.lock() = Some(server.handle());
        let handle = server.handle();
        let mut client = connect(&server);
        wait_until(|| handle.session_count() == 1);

        let mut bytes = Vec::new();
        for kind in 1..=3 {
            bytes.extend(encode_frame(kind, b"payload").unwrap());
        }
        client.write_all(&bytes).unwrap();

        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        wait_until(|| handle.session_count() == 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(*dispatcher.log.lock(), vec!["frame", "close"]);

        dispatcher.handle.lock().take();
        let stats = server.shutdown();
        assert_eq!(stats.frames_in, 1);
        assert_eq!(stats.closed, 1);
    }

    #[test]
    fn test_epoll_no_frames_after_close_in_enqueue() {
        close_inside_enqueue(Backend::Readiness);
    }

    #[test]
    fn test_uring_no_frames_after_close_in_enqueue() {
        close_inside_enqueue(Backend::Completion);
    }

    fn error_limit_closes(backend: Backend) {
        let Some((server, rx)) = start(config(backend).max_errors(1)) else {
            return;
        };
        let handle = server.handle();
        let mut client = connect(&server);
        let identity = expect_open(&rx);

        // declared length 3 is shorter than the header
        let mut bad = FrameHeader::new(3, 1).encode().to_vec();
        bad.push(0xAA);
        client.write_all(&bad).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Inbound::Close { identity });
        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        wait_until(|| handle.session_count() == 0);
        assert!(!handle.send(identity, b"late"));

        let stats = server.shutdown();
        assert_eq!(stats.protocol_errors, 1);
        assert_eq!(stats.frames_in, 0);
    }

    #[test]
    fn test_epoll_error_limit_closes_session() {
        error_limit_closes(Backend::Readiness);
    }

    #[test]
    fn test_uring_error_limit_closes_session() {
        error_limit_closes(Backend::Completion);
    }

    #[test]
    fn test_table_full_rejects_connection() {
        let Some((server, rx)) = start(config(Backend::Readiness).max_sessions(1)) else {
            return;
        };
        let handle = server.handle();
        let _first = connect(&server);
        let identity = expect_open(&rx);

        let mut second = connect(&server);
        let mut buf = [0u8; 1];
        assert!(matches!(second.read(&mut buf), Ok(0) | Err(_)));
        wait_until(|| handle.stats().rejected == 1);

        // the admitted session is untouched
        assert_eq!(handle.session_count(), 1);
        assert!(handle.send(identity, &encode_frame(2, b"ok").unwrap()));
        server.shutdown();
    }

    #[test]
    fn test_administrative_close_is_idempotent() {
        let Some((server, rx)) = start(config(Backend::Readiness)) else {
            return;
        };
        let handle = server.handle();
        let mut client = connect(&server);
        let identity = expect_open(&rx);
        assert_eq!(handle.identity_of(-1), None);

        assert!(handle.close(identity));
        assert!(!handle.close(identity));
        assert!(!handle.close_with(identity, CloseMode::Force));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Inbound::Close { identity });

        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        assert_eq!(handle.session_count(), 0);

        let stats = server.shutdown();
        assert_eq!(stats.closed, 1);
    }

    #[test]
    fn test_shutdown_closes_live_sessions() {
        let Some((server, rx)) = start(config(Backend::Readiness)) else {
            return;
        };
        let mut clients: Vec<TcpStream> = (0..3).map(|_| connect(&server)).collect();
        for _ in 0..3 {
            expect_open(&rx);
        }

        let stats = server.shutdown();
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.closed, 3);
        for client in &mut clients {
            let mut buf = [0u8; 1];
            assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        }
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let (dispatcher, _rx) = QueueDispatcher::unbounded();
        let err = Server::start(config(Backend::Readiness).max_sessions(0), Arc::new(dispatcher));
        assert!(matches!(err, Err(sessmux_core::Error::InvalidConfig(_))));
    }
}
