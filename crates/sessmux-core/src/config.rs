//! Server configuration
//!
//! Built with chained setters or loaded from `SESSMUX_*` environment
//! variables, then checked with `validate()` before the server starts.
//!
//! | Variable                        | Field                  |
//! |---------------------------------|------------------------|
//! | `SESSMUX_BIND`                  | `bind_addr`            |
//! | `SESSMUX_PORT`                  | `port`                 |
//! | `SESSMUX_BACKLOG`               | `backlog`              |
//! | `SESSMUX_MAX_SESSIONS`          | `max_sessions`         |
//! | `SESSMUX_MAX_ERRORS`            | `max_errors`           |
//! | `SESSMUX_WORKERS`               | `worker_threads`       |
//! | `SESSMUX_BACKEND`               | `backend`              |
//! | `SESSMUX_RECV_CHUNK`            | `recv_chunk`           |
//! | `SESSMUX_MAX_RECV_BUFFER`       | `max_recv_buffer`      |
//! | `SESSMUX_MAX_SEND_BUFFER`       | `max_send_buffer`      |
//! | `SESSMUX_MAX_FRAME_LEN`         | `max_frame_len`        |
//! | `SESSMUX_NODELAY`               | `tcp_nodelay`          |
//! | `SESSMUX_RECYCLE`               | `recycle_identities`   |
//! | `SESSMUX_QUARANTINE_MS`         | `identity_quarantine`  |
//! | `SESSMUX_MAINTENANCE_MS`        | `maintenance_interval` |
//! | `SESSMUX_STATS_MS`              | `stats_interval`       |
//! | `SESSMUX_URING_ENTRIES`         | `uring_entries`        |

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::frame::HEADER_SIZE;

/// I/O multiplexing backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// epoll, edge-triggered.
    #[default]
    Readiness,
    /// io_uring.
    Completion,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Readiness => "epoll",
            Backend::Completion => "io_uring",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "epoll" | "readiness" => Ok(Backend::Readiness),
            "uring" | "io_uring" | "iouring" | "completion" => Ok(Backend::Completion),
            _ => Err(Error::InvalidConfig("backend must be one of: epoll, io_uring")),
        }
    }
}

/// Configuration for the session server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub bind_addr: IpAddr,

    /// Listen port (0 = ephemeral)
    pub port: u16,

    /// listen(2) backlog
    pub backlog: i32,

    /// Maximum live sessions; also the identity pool size
    pub max_sessions: usize,

    /// Protocol violations tolerated before a session is closed
    pub max_errors: u32,

    /// Worker threads (epoll) or ring lanes (io_uring); 0 = backend default
    pub worker_threads: usize,

    pub backend: Backend,

    /// Initial receive buffer size and minimum free space before each read
    pub recv_chunk: usize,

    /// Receive buffer growth ceiling
    pub max_recv_buffer: usize,

    /// Staged outbound bytes allowed per session
    pub max_send_buffer: usize,

    /// Largest frame accepted, header included
    pub max_frame_len: u32,

    /// Set TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,

    /// Return closed identities to the pool after `identity_quarantine`
    pub recycle_identities: bool,

    pub identity_quarantine: Duration,

    /// Period of the maintenance tick
    pub maintenance_interval: Duration,

    /// Period of the stats report (zero disables it)
    pub stats_interval: Duration,

    /// Submission queue entries per io_uring lane
    pub uring_entries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_errors: DEFAULT_MAX_ERRORS,
            worker_threads: 0,
            backend: Backend::default(),
            recv_chunk: DEFAULT_RECV_CHUNK,
            max_recv_buffer: DEFAULT_MAX_RECV_BUFFER,
            max_send_buffer: DEFAULT_MAX_SEND_BUFFER,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            tcp_nodelay: true,
            recycle_identities: true,
            identity_quarantine: DEFAULT_MAINTENANCE_INTERVAL,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            stats_interval: Duration::from_secs(10),
            uring_entries: DEFAULT_URING_ENTRIES,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `SESSMUX_*` variables that are set and
    /// parse. Unparseable values fall back to the default silently.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_get("SESSMUX_BIND", d.bind_addr),
            port: env_get("SESSMUX_PORT", d.port),
            backlog: env_get("SESSMUX_BACKLOG", d.backlog),
            max_sessions: env_get("SESSMUX_MAX_SESSIONS", d.max_sessions),
            max_errors: env_get("SESSMUX_MAX_ERRORS", d.max_errors),
            worker_threads: env_get("SESSMUX_WORKERS", d.worker_threads),
            backend: env_get("SESSMUX_BACKEND", d.backend),
            recv_chunk: env_get("SESSMUX_RECV_CHUNK", d.recv_chunk),
            max_recv_buffer: env_get("SESSMUX_MAX_RECV_BUFFER", d.max_recv_buffer),
            max_send_buffer: env_get("SESSMUX_MAX_SEND_BUFFER", d.max_send_buffer),
            max_frame_len: env_get("SESSMUX_MAX_FRAME_LEN", d.max_frame_len),
            tcp_nodelay: env_get_bool("SESSMUX_NODELAY", d.tcp_nodelay),
            recycle_identities: env_get_bool("SESSMUX_RECYCLE", d.recycle_identities),
            identity_quarantine: env_get_ms("SESSMUX_QUARANTINE_MS", d.identity_quarantine),
            maintenance_interval: env_get_ms("SESSMUX_MAINTENANCE_MS", d.maintenance_interval),
            stats_interval: env_get_ms("SESSMUX_STATS_MS", d.stats_interval),
            uring_entries: env_get("SESSMUX_URING_ENTRIES", d.uring_entries),
        }
    }

    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn max_sessions(mut self, n: usize) -> Self {
        self.max_sessions = n;
        self
    }

    pub fn max_errors(mut self, n: u32) -> Self {
        self.max_errors = n;
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn recv_chunk(mut self, n: usize) -> Self {
        self.recv_chunk = n;
        self
    }

    pub fn max_recv_buffer(mut self, n: usize) -> Self {
        self.max_recv_buffer = n;
        self
    }

    pub fn max_send_buffer(mut self, n: usize) -> Self {
        self.max_send_buffer = n;
        self
    }

    pub fn max_frame_len(mut self, n: u32) -> Self {
        self.max_frame_len = n;
        self
    }

    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.tcp_nodelay = enable;
        self
    }

    pub fn recycle_identities(mut self, enable: bool) -> Self {
        self.recycle_identities = enable;
        self
    }

    pub fn identity_quarantine(mut self, d: Duration) -> Self {
        self.identity_quarantine = d;
        self
    }

    pub fn maintenance_interval(mut self, d: Duration) -> Self {
        self.maintenance_interval = d;
        self
    }

    pub fn stats_interval(mut self, d: Duration) -> Self {
        self.stats_interval = d;
        self
    }

    pub fn uring_entries(mut self, n: u32) -> Self {
        self.uring_entries = n;
        self
    }

    /// Socket address to listen on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Worker threads (epoll) or lanes (io_uring) after resolving 0.
    ///
    /// epoll defaults to a single worker; io_uring to one lane per CPU.
    pub fn effective_workers(&self) -> usize {
        match (self.worker_threads, self.backend) {
            (0, Backend::Readiness) => 1,
            (0, Backend::Completion) => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            (n, _) => n,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(Error::InvalidConfig("max_sessions must be at least 1"));
        }
        if self.max_sessions >= u32::MAX as usize {
            return Err(Error::InvalidConfig("max_sessions must fit a 32-bit identity"));
        }
        if self.max_errors == 0 {
            return Err(Error::InvalidConfig("max_errors must be at least 1"));
        }
        if self.backlog <= 0 {
            return Err(Error::InvalidConfig("backlog must be positive"));
        }
        if (self.max_frame_len as usize) <= HEADER_SIZE {
            return Err(Error::InvalidConfig("max_frame_len must exceed the header size"));
        }
        if self.recv_chunk == 0 {
            return Err(Error::InvalidConfig("recv_chunk must be at least 1"));
        }
        if self.max_recv_buffer < self.max_frame_len as usize + self.recv_chunk {
            return Err(Error::InvalidConfig(
                "max_recv_buffer must hold max_frame_len plus one recv_chunk",
            ));
        }
        if self.max_send_buffer == 0 {
            return Err(Error::InvalidConfig("max_send_buffer must be at least 1"));
        }
        if self.maintenance_interval.is_zero() {
            return Err(Error::InvalidConfig("maintenance_interval must be non-zero"));
        }
        if self.backend == Backend::Completion && self.uring_entries == 0 {
            return Err(Error::InvalidConfig("uring_entries must be at least 1"));
        }
        Ok(())
    }
}

#[inline]
fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
#[inline]
fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
fn env_get_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let cfg = ServerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.maintenance_interval, Duration::from_millis(5120));
        assert_eq!(cfg.effective_workers(), 1);
    }

    #[test]
    fn test_builder() {
        let cfg = ServerConfig::new()
            .port(0)
            .max_sessions(2)
            .backend(Backend::Completion)
            .worker_threads(3)
            .recycle_identities(false);
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.max_sessions, 2);
        assert_eq!(cfg.effective_workers(), 3);
        assert!(!cfg.recycle_identities);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        assert!(ServerConfig::new().max_sessions(0).validate().is_err());
        assert!(ServerConfig::new().max_errors(0).validate().is_err());
        assert!(ServerConfig::new().max_frame_len(8).validate().is_err());
        assert!(ServerConfig::new()
            .max_frame_len(1024)
            .recv_chunk(512)
            .max_recv_buffer(1024)
            .validate()
            .is_err());
        assert!(ServerConfig::new()
            .maintenance_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("epoll".parse::<Backend>().unwrap(), Backend::Readiness);
        assert_eq!("IO_URING".parse::<Backend>().unwrap(), Backend::Completion);
        assert!("kqueue".parse::<Backend>().is_err());
        assert_eq!(Backend::Completion.to_string(), "io_uring");
    }

    #[test]
    fn test_env_helpers() {
        std::env::set_var("__SESSMUX_TEST_NUM__", "123");
        assert_eq!(env_get("__SESSMUX_TEST_NUM__", 0usize), 123);
        std::env::set_var("__SESSMUX_TEST_NUM__", "garbage");
        assert_eq!(env_get("__SESSMUX_TEST_NUM__", 7usize), 7);
        std::env::remove_var("__SESSMUX_TEST_NUM__");

        std::env::set_var("__SESSMUX_TEST_BOOL__", "On");
        assert!(env_get_bool("__SESSMUX_TEST_BOOL__", false));
        std::env::set_var("__SESSMUX_TEST_BOOL__", "0");
        assert!(!env_get_bool("__SESSMUX_TEST_BOOL__", true));
        std::env::remove_var("__SESSMUX_TEST_BOOL__");
        assert!(env_get_bool("__SESSMUX_TEST_BOOL__", true));

        std::env::set_var("__SESSMUX_TEST_MS__", "250");
        assert_eq!(
            env_get_ms("__SESSMUX_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::remove_var("__SESSMUX_TEST_MS__");
    }
}
