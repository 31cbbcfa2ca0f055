//! # sessmux-core — types and algorithms for the sessmux session server
//!
//! This crate holds everything that does not touch the operating system:
//! the session identity pool, the per-session ring buffer, the wire frame
//! codec, the stream-to-frame reassembler, the uniform I/O event types both
//! engines report through, and the server configuration.
//!
//! OS-facing pieces (sockets, epoll, io_uring, threads) live in
//! `sessmux-module`, which depends on the types defined here.
//!
//! ## Modules
//!
//! - `identity` - Session identity newtype and bounded FIFO pool
//! - `ring_buffer` - Cursor-based growable byte buffer
//! - `frame` - Frame header codec and borrowed frame view
//! - `reassembler` - Stream-to-frame state machine
//! - `event` - Tokens, readiness flags and I/O outcomes
//! - `dispatch` - Application boundary traits
//! - `config` - Server configuration
//! - `error` - Error types

pub mod identity;
pub mod ring_buffer;
pub mod frame;
pub mod reassembler;
pub mod event;
pub mod dispatch;
pub mod config;
pub mod error;

// Re-exports for convenience
pub use identity::{Identity, IdentityPool};
pub use ring_buffer::RingBuffer;
pub use frame::{Frame, FrameHeader, HEADER_SIZE};
pub use reassembler::{Reassembler, Reassembly, Verdict, Violation};
pub use event::{IoOutcome, OpTag, Readiness, ReadyEvent, Token};
pub use dispatch::{CloseMode, Dispatcher, SessionControl};
pub use config::{Backend, ServerConfig};
pub use error::{Error, Result};

/// Defaults shared by configuration and tests
pub mod constants {
    use std::time::Duration;

    /// Default listen port
    pub const DEFAULT_PORT: u16 = 9000;

    /// Default listen backlog
    pub const DEFAULT_BACKLOG: i32 = 1024;

    /// Default maximum concurrent sessions (also the identity pool size)
    pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

    /// Default per-session protocol error threshold
    pub const DEFAULT_MAX_ERRORS: u32 = 5;

    /// Default receive chunk: the initial receive buffer size and the
    /// minimum writable space guaranteed before every read
    pub const DEFAULT_RECV_CHUNK: usize = 8 * 1024;

    /// Default ceiling for a session's receive buffer
    pub const DEFAULT_MAX_RECV_BUFFER: usize = 1024 * 1024;

    /// Default ceiling for a session's staged outbound bytes
    pub const DEFAULT_MAX_SEND_BUFFER: usize = 1024 * 1024;

    /// Default largest accepted frame (header included)
    pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024;

    /// Maintenance period: clears the recently-invalidated identity set
    pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(5120);

    /// Default io_uring SQ entries per lane
    pub const DEFAULT_URING_ENTRIES: u32 = 256;
}
