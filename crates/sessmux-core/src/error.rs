//! sessmux error types.

/// The error type for sessmux operations.
///
/// Only engine setup and listener failures are fatal to the process; every
/// other variant describes a per-connection condition that the server
/// handles by rejecting or closing that one session.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration rejected by `ServerConfig::validate`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Multiplexer (epoll / io_uring) could not be created.
    #[error("{backend} engine setup failed: {source}")]
    EngineSetup {
        backend: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The session table already holds `capacity` sessions.
    #[error("session table full ({capacity} sessions)")]
    TableFull { capacity: usize },

    /// No identity left in the pool.
    #[error("identity pool exhausted")]
    IdentityExhausted,

    /// The server is shutting down and admits no new sessions.
    #[error("server is shutting down")]
    ShuttingDown,

    /// A ring buffer would exceed its configured ceiling.
    #[error("buffer overflow: need {needed} bytes, limit {limit}")]
    BufferOverflow { needed: usize, limit: usize },
}

impl Error {
    /// Capacity conditions reject a connection; they are not faults.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::TableFull { .. } | Self::IdentityExhausted)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
