//! I/O multiplexing engines.
//!
//! One trait, two realizations:
//!
//! | Backend    | Impl          | Accept path                  | Worker threads          |
//! |------------|---------------|------------------------------|-------------------------|
//! | Readiness  | `EpollEngine` | listener in the epoll set    | N, fed by a channel     |
//! | Completion | `UringEngine` | blocking `sessmux-accept`    | one per ring lane       |
//!
//! Both feed received bytes through the same `worker::process_arrival`
//! path, so reassembly and dispatch are identical across backends.

mod epoll;
mod uring;

pub use epoll::EpollEngine;
pub use uring::UringEngine;

use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread::JoinHandle;

use sessmux_core::{Backend, Result, ServerConfig};

use crate::server::ServerShared;
use crate::session::Session;

/// Contract between the server and an I/O backend.
///
/// Creation (`create_engine`) is where kernel resources are set up; a
/// failure there is fatal to the process. Everything after `start` is
/// per-session and never fails the server.
pub trait Multiplexer: Send + Sync {
    fn backend(&self) -> Backend;

    /// Take ownership of the listener and spawn the engine's threads.
    fn start(&self, shared: Arc<ServerShared>, listener: TcpListener) -> Result<Vec<JoinHandle<()>>>;

    /// Start watching a newly admitted session and arm its first receive.
    fn register(&self, session: &Arc<Session>) -> io::Result<()>;

    /// Push staged send bytes toward the socket.
    ///
    /// Returns bytes written synchronously (0 when the write is handed to
    /// an engine thread). An error means the session must be closed.
    fn flush(&self, session: &Arc<Session>) -> io::Result<usize>;

    /// Stop delivering events for a session that is being closed.
    fn deregister(&self, session: &Session);

    /// Stop admitting new connections.
    fn stop_accepting(&self);

    /// Wake and stop every engine thread.
    fn shutdown(&self);
}

/// Create the engine selected by `config.backend`.
pub fn create_engine(config: &ServerConfig) -> Result<Arc<dyn Multiplexer>> {
    Ok(match config.backend {
        Backend::Readiness => Arc::new(EpollEngine::new(config)?),
        Backend::Completion => Arc::new(UringEngine::new(config)?),
    })
}
