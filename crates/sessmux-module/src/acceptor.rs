//! Connection admission.
//!
//! Two drivers share `admit_connection`: `accept_ready` drains a
//! non-blocking listener after an epoll readiness edge, `accept_loop` is
//! the blocking `sessmux-accept` thread used alongside io_uring.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sessmux_core::{Backend, CloseMode, Error};
use tracing::{debug, error, info};

use crate::server::{CloseReason, ServerShared};
use crate::stats::Stats;

/// Back-off after an accept error that is not about one connection
/// (EMFILE, ENFILE, ENOBUFS).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Accept until the non-blocking listener would block.
pub(crate) fn accept_ready(shared: &ServerShared, listener: &TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => admit_connection(shared, stream, peer),
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => continue,
                _ => {
                    error!(error = %e, "accept failed");
                    break;
                }
            },
        }
    }
}

/// Blocking accept loop. Returns once the server stops running; the
/// engine unblocks `accept` by shutting the listener down.
pub(crate) fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    debug!("accept thread started");
    loop {
        let accepted = listener.accept();
        if !shared.is_running() {
            break;
        }
        match accepted {
            Ok((stream, peer)) => admit_connection(&shared, stream, peer),
            Err(e) => match e.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => {}
                _ => {
                    error!(error = %e, "accept failed");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            },
        }
    }
    debug!("accept thread exiting");
}

/// Admit one accepted connection into the table and hand it to the engine.
///
/// A connection the table refuses is dropped here, which closes it.
pub(crate) fn admit_connection(shared: &ServerShared, stream: TcpStream, peer: SocketAddr) {
    let session = match shared.table.admit(stream, peer) {
        Ok(session) => session,
        Err(Error::ShuttingDown) => {
            debug!(%peer, "connection refused: shutting down");
            return;
        }
        Err(e) => {
            if e.is_capacity() {
                Stats::bump(&shared.stats.rejected);
            }
            error!(%peer, error = %e, "connection rejected");
            return;
        }
    };

    let nonblocking = shared.engine.backend() == Backend::Readiness;
    if let Err(e) = session.configure(nonblocking, shared.config.tcp_nodelay) {
        error!(identity = %session.identity(), %peer, error = %e, "socket setup failed");
        shared.close_session(&session, CloseMode::Force, CloseReason::Setup);
        return;
    }

    shared.dispatcher.on_open(session.identity(), peer);
    info!(
        identity = %session.identity(),
        fd = session.fd(),
        %peer,
        "session opened"
    );
    Stats::bump(&shared.stats.accepted);

    if let Err(e) = shared.engine.register(&session) {
        error!(identity = %session.identity(), %peer, error = %e, "engine registration failed");
        shared.close_session(&session, CloseMode::Force, CloseReason::Setup);
    }
}
