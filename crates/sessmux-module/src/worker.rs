//! Readiness workers and the shared arrival path.
//!
//! `run` is the body of each `sessmux-worker-N` thread: it pulls
//! `ReadyEvent`s off the epoll thread's channel and services them until
//! the channel disconnects. `process_arrival` is the one place received
//! bytes turn into dispatched frames; the io_uring lanes call it too.

use std::cell::Cell;
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use sessmux_core::{CloseMode, IoOutcome, ReadyEvent, Verdict};
use tracing::{debug, error, trace};

use crate::server::{CloseReason, ServerShared};
use crate::session::{RecvState, Session};
use crate::stats::Stats;

thread_local! {
    /// Set while this thread is inside `Dispatcher::enqueue`.
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// True when called from inside a dispatcher callback on this thread.
///
/// A close issued from there already holds the receive lock of the session
/// being dispatched, so it must not wait for it.
pub(crate) fn in_dispatch() -> bool {
    DISPATCHING.with(|d| d.get())
}

struct DispatchScope;

impl DispatchScope {
    fn enter() -> Self {
        DISPATCHING.with(|d| d.set(true));
        DispatchScope
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCHING.with(|d| d.set(false));
    }
}

/// Worker thread body.
pub fn run(shared: Arc<ServerShared>, events: Receiver<ReadyEvent>, worker_id: usize) {
    debug!(worker_id, "worker started");
    for event in events.iter() {
        handle_ready(&shared, event);
    }
    debug!(worker_id, "worker exiting");
}

/// Service one readiness notification.
///
/// Input is drained before hangup/error is acted on, so bytes the peer sent
/// just before closing are still dispatched.
pub(crate) fn handle_ready(shared: &ServerShared, event: ReadyEvent) {
    let Some(session) = shared.resolve(event.token) else {
        return;
    };
    let ready = event.readiness;

    if ready.readable || ready.hangup {
        if let Some(reason) = drain_recv(shared, &session) {
            shared.close_session(&session, CloseMode::Graceful, reason);
            return;
        }
    }

    if ready.is_terminal() && session.is_active() {
        shared.close_session(&session, CloseMode::Graceful, CloseReason::Hangup);
        return;
    }

    if ready.writable && session.is_active() {
        match session.write_pending() {
            Ok(n) => Stats::add(&shared.stats.bytes_out, n as u64),
            Err(e) => {
                shared.close_session(&session, CloseMode::Graceful, CloseReason::Io(e.kind()));
            }
        }
    }
}

/// Read until the socket would block.
///
/// Returns the reason the session must be closed, if any. The close itself
/// is left to the caller so it happens after the receive lock is released.
fn drain_recv(shared: &ServerShared, session: &Session) -> Option<CloseReason> {
    let mut recv = session.recv.lock();
    loop {
        if !session.is_active() {
            return None;
        }
        if recv.reserve(shared.config.recv_chunk).is_err() {
            return Some(CloseReason::BufferOverflow);
        }

        match IoOutcome::from_io(session.read_into(&mut recv)) {
            IoOutcome::Transferred(n) => {
                if recv.buffer.advance_write(n).is_err() {
                    return Some(CloseReason::BufferOverflow);
                }
                if process_arrival(shared, session, &mut recv, n) == Verdict::ErrorLimit {
                    return Some(CloseReason::ErrorLimit);
                }
            }
            IoOutcome::PeerClosed => return Some(CloseReason::PeerClosed),
            IoOutcome::Failed(e) => match e.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return None,
                kind => return Some(CloseReason::Io(kind)),
            },
        }
    }
}

/// Reassemble and dispatch the bytes of one arrival.
///
/// `n` bytes have already been committed to `recv.buffer`. Frames reach the
/// dispatcher synchronously and in order while the receive lock is held.
/// The session state is re-checked before every frame: once it has left
/// `Active`, whoever closed it, nothing more is enqueued.
pub(crate) fn process_arrival(
    shared: &ServerShared,
    session: &Session,
    recv: &mut RecvState,
    n: usize,
) -> Verdict {
    Stats::add(&shared.stats.bytes_in, n as u64);

    let identity = session.identity();
    let dispatcher = &shared.dispatcher;
    let RecvState {
        buffer,
        errors,
        remaining,
    } = recv;

    let out = {
        let _scope = DispatchScope::enter();
        shared.reassembler.feed(buffer, errors, n, |frame| {
            if !session.is_active() {
                return ControlFlow::Break(());
            }
            dispatcher.enqueue(identity, frame);
            ControlFlow::Continue(())
        })
    };
    *remaining = out.remaining;
    Stats::add(&shared.stats.frames_in, out.dispatched as u64);

    trace!(
        %identity,
        bytes = n,
        frames = out.dispatched,
        buffered = buffer.readable(),
        "arrival"
    );

    if let Some(violation) = out.violation {
        Stats::bump(&shared.stats.protocol_errors);
        error!(
            %identity,
            fd = session.fd(),
            peer = %session.peer(),
            errors = *errors,
            %violation,
            "protocol violation"
        );
    }

    out.verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Inbound, QueueDispatcher};
    use crate::server::Server;
    use sessmux_core::{Backend, Readiness, ServerConfig, SessionControl, Token};
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::time::Duration;

    fn start() -> (Server, Receiver<Inbound>) {
        let config = ServerConfig::new()
            .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(0)
            .backend(Backend::Readiness)
            .worker_threads(1)
            .stats_interval(Duration::ZERO)
            .maintenance_interval(Duration::from_secs(3600));
        let (dispatcher, rx) = QueueDispatcher::unbounded();
        (Server::start(config, Arc::new(dispatcher)).unwrap(), rx)
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let (server, rx) = start();
        let _client = TcpStream::connect(server.local_addr()).unwrap();
        let identity = match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Inbound::Open { identity, .. } => identity,
            other => panic!("expected open, got {:?}", other),
        };

        let shared = server.shared();
        let live = shared.table().get(identity).unwrap();
        let stale = Token::new(identity, live.token().generation().wrapping_sub(1));
        let event = ReadyEvent {
            token: stale,
            readiness: Readiness {
                readable: true,
                hangup: true,
                ..Readiness::default()
            },
        };

        handle_ready(shared, event);
        handle_ready(shared, event);

        assert_eq!(shared.stats().snapshot().stale_events, 2);
        // the miss was recorded by the first event, so it warned once
        assert!(!shared.table().record_miss(identity));
        // the live session behind the same identity is untouched
        assert!(live.is_active());
        assert_eq!(server.handle().session_count(), 1);
        assert!(server.handle().send(identity, b"still here"));

        server.shutdown();
    }

    #[test]
    fn test_dispatch_scope_resets() {
        assert!(!in_dispatch());
        {
            let _scope = DispatchScope::enter();
            assert!(in_dispatch());
        }
        assert!(!in_dispatch());
    }
}
