//! `EpollEngine` — readiness backend.
//!
//! One `sessmux-epoll` thread owns the wait call. The listener and a wake
//! eventfd sit in the same epoll set under reserved tokens; every other
//! event belongs to a session and is forwarded, token and flags only, over
//! a `crossbeam_channel` to the `sessmux-worker-N` threads.
//!
//! Sessions are registered edge-triggered for input and output. Workers
//! therefore read until `WouldBlock` on every readable edge and write until
//! `WouldBlock` on every flush; anything left over waits for the next edge.

use std::io;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use sessmux_core::{Backend, Error, Readiness, ReadyEvent, Result, ServerConfig, Token};
use tracing::{debug, error};

use super::Multiplexer;
use crate::acceptor;
use crate::notifier::EventFdNotifier;
use crate::server::ServerShared;
use crate::session::Session;
use crate::worker;

const LISTENER: u64 = u64::MAX;
const WAKE: u64 = u64::MAX - 1;

/// Events fetched per wait call.
const EVENT_BATCH: usize = 256;

/// Upper bound on one wait, so a missed wake-up still observes shutdown.
const POLL_TIMEOUT_MS: u16 = 100;

fn session_flags() -> EpollFlags {
    EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLET
}

fn readiness(flags: EpollFlags) -> Readiness {
    Readiness {
        readable: flags.contains(EpollFlags::EPOLLIN),
        writable: flags.contains(EpollFlags::EPOLLOUT),
        hangup: flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP),
        error: flags.contains(EpollFlags::EPOLLERR),
    }
}

struct EpollInner {
    epoll: Epoll,
    notifier: EventFdNotifier,
    running: AtomicBool,
    accepting: AtomicBool,
    workers: usize,
}

pub struct EpollEngine {
    inner: Arc<EpollInner>,
}

impl EpollEngine {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let setup = |source: io::Error| Error::EngineSetup {
            backend: "epoll",
            source,
        };

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| setup(e.into()))?;
        let notifier = EventFdNotifier::create().map_err(setup)?;
        epoll
            .add(&notifier, EpollEvent::new(EpollFlags::EPOLLIN, WAKE))
            .map_err(|e| setup(e.into()))?;

        Ok(Self {
            inner: Arc::new(EpollInner {
                epoll,
                notifier,
                running: AtomicBool::new(true),
                accepting: AtomicBool::new(true),
                workers: config.effective_workers(),
            }),
        })
    }
}

impl EpollInner {
    fn poll_loop(&self, shared: &ServerShared, listener: TcpListener, events_tx: Sender<ReadyEvent>) {
        let mut events = vec![EpollEvent::empty(); EVENT_BATCH];

        while self.running.load(Ordering::Acquire) {
            let n = match self.epoll.wait(&mut events, EpollTimeout::from(POLL_TIMEOUT_MS)) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "epoll_wait failed, engine stopping");
                    break;
                }
            };

            for ev in &events[..n] {
                match ev.data() {
                    LISTENER => {
                        if self.accepting.load(Ordering::Acquire) {
                            acceptor::accept_ready(shared, &listener);
                        } else {
                            // level-triggered: stop the listener from re-firing
                            let _ = self.epoll.delete(&listener);
                        }
                    }
                    WAKE => {
                        let _ = self.notifier.drain();
                    }
                    raw => {
                        let event = ReadyEvent {
                            token: Token::from_raw(raw),
                            readiness: readiness(ev.events()),
                        };
                        // workers gone: nothing left to deliver to
                        if events_tx.send(event).is_err() {
                            return;
                        }
                    }
                }
            }
        }

        let _ = self.epoll.delete(&listener);
        debug!("epoll thread exiting");
    }
}

impl Multiplexer for EpollEngine {
    fn backend(&self) -> Backend {
        Backend::Readiness
    }

    fn start(&self, shared: Arc<ServerShared>, listener: TcpListener) -> Result<Vec<JoinHandle<()>>> {
        listener.set_nonblocking(true)?;
        self.inner
            .epoll
            .add(&listener, EpollEvent::new(EpollFlags::EPOLLIN, LISTENER))
            .map_err(io::Error::from)?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut handles = Vec::with_capacity(self.inner.workers + 1);

        for worker_id in 0..self.inner.workers {
            let rx = rx.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("sessmux-worker-{}", worker_id))
                .spawn(move || worker::run(shared, rx, worker_id))?;
            handles.push(handle);
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("sessmux-epoll".into())
            .spawn(move || inner.poll_loop(&shared, listener, tx))?;
        handles.push(handle);

        Ok(handles)
    }

    fn register(&self, session: &Arc<Session>) -> io::Result<()> {
        self.inner
            .epoll
            .add(
                session.stream(),
                EpollEvent::new(session_flags(), session.token().as_u64()),
            )
            .map_err(io::Error::from)
    }

    fn flush(&self, session: &Arc<Session>) -> io::Result<usize> {
        session.write_pending()
    }

    fn deregister(&self, session: &Session) {
        // ENOENT if registration never happened
        let _ = self.inner.epoll.delete(session.stream());
    }

    fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::Release);
    }

    fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Err(e) = self.inner.notifier.notify() {
            error!(error = %e, "failed to wake epoll thread");
        }
    }
}
