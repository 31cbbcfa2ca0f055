//! # sessmux-module — OS-facing implementations
//!
//! Everything in `sessmux-core` is pure data and algorithms; this crate
//! wires it to sockets, epoll, io_uring and threads.
//!
//! ## Default stack
//!
//! | Concern          | Implementation      | Alternative                 |
//! |------------------|---------------------|-----------------------------|
//! | Multiplexer      | EpollEngine         | UringEngine (`io_uring`)    |
//! | Dispatcher       | QueueDispatcher     | any `Dispatcher` impl       |
//! | Wake-up          | EventFdNotifier     |                             |
//! | Maintenance      | Scheduler (heap)    |                             |
//!
//! ## Threads
//!
//! ```text
//!  epoll:     sessmux-epoll ──ReadyEvent──► sessmux-worker-0..N
//!  io_uring:  sessmux-accept ──register──► sessmux-uring-0..N (one ring each)
//!  both:      sessmux-timer
//! ```

pub mod session;
pub mod table;
pub mod notifier;
pub mod engine;
pub mod acceptor;
pub mod worker;
pub mod timer;
pub mod stats;
pub mod dispatcher;
pub mod listener;
pub mod server;

pub use session::{Session, SessionState};
pub use table::SessionTable;
pub use notifier::EventFdNotifier;
pub use engine::{create_engine, EpollEngine, Multiplexer, UringEngine};
pub use timer::{Scheduler, TimerAction, TimerCallback, TimerEntry};
pub use stats::{Stats, StatsSnapshot};
pub use dispatcher::{Inbound, QueueDispatcher};
pub use server::{CloseReason, Server, ServerHandle, ServerShared};
