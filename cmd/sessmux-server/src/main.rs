//! sessmux frame echo server
//!
//! Every complete frame a client sends is re-encoded and sent straight back
//! to the same session. Useful as a smoke test for both engines and as the
//! peer for `sessmux-client`.
//!
//! Usage:
//!     cargo build --release -p sessmux-server
//!     ./target/release/sessmux-server --port 9000 --backend epoll
//!     ./target/release/sessmux-server --backend io_uring --workers 4 -vv
//!
//! Every option falls back to its `SESSMUX_*` environment variable, then
//! to the built-in default.

use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use sessmux_core::frame::encode_frame;
use sessmux_core::{Backend, ServerConfig, SessionControl};
use sessmux_module::{Inbound, QueueDispatcher, Server, ServerHandle};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "sessmux frame echo server", long_about = None)]
struct Args {
    /// Address to bind
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// I/O backend: epoll or io_uring
    #[arg(long)]
    backend: Option<Backend>,

    /// epoll worker threads / io_uring lanes (0 = auto)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Protocol errors tolerated per session before it is closed
    #[arg(long)]
    max_errors: Option<u32>,

    /// Largest accepted frame, header included
    #[arg(long)]
    max_frame_len: Option<u32>,

    /// Never hand a closed session's identity out again
    #[arg(long)]
    no_recycle: bool,

    /// Seconds between stats reports (0 disables)
    #[arg(long)]
    stats_secs: Option<u64>,

    /// Increase logging verbosity (-v: debug, -vv: trace); RUST_LOG wins
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> ServerConfig {
        let mut config = ServerConfig::from_env();
        if let Some(bind) = self.bind {
            config = config.bind_addr(bind);
        }
        if let Some(port) = self.port {
            config = config.port(port);
        }
        if let Some(backend) = self.backend {
            config = config.backend(backend);
        }
        if let Some(n) = self.workers {
            config = config.worker_threads(n);
        }
        if let Some(n) = self.max_sessions {
            config = config.max_sessions(n);
        }
        if let Some(n) = self.max_errors {
            config = config.max_errors(n);
        }
        if let Some(n) = self.max_frame_len {
            config = config.max_frame_len(n);
        }
        if self.no_recycle {
            config = config.recycle_identities(false);
        }
        if let Some(secs) = self.stats_secs {
            config = config.stats_interval(Duration::from_secs(secs));
        }
        config
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

/// Application thread: echo every frame back to its sender.
fn echo_loop(handle: ServerHandle, inbound: Receiver<Inbound>) {
    while RUNNING.load(Ordering::Relaxed) {
        let msg = match inbound.recv_timeout(Duration::from_millis(100)) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match msg {
            Inbound::Open { identity, peer } => debug!(%identity, %peer, "open"),
            Inbound::Frame {
                identity,
                kind,
                payload,
            } => {
                let Some(bytes) = encode_frame(kind, &payload) else {
                    warn!(%identity, kind, len = payload.len(), "frame too large to echo");
                    continue;
                };
                if !handle.send(identity, &bytes) {
                    debug!(%identity, kind, "echo refused");
                }
            }
            Inbound::Close { identity } => debug!(%identity, "close"),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }

    let (dispatcher, inbound) = QueueDispatcher::unbounded();
    let server = match Server::start(args.config(), Arc::new(dispatcher)) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start server");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %server.local_addr(), "echo server ready, Ctrl-C to stop");

    let handle = server.handle();
    let app = match thread::Builder::new()
        .name("sessmux-echo".into())
        .spawn(move || echo_loop(handle, inbound))
    {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "failed to spawn echo thread");
            server.shutdown();
            return ExitCode::FAILURE;
        }
    };

    while RUNNING.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }

    let stats = server.shutdown();
    if app.join().is_err() {
        error!("echo thread panicked");
    }
    info!(%stats, "done");
    ExitCode::SUCCESS
}
