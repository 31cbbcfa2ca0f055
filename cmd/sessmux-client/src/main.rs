//! sessmux load and correctness client
//!
//! Opens N connections to an echo server, sends random frames on each,
//! cutting the byte stream at random points so frames straddle writes,
//! and checks that exactly the same bytes come back.
//!
//! Usage:
//!     ./target/release/sessmux-client 127.0.0.1:9000 -c 16 -n 10000
//!     ./target/release/sessmux-client 127.0.0.1:9000 --seed 42 --max-chunk 3

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use sessmux_core::frame::encode_frame;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "sessmux echo verification client", long_about = None)]
struct Args {
    /// Server address
    #[arg(default_value = "127.0.0.1:9000")]
    addr: SocketAddr,

    /// Concurrent connections
    #[arg(short, long, default_value_t = 4)]
    connections: usize,

    /// Frames per connection
    #[arg(short = 'n', long, default_value_t = 1000)]
    frames: usize,

    /// Largest payload per frame
    #[arg(long, default_value_t = 512)]
    max_payload: usize,

    /// Largest write; the stream is cut at random sizes up to this
    #[arg(long, default_value_t = 1500)]
    max_chunk: usize,

    /// RNG seed (0 = derive from the clock)
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Seconds to wait for echoed bytes before failing
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

#[derive(Debug, Default)]
struct Outcome {
    frames: usize,
    bytes: usize,
}

/// Frames for one connection, already concatenated on the wire.
fn build_stream(rng: &mut StdRng, frames: usize, max_payload: usize) -> Vec<u8> {
    let mut wire = Vec::new();
    for _ in 0..frames {
        let kind = rng.gen_range(1..=1000u32);
        let mut payload = vec![0u8; rng.gen_range(1..=max_payload.max(1))];
        rng.fill_bytes(&mut payload);
        if let Some(frame) = encode_frame(kind, &payload) {
            wire.extend_from_slice(&frame);
        }
    }
    wire
}

fn run_connection(args: &Args, id: usize, seed: u64) -> io::Result<Outcome> {
    let mut rng = StdRng::seed_from_u64(seed);
    let wire = build_stream(&mut rng, args.frames, args.max_payload);

    let stream = TcpStream::connect(args.addr)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_secs(args.timeout_secs)))?;

    let mut writer = stream.try_clone()?;
    let max_chunk = args.max_chunk.max(1);
    let to_send = wire.clone();
    let sender = thread::Builder::new()
        .name(format!("client-tx-{}", id))
        .spawn(move || -> io::Result<()> {
            let mut off = 0;
            while off < to_send.len() {
                let n = rng.gen_range(1..=max_chunk).min(to_send.len() - off);
                writer.write_all(&to_send[off..off + n])?;
                off += n;
            }
            Ok(())
        })?;

    let mut echoed = vec![0u8; wire.len()];
    let read = (&stream).read_exact(&mut echoed);
    let sent = sender
        .join()
        .map_err(|_| io::Error::other("sender thread panicked"))?;
    sent?;
    read?;

    if let Some(pos) = echoed.iter().zip(&wire).position(|(a, b)| a != b) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("echo mismatch at byte {} of {}", pos, wire.len()),
        ));
    }

    Ok(Outcome {
        frames: args.frames,
        bytes: wire.len(),
    })
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let seed = match args.seed {
        0 => rand::random(),
        s => s,
    };
    info!(
        addr = %args.addr,
        connections = args.connections,
        frames = args.frames,
        seed,
        "starting"
    );

    let start = Instant::now();
    let results: Vec<io::Result<Outcome>> = thread::scope(|scope| {
        let workers: Vec<_> = (0..args.connections)
            .map(|id| {
                let args = &args;
                scope.spawn(move || run_connection(args, id, seed.wrapping_add(id as u64)))
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap_or_else(|_| Err(io::Error::other("connection thread panicked"))))
            .collect()
    });
    let elapsed = start.elapsed();

    let mut total = Outcome::default();
    let mut failures = 0;
    for (id, result) in results.into_iter().enumerate() {
        match result {
            Ok(outcome) => {
                total.frames += outcome.frames;
                total.bytes += outcome.bytes;
            }
            Err(e) => {
                failures += 1;
                error!(connection = id, error = %e, "connection failed");
            }
        }
    }

    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        frames = total.frames,
        bytes = total.bytes,
        failures,
        elapsed_ms = elapsed.as_millis() as u64,
        frames_per_sec = (total.frames as f64 / secs) as u64,
        "done"
    );

    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
