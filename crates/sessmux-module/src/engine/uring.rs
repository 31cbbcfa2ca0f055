//! `UringEngine` — completion backend.
//!
//! Sessions are spread over N lanes (`identity % N`). Each lane is one
//! `sessmux-uring-N` thread that owns one io_uring instance and is the
//! only thread that ever touches it. Other threads talk to a lane through
//! its request queue plus eventfd:
//!
//! ```text
//!  sessmux-accept ──Register──┐
//!  ServerHandle::send ─Flush──┼─► SegQueue ─► notify ─► lane wakes, arms ops
//! ```
//!
//! Every in-flight operation owns an `OpContext` in the lane's slab: the
//! buffer the kernel reads into or writes from, plus an `Arc<Session>` that
//! keeps the fd open until the completion is reaped. `user_data` is
//! `OpTag << 56 | slot`.
//!
//! At most one receive and one send are outstanding per session. Received
//! bytes are copied into the session's receive buffer and go through the
//! same `process_arrival` path as the readiness engine.

use std::io;
use std::net::{Shutdown, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;
use io_uring::{opcode, squeue, types, IoUring};
use parking_lot::Mutex;
use sessmux_core::{Backend, CloseMode, Error, IoOutcome, OpTag, Result, ServerConfig, Verdict};
use socket2::SockRef;
use tracing::{debug, error, warn};

use super::Multiplexer;
use crate::acceptor;
use crate::notifier::EventFdNotifier;
use crate::server::{CloseReason, ServerShared};
use crate::session::Session;
use crate::stats::Stats;
use crate::worker::process_arrival;

/// `user_data` of cancel requests; decodes to no op tag.
const CANCEL: u64 = u64::MAX;

enum LaneRequest {
    /// Arm the first receive of a newly admitted session.
    Register(Arc<Session>),
    /// Staged send bytes are waiting.
    Flush(Arc<Session>),
}

struct LaneQueue {
    requests: SegQueue<LaneRequest>,
    notifier: EventFdNotifier,
}

impl LaneQueue {
    fn push(&self, request: LaneRequest) -> io::Result<()> {
        self.requests.push(request);
        self.notifier.notify()
    }
}

struct UringInner {
    lanes: Vec<Arc<LaneQueue>>,
    /// Created up front so setup failures surface from `new`; moved into
    /// the lane threads by `start`.
    rings: Mutex<Vec<IoUring>>,
    /// Clone of the listening socket, used to unblock the accept thread.
    listener: Mutex<Option<TcpListener>>,
    running: AtomicBool,
    recv_chunk: usize,
}

impl UringInner {
    #[inline]
    fn lane_for(&self, session: &Session) -> &LaneQueue {
        let idx = session.identity().as_usize() % self.lanes.len();
        &self.lanes[idx]
    }
}

pub struct UringEngine {
    inner: Arc<UringInner>,
}

impl UringEngine {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let setup = |source: io::Error| Error::EngineSetup {
            backend: "io_uring",
            source,
        };

        let lanes = config.effective_workers().max(1);
        let mut rings = Vec::with_capacity(lanes);
        let mut queues = Vec::with_capacity(lanes);
        for _ in 0..lanes {
            rings.push(IoUring::new(config.uring_entries).map_err(setup)?);
            queues.push(Arc::new(LaneQueue {
                requests: SegQueue::new(),
                notifier: EventFdNotifier::create().map_err(setup)?,
            }));
        }

        Ok(Self {
            inner: Arc::new(UringInner {
                lanes: queues,
                rings: Mutex::new(rings),
                listener: Mutex::new(None),
                running: AtomicBool::new(true),
                recv_chunk: config.recv_chunk,
            }),
        })
    }

    fn spawn_all(
        &self,
        shared: Arc<ServerShared>,
        listener: TcpListener,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> Result<()> {
        let rings = std::mem::take(&mut *self.inner.rings.lock());
        if rings.is_empty() {
            return Err(Error::InvalidConfig("io_uring engine already started"));
        }

        for (id, ring) in rings.into_iter().enumerate() {
            let lane = Lane {
                id,
                ring,
                ops: OpSlab::new(),
                completed: Vec::new(),
                queue: Arc::clone(&self.inner.lanes[id]),
                inner: Arc::clone(&self.inner),
                shared: Arc::clone(&shared),
            };
            let handle = thread::Builder::new()
                .name(format!("sessmux-uring-{}", id))
                .spawn(move || lane.run())?;
            handles.push(handle);
        }

        *self.inner.listener.lock() = Some(listener.try_clone()?);
        let handle = thread::Builder::new()
            .name("sessmux-accept".into())
            .spawn(move || acceptor::accept_loop(shared, listener))?;
        handles.push(handle);
        Ok(())
    }
}

impl Multiplexer for UringEngine {
    fn backend(&self) -> Backend {
        Backend::Completion
    }

    fn start(&self, shared: Arc<ServerShared>, listener: TcpListener) -> Result<Vec<JoinHandle<()>>> {
        listener.set_nonblocking(false)?;
        let mut handles = Vec::with_capacity(self.inner.lanes.len() + 1);
        if let Err(e) = self.spawn_all(shared, listener, &mut handles) {
            self.stop_accepting();
            self.shutdown();
            for handle in handles {
                let _ = handle.join();
            }
            return Err(e);
        }
        Ok(handles)
    }

    fn register(&self, session: &Arc<Session>) -> io::Result<()> {
        self.inner
            .lane_for(session)
            .push(LaneRequest::Register(Arc::clone(session)))
    }

    fn flush(&self, session: &Arc<Session>) -> io::Result<usize> {
        self.inner
            .lane_for(session)
            .push(LaneRequest::Flush(Arc::clone(session)))?;
        Ok(0)
    }

    fn deregister(&self, _session: &Session) {
        // Nothing to remove: the transport shutdown that follows completes
        // the session's outstanding ops, and their contexts are reaped then.
    }

    fn stop_accepting(&self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            // wakes the blocked accept(2) with EINVAL
            if let Err(e) = SockRef::from(&listener).shutdown(Shutdown::Both) {
                debug!(error = %e, "listener shutdown failed");
            }
        }
    }

    fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        for (id, lane) in self.inner.lanes.iter().enumerate() {
            if let Err(e) = lane.notifier.notify() {
                error!(lane = id, error = %e, "failed to wake lane");
            }
        }
    }
}

// ── Op slab ──

struct OpContext {
    tag: OpTag,
    session: Option<Arc<Session>>,
    /// Kernel-visible memory for the op. Heap-allocated, so it stays put
    /// when the slab itself grows.
    buffer: Vec<u8>,
}

#[derive(Default)]
struct OpSlab {
    slots: Vec<Option<OpContext>>,
    free: Vec<usize>,
    active: usize,
}

impl OpSlab {
    fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, ctx: OpContext) -> usize {
        self.active += 1;
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(ctx);
                idx
            }
            None => {
                self.slots.push(Some(ctx));
                self.slots.len() - 1
            }
        }
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut OpContext> {
        self.slots.get_mut(idx)?.as_mut()
    }

    fn take(&mut self, idx: usize) -> Option<OpContext> {
        let ctx = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.active -= 1;
        Some(ctx)
    }

    fn in_flight(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|ctx| ctx.tag.user_data(idx)))
    }

    fn is_empty(&self) -> bool {
        self.active == 0
    }
}

// ── Lane ──

struct Lane {
    id: usize,
    // declared before `ops`: the ring is torn down before op buffers drop
    ring: IoUring,
    ops: OpSlab,
    completed: Vec<(u64, i32)>,
    queue: Arc<LaneQueue>,
    inner: Arc<UringInner>,
    shared: Arc<ServerShared>,
}

impl Lane {
    fn run(mut self) {
        debug!(lane = self.id, "lane started");
        if let Err(e) = self.arm_wake() {
            error!(lane = self.id, error = %e, "failed to arm wake-up");
            return;
        }

        while self.inner.running.load(Ordering::Acquire) {
            self.process_requests();

            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(lane = self.id, error = %e, "io_uring_enter failed, lane stopping");
                    break;
                }
            }
            self.reap();
        }

        self.cancel_all();
        debug!(lane = self.id, "lane exiting");
    }

    fn process_requests(&mut self) {
        while let Some(request) = self.queue.requests.pop() {
            match request {
                LaneRequest::Register(session) if session.is_active() => self.arm_recv(&session),
                LaneRequest::Flush(session) if session.is_active() => self.arm_send(&session),
                _ => {}
            }
        }
    }

    fn reap(&mut self) {
        let mut done = std::mem::take(&mut self.completed);
        done.extend(self.ring.completion().map(|cqe| (cqe.user_data(), cqe.result())));
        for &(user_data, res) in &done {
            self.on_completion(user_data, res);
        }
        done.clear();
        self.completed = done;
    }

    fn on_completion(&mut self, user_data: u64, res: i32) {
        let Some((tag, slot)) = OpTag::decode(user_data) else {
            return;
        };
        let Some(ctx) = self.ops.take(slot) else {
            warn!(lane = self.id, slot, "completion for empty op slot");
            return;
        };
        match tag {
            OpTag::Wake => {
                let _ = self.queue.notifier.drain();
                if self.inner.running.load(Ordering::Acquire) {
                    if let Err(e) = self.arm_wake() {
                        error!(lane = self.id, error = %e, "failed to re-arm wake-up");
                    }
                }
            }
            OpTag::Recv => {
                if let Some(session) = ctx.session {
                    self.on_recv(session, &ctx.buffer, res);
                }
            }
            OpTag::Send => {
                if let Some(session) = ctx.session {
                    self.on_send(session, res);
                }
            }
        }
    }

    fn on_recv(&mut self, session: Arc<Session>, data: &[u8], res: i32) {
        if !session.is_active() || self.shared.resolve(session.token()).is_none() {
            return;
        }

        match IoOutcome::from_cqe(res) {
            IoOutcome::Transferred(n) => {
                let close = {
                    let mut recv = session.recv.lock();
                    if recv.buffer.append(&data[..n]).is_err() {
                        Some(CloseReason::BufferOverflow)
                    } else if process_arrival(&self.shared, &session, &mut recv, n) == Verdict::ErrorLimit {
                        Some(CloseReason::ErrorLimit)
                    } else {
                        None
                    }
                };
                match close {
                    Some(reason) => self.close(&session, reason),
                    // closed from inside the dispatcher
                    None if !session.is_active() => {}
                    None => self.arm_recv(&session),
                }
            }
            IoOutcome::PeerClosed => self.close(&session, CloseReason::PeerClosed),
            outcome if outcome.is_retryable() => self.arm_recv(&session),
            IoOutcome::Failed(e) => self.close(&session, CloseReason::Io(e.kind())),
        }
    }

    fn on_send(&mut self, session: Arc<Session>, res: i32) {
        let outcome = IoOutcome::from_cqe(res);
        let more = {
            let mut send = session.send.lock();
            send.in_flight = false;
            match &outcome {
                IoOutcome::Transferred(n) => {
                    if send.buffer.consume(*n).is_err() {
                        send.buffer.clear();
                    }
                    Stats::add(&self.shared.stats.bytes_out, *n as u64);
                    !send.buffer.is_empty()
                }
                _ => outcome.is_retryable(),
            }
        };

        if !session.is_active() {
            return;
        }
        match outcome {
            IoOutcome::PeerClosed => {
                self.close(&session, CloseReason::Io(io::ErrorKind::WriteZero));
            }
            IoOutcome::Failed(e) if !more => self.close(&session, CloseReason::Io(e.kind())),
            _ if more => self.arm_send(&session),
            _ => {}
        }
    }

    fn arm_wake(&mut self) -> io::Result<()> {
        let slot = self.ops.insert(OpContext {
            tag: OpTag::Wake,
            session: None,
            buffer: Vec::new(),
        });
        let sqe = opcode::PollAdd::new(types::Fd(self.queue.notifier.fd()), libc::POLLIN as u32)
            .build()
            .user_data(OpTag::Wake.user_data(slot));
        self.push(sqe).inspect_err(|_| {
            self.ops.take(slot);
        })
    }

    fn arm_recv(&mut self, session: &Arc<Session>) {
        let want = match session.recv.lock().reserve(self.inner.recv_chunk) {
            Ok(want) => want,
            Err(_) => {
                self.close(session, CloseReason::BufferOverflow);
                return;
            }
        };

        let slot = self.ops.insert(OpContext {
            tag: OpTag::Recv,
            session: Some(Arc::clone(session)),
            buffer: vec![0u8; want],
        });
        let Some(ctx) = self.ops.get_mut(slot) else {
            return;
        };
        let sqe = opcode::Recv::new(types::Fd(session.fd()), ctx.buffer.as_mut_ptr(), want as u32)
            .build()
            .user_data(OpTag::Recv.user_data(slot));

        if let Err(e) = self.push(sqe) {
            self.ops.take(slot);
            self.close(session, CloseReason::Io(e.kind()));
        }
    }

    fn arm_send(&mut self, session: &Arc<Session>) {
        let buffer = {
            let mut send = session.send.lock();
            if send.in_flight || send.buffer.is_empty() {
                return;
            }
            send.in_flight = true;
            send.buffer.read_slice().to_vec()
        };

        let len = buffer.len() as u32;
        let slot = self.ops.insert(OpContext {
            tag: OpTag::Send,
            session: Some(Arc::clone(session)),
            buffer,
        });
        let Some(ctx) = self.ops.get_mut(slot) else {
            return;
        };
        let sqe = opcode::Send::new(types::Fd(session.fd()), ctx.buffer.as_ptr(), len)
            .build()
            .user_data(OpTag::Send.user_data(slot));

        if let Err(e) = self.push(sqe) {
            self.ops.take(slot);
            session.send.lock().in_flight = false;
            self.close(session, CloseReason::Io(e.kind()));
        }
    }

    /// Queue one SQE, submitting first if the SQ is full.
    fn push(&mut self, sqe: squeue::Entry) -> io::Result<()> {
        loop {
            // SAFETY: every buffer an SQE points at is owned by an op context
            // in `self.ops`, which is only released once the op's CQE is reaped.
            if unsafe { self.ring.submission().push(&sqe) }.is_ok() {
                return Ok(());
            }
            self.ring.submit()?;
        }
    }

    fn close(&self, session: &Session, reason: CloseReason) {
        self.shared.close_session(session, CloseMode::Graceful, reason);
    }

    /// Cancel every outstanding op and reap until the slab is empty.
    fn cancel_all(&mut self) {
        let pending: Vec<u64> = self.ops.in_flight().collect();
        for user_data in pending {
            let sqe = opcode::AsyncCancel::new(user_data).build().user_data(CANCEL);
            if let Err(e) = self.push(sqe) {
                error!(lane = self.id, error = %e, "cancel submission failed");
            }
        }

        while !self.ops.is_empty() {
            if let Err(e) = self.ring.submit_and_wait(1) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(lane = self.id, error = %e, "lane drain failed");
                // the kernel may still write into these buffers
                std::mem::forget(std::mem::take(&mut self.ops));
                return;
            }
            let reaped: Vec<u64> = self.ring.completion().map(|cqe| cqe.user_data()).collect();
            for user_data in reaped {
                if let Some((_, slot)) = OpTag::decode(user_data) {
                    self.ops.take(slot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wake_ctx() -> OpContext {
        OpContext {
            tag: OpTag::Wake,
            session: None,
            buffer: Vec::new(),
        }
    }

    #[test]
    fn test_slab_reuses_slots() {
        let mut slab = OpSlab::new();
        let a = slab.insert(wake_ctx());
        let b = slab.insert(wake_ctx());
        assert_ne!(a, b);
        assert!(slab.take(a).is_some());
        assert!(slab.take(a).is_none());
        assert_eq!(slab.insert(wake_ctx()), a);
        assert!(!slab.is_empty());
    }

    #[test]
    fn test_slab_in_flight_user_data() {
        let mut slab = OpSlab::new();
        let a = slab.insert(wake_ctx());
        let b = slab.insert(OpContext {
            tag: OpTag::Recv,
            session: None,
            buffer: vec![0; 16],
        });
        slab.take(a);
        let pending: Vec<u64> = slab.in_flight().collect();
        assert_eq!(pending, vec![OpTag::Recv.user_data(b)]);
        slab.take(b);
        assert!(slab.is_empty());
    }

    #[test]
    fn test_cancel_user_data_is_not_an_op() {
        assert!(OpTag::decode(CANCEL).is_none());
    }
}
