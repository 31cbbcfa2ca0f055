//! `QueueDispatcher` — default `Dispatcher` implementation.
//!
//! Copies every frame into an owned `Inbound` message and pushes it onto a
//! `crossbeam_channel`, so application logic runs on its own thread(s)
//! instead of inside the I/O workers. Open and close notifications travel
//! on the same channel, which keeps them ordered with the frames of that
//! session.

use std::net::SocketAddr;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use sessmux_core::{Dispatcher, Frame, Identity};
use tracing::warn;

/// Message delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Open { identity: Identity, peer: SocketAddr },
    Frame { identity: Identity, kind: u32, payload: Vec<u8> },
    Close { identity: Identity },
}

impl Inbound {
    pub fn identity(&self) -> Identity {
        match self {
            Inbound::Open { identity, .. }
            | Inbound::Frame { identity, .. }
            | Inbound::Close { identity } => *identity,
        }
    }
}

pub struct QueueDispatcher {
    tx: Sender<Inbound>,
}

impl QueueDispatcher {
    /// Unbounded queue.
    pub fn unbounded() -> (Self, Receiver<Inbound>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    /// Bounded queue. When full, frames are dropped with a warning rather
    /// than stalling the I/O worker.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Inbound>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx }, rx)
    }

    fn push(&self, msg: Inbound) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!(identity = %msg.identity(), "dispatch queue full, message dropped");
            }
            // receiver gone: application is shutting down
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl Dispatcher for QueueDispatcher {
    fn enqueue(&self, identity: Identity, frame: Frame<'_>) {
        self.push(Inbound::Frame {
            identity,
            kind: frame.kind(),
            payload: frame.payload.to_vec(),
        });
    }

    fn on_open(&self, identity: Identity, peer: SocketAddr) {
        self.push(Inbound::Open { identity, peer });
    }

    fn on_close(&self, identity: Identity) {
        self.push(Inbound::Close { identity });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessmux_core::frame::encode_frame;

    #[test]
    fn test_messages_in_order() {
        let (d, rx) = QueueDispatcher::unbounded();
        let id = Identity::new(3);
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let bytes = encode_frame(12, b"abc").unwrap();

        d.on_open(id, peer);
        d.enqueue(id, Frame::parse(&bytes).unwrap());
        d.on_close(id);

        assert_eq!(rx.recv().unwrap(), Inbound::Open { identity: id, peer });
        assert_eq!(
            rx.recv().unwrap(),
            Inbound::Frame {
                identity: id,
                kind: 12,
                payload: b"abc".to_vec()
            }
        );
        assert_eq!(rx.recv().unwrap(), Inbound::Close { identity: id });
    }

    #[test]
    fn test_full_queue_drops() {
        let (d, rx) = QueueDispatcher::bounded(1);
        d.on_close(Identity::new(1));
        d.on_close(Identity::new(2));
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.recv().unwrap().identity(), Identity::new(1));
    }
}
