//! Application boundary.
//!
//! The transport hands complete frames *out* through a `Dispatcher` and
//! accepts commands *in* through `SessionControl`. Neither trait knows
//! anything about packet semantics.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::frame::Frame;
use crate::identity::Identity;

/// Receives complete frames from the transport.
///
/// # Contract
///
/// - `enqueue` is called exactly once per complete frame, in per-session
///   stream order, from a worker thread. The frame borrows the session's
///   receive buffer; copy what must outlive the call.
/// - `on_open` precedes the first `enqueue` for an identity and `on_close`
///   follows the last one.
/// - Implementations may call `SessionControl::send` from inside any of
///   these callbacks.
pub trait Dispatcher: Send + Sync {
    fn enqueue(&self, identity: Identity, frame: Frame<'_>);

    /// A session was admitted.
    fn on_open(&self, _identity: Identity, _peer: SocketAddr) {}

    /// A session was removed. Clear any identity-keyed state here.
    fn on_close(&self, _identity: Identity) {}
}

/// How a session's transport is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseMode {
    /// Orderly shutdown (FIN).
    #[default]
    Graceful,
    /// Abortive close: `SO_LINGER {on, 0}`, the peer sees a reset.
    Force,
}

/// Commands the application may issue to the transport.
pub trait SessionControl: Send + Sync {
    /// Stage `bytes` for transmission and kick a flush.
    ///
    /// Returns false when the identity has no live session or the bytes do
    /// not fit the session's send ceiling.
    fn send(&self, identity: Identity, bytes: &[u8]) -> bool;

    /// Close a session with the given mode. False if it was not live.
    fn close_with(&self, identity: Identity, mode: CloseMode) -> bool;

    /// Graceful close.
    fn close(&self, identity: Identity) -> bool {
        self.close_with(identity, CloseMode::Graceful)
    }

    /// Reverse lookup from a live session's socket fd.
    fn identity_of(&self, fd: RawFd) -> Option<Identity>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        closes: Mutex<Vec<(Identity, CloseMode)>>,
    }

    impl SessionControl for Recorder {
        fn send(&self, _identity: Identity, _bytes: &[u8]) -> bool {
            false
        }

        fn close_with(&self, identity: Identity, mode: CloseMode) -> bool {
            self.closes.lock().unwrap().push((identity, mode));
            true
        }

        fn identity_of(&self, _fd: RawFd) -> Option<Identity> {
            None
        }
    }

    #[test]
    fn test_close_defaults_to_graceful() {
        let r = Recorder::default();
        assert!(r.close(Identity::new(4)));
        assert!(r.close_with(Identity::new(5), CloseMode::Force));
        let closes = r.closes.lock().unwrap();
        assert_eq!(closes[0], (Identity::new(4), CloseMode::Graceful));
        assert_eq!(closes[1], (Identity::new(5), CloseMode::Force));
    }
}
