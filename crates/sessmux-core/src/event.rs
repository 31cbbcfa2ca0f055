//! I/O event vocabulary shared by both engines.
//!
//! The readiness engine reports `ReadyEvent`s, the completion engine reports
//! per-operation completions; both carry a `Token` naming the session and
//! are reduced to an `IoOutcome` before the worker acts on them.

use core::fmt;
use std::io;

use crate::identity::Identity;

/// Session reference carried through the kernel.
///
/// Packs the identity (low 32 bits) with the table-assigned generation
/// (high 32 bits). An identity that was closed and handed out again gets a
/// new generation, so an event queued for the old session no longer matches.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Token(u64);

impl Token {
    #[inline]
    pub const fn new(identity: Identity, generation: u32) -> Self {
        Token(((generation as u64) << 32) | identity.as_u32() as u64)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Token(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn identity(self) -> Identity {
        Identity::new(self.0 as u32)
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}#{})", self.identity(), self.generation())
    }
}

/// Readiness flags decoded from one epoll event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or half-closed its write side.
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    /// Hangup or error: the session must be closed once pending input has
    /// been drained.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.hangup || self.error
    }
}

/// One session readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub token: Token,
    pub readiness: Readiness,
}

/// Kind of an in-flight completion operation.
///
/// Encoded in the top byte of io_uring `user_data`; the low 56 bits hold
/// the op context's slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpTag {
    Recv = 1,
    Send = 2,
    /// Lane wake-up read on the notifier eventfd.
    Wake = 3,
}

impl OpTag {
    const SHIFT: u32 = 56;
    const SLOT_MASK: u64 = (1u64 << Self::SHIFT) - 1;

    /// Pack this tag with a slot index into a `user_data` value.
    #[inline]
    pub const fn user_data(self, slot: usize) -> u64 {
        ((self as u64) << Self::SHIFT) | (slot as u64 & Self::SLOT_MASK)
    }

    /// Split a `user_data` value into tag and slot.
    #[inline]
    pub fn decode(user_data: u64) -> Option<(OpTag, usize)> {
        let tag = match user_data >> Self::SHIFT {
            1 => OpTag::Recv,
            2 => OpTag::Send,
            3 => OpTag::Wake,
            _ => return None,
        };
        Some((tag, (user_data & Self::SLOT_MASK) as usize))
    }
}

/// Uniform result of one receive or send.
#[derive(Debug)]
pub enum IoOutcome {
    /// `n > 0` bytes moved.
    Transferred(usize),
    /// Zero-byte receive: orderly shutdown by the peer.
    PeerClosed,
    Failed(io::Error),
}

impl IoOutcome {
    /// From a `read(2)` / `write(2)` style result.
    #[inline]
    pub fn from_io(res: io::Result<usize>) -> Self {
        match res {
            Ok(0) => IoOutcome::PeerClosed,
            Ok(n) => IoOutcome::Transferred(n),
            Err(e) => IoOutcome::Failed(e),
        }
    }

    /// From an io_uring CQE result (negative errno on failure).
    #[inline]
    pub fn from_cqe(res: i32) -> Self {
        match res {
            0 => IoOutcome::PeerClosed,
            n if n > 0 => IoOutcome::Transferred(n as usize),
            errno => IoOutcome::Failed(io::Error::from_raw_os_error(-errno)),
        }
    }

    /// EAGAIN / EINTR: nothing happened, try again later.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        match self {
            IoOutcome::Failed(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_packing() {
        let t = Token::new(Identity::new(7), 3);
        assert_eq!(t.identity(), Identity::new(7));
        assert_eq!(t.generation(), 3);
        assert_eq!(Token::from_raw(t.as_u64()), t);
        assert_ne!(t, Token::new(Identity::new(7), 4));
    }

    #[test]
    fn test_user_data_roundtrip() {
        let ud = OpTag::Send.user_data(12345);
        assert_eq!(OpTag::decode(ud), Some((OpTag::Send, 12345)));
        assert_eq!(OpTag::decode(42), None);
    }

    #[test]
    fn test_outcome_from_cqe() {
        assert!(matches!(IoOutcome::from_cqe(10), IoOutcome::Transferred(10)));
        assert!(matches!(IoOutcome::from_cqe(0), IoOutcome::PeerClosed));
        assert!(IoOutcome::from_cqe(-11).is_retryable()); // EAGAIN
        assert!(!IoOutcome::from_cqe(-104).is_retryable()); // ECONNRESET
    }

    #[test]
    fn test_outcome_from_io() {
        assert!(matches!(IoOutcome::from_io(Ok(0)), IoOutcome::PeerClosed));
        assert!(matches!(IoOutcome::from_io(Ok(5)), IoOutcome::Transferred(5)));
        let e = io::Error::from(io::ErrorKind::Interrupted);
        assert!(IoOutcome::from_io(Err(e)).is_retryable());
    }

    #[test]
    fn test_readiness_terminal() {
        let r = Readiness {
            readable: true,
            ..Default::default()
        };
        assert!(!r.is_terminal());
        let r = Readiness {
            hangup: true,
            ..Default::default()
        };
        assert!(r.is_terminal());
    }
}
