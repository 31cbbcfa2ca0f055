//! Stream-to-frame reassembly.
//!
//! TCP delivers an unstructured byte stream; the reassembler turns whatever
//! has accumulated in a session's receive buffer into complete frames.
//! It is called once per arrival, after the engine has advanced the
//! buffer's write cursor by `io_size` bytes.
//!
//! ```text
//!  loop while readable > 0:
//!    errors >= max_errors      → ErrorLimit, stop
//!    readable <= HEADER_SIZE   → stop, wait for more
//!    peek header
//!    length <= HEADER_SIZE     → violation (undersized), errors += 1, stop
//!    length >  max_frame_len   → violation (oversized),  errors += 1, stop
//!    readable < length         → stop, wait for more
//!    sink(frame) == Break      → Stopped, frame left unconsumed
//!    consume(length)
//! ```
//!
//! The algorithm is backend-agnostic: the readiness and completion engines
//! both feed it the same way.

use std::ops::ControlFlow;

use crate::frame::{Frame, FrameHeader, HEADER_SIZE};
use crate::ring_buffer::RingBuffer;

/// A protocol violation detected in a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Declared length does not exceed the header size.
    Undersized { length: u32 },
    /// Declared length exceeds the configured maximum.
    Oversized { length: u32, max: u32 },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undersized { length } => {
                write!(f, "declared length {} <= header size {}", length, HEADER_SIZE)
            }
            Self::Oversized { length, max } => {
                write!(f, "declared length {} > max frame length {}", length, max)
            }
        }
    }
}

/// What the caller must do with the session after a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the session and re-arm the next receive.
    Continue,
    /// The error counter reached the limit: close the session.
    ErrorLimit,
    /// The sink refused a frame (session no longer live). Nothing after
    /// that frame was dispatched.
    Stopped,
}

/// Result of one `Reassembler::feed` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reassembly {
    /// Frames handed to the sink, in buffer order.
    pub dispatched: usize,
    /// Bytes consumed from the buffer by those frames.
    pub consumed: usize,
    /// Sum of `io_size - length` over the dispatched frames: sizes the
    /// growth check made before the next receive is armed.
    pub remaining: usize,
    /// Header violation that stopped this feed, if any.
    pub violation: Option<Violation>,
    pub verdict: Verdict,
}

/// Frame reassembler for one server; cheap to copy, holds only limits.
#[derive(Debug, Clone, Copy)]
pub struct Reassembler {
    max_errors: u32,
    max_frame_len: u32,
}

impl Reassembler {
    pub fn new(max_errors: u32, max_frame_len: u32) -> Self {
        Self {
            max_errors,
            max_frame_len,
        }
    }

    #[inline]
    pub fn max_errors(&self) -> u32 {
        self.max_errors
    }

    #[inline]
    pub fn max_frame_len(&self) -> u32 {
        self.max_frame_len
    }

    /// Extract every complete frame from `buffer`.
    ///
    /// `errors` is the session's protocol error counter; it is incremented
    /// at most once per call. `sink` runs synchronously once per frame, in
    /// buffer order, and borrows the frame straight out of the buffer.
    /// Returning `Break` from `sink` ends the feed at once: the refused
    /// frame is neither counted nor consumed.
    /// Incomplete trailing bytes stay buffered for the next arrival.
    pub fn feed<F>(
        &self,
        buffer: &mut RingBuffer,
        errors: &mut u32,
        io_size: usize,
        mut sink: F,
    ) -> Reassembly
    where
        F: FnMut(Frame<'_>) -> ControlFlow<()>,
    {
        let mut out = Reassembly {
            dispatched: 0,
            consumed: 0,
            remaining: 0,
            violation: None,
            verdict: Verdict::Continue,
        };

        while buffer.readable() > 0 {
            if *errors >= self.max_errors {
                out.verdict = Verdict::ErrorLimit;
                break;
            }

            if buffer.readable() <= HEADER_SIZE {
                break;
            }

            let header = match buffer.peek(HEADER_SIZE).and_then(FrameHeader::decode) {
                Some(h) => h,
                None => break,
            };

            if let Some(violation) = self.check(&header) {
                *errors = errors.saturating_add(1);
                out.violation = Some(violation);
                if *errors >= self.max_errors {
                    out.verdict = Verdict::ErrorLimit;
                }
                break;
            }

            let length = header.length as usize;
            if buffer.readable() < length {
                break;
            }

            // peek cannot fail here: readable >= length was checked above
            let Some(bytes) = buffer.peek(length) else {
                break;
            };
            let frame = Frame {
                header,
                payload: &bytes[HEADER_SIZE..],
            };
            if sink(frame).is_break() {
                out.verdict = Verdict::Stopped;
                break;
            }
            if buffer.consume(length).is_err() {
                break;
            }

            out.dispatched += 1;
            out.consumed += length;
            out.remaining += io_size.saturating_sub(length);
        }

        out
    }

    fn check(&self, header: &FrameHeader) -> Option<Violation> {
        if !header.is_valid_length() {
            return Some(Violation::Undersized {
                length: header.length,
            });
        }
        if header.length > self.max_frame_len {
            return Some(Violation::Oversized {
                length: header.length,
                max: self.max_frame_len,
            });
        }
        None
    }
}
