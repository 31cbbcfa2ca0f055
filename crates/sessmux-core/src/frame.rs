//! Wire frame codec.
//!
//! Every frame on the wire is a fixed 8-byte header followed by the payload:
//!
//! ```text
//!  0        4        8                         length
//!  ├─length─┼──kind──┼────────payload───────────┤
//!    u32 LE   u32 LE
//! ```
//!
//! `length` is the total frame size *including* the header. There is no
//! delimiter; framing relies on `length` alone.

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length, header included.
    pub length: u32,
    /// Protocol / packet type tag. Opaque to the transport.
    pub kind: u32,
}

impl FrameHeader {
    #[inline]
    pub const fn new(length: u32, kind: u32) -> Self {
        Self { length, kind }
    }

    /// Header for a frame carrying `payload_len` bytes.
    ///
    /// Returns `None` if the total would not fit the `u32` length field.
    #[inline]
    pub fn for_payload(kind: u32, payload_len: usize) -> Option<Self> {
        let length = u32::try_from(payload_len.checked_add(HEADER_SIZE)?).ok()?;
        Some(Self { length, kind })
    }

    /// Decode from the first `HEADER_SIZE` bytes of `bytes`.
    #[inline]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let raw: &[u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
        Some(Self {
            length: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            kind: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }

    #[inline]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..].copy_from_slice(&self.kind.to_le_bytes());
        out
    }

    /// Payload size declared by this header (0 for undersized headers).
    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }

    /// A frame must carry at least one payload byte.
    #[inline]
    pub fn is_valid_length(&self) -> bool {
        self.length as usize > HEADER_SIZE
    }

    /// Protocol family of `kind`: packet types are allocated in blocks of
    /// `range`, and the family is the first type of the block.
    ///
    /// `range == 0` yields `kind` unchanged.
    #[inline]
    pub fn protocol_base(&self, range: u32) -> u32 {
        match range {
            0 => self.kind,
            r => self.kind / r * r,
        }
    }
}

/// One complete frame, borrowed from a session's receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Split a complete frame (`bytes.len() == header.length`) into header
    /// and payload.
    #[inline]
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        let header = FrameHeader::decode(bytes)?;
        if !header.is_valid_length() || bytes.len() != header.length as usize {
            return None;
        }
        Some(Self {
            header,
            payload: &bytes[HEADER_SIZE..],
        })
    }

    #[inline]
    pub fn kind(&self) -> u32 {
        self.header.kind
    }

    /// Total length on the wire.
    #[inline]
    pub fn len(&self) -> usize {
        self.header.length as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Encode a complete frame.
///
/// Returns `None` if the payload is too large for the `u32` length field.
pub fn encode_frame(kind: u32, payload: &[u8]) -> Option<Vec<u8>> {
    let header = FrameHeader::for_payload(kind, payload.len())?;
    let mut out = Vec::with_capacity(header.length as usize);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    Some(out)
}
