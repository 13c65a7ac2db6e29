//! Wire format of the IPC fabric.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Every frame is a fixed header followed by an opaque payload. The header
//! is little-endian:
//!
//! ```text
//! code: u16 | size: u32 | src: u32 | dst: u32 | seq: u64
//! ```
//!
//! `size` covers header and payload. `seq` is non-zero for request/response
//! exchanges and zero for one-way messages. Payload layout is the business
//! of the handler registered for `code`, except for [`code::RESP`] whose
//! payload is a little-endian `i32` return value.

use crate::config::MAX_FRAME_SIZE;
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes in the fixed frame header.
pub const HEADER_LEN: usize = 22;

/// Message codes routed by the fabric.
///
/// `RESP` is handled internally; the rest are routed to handlers that
/// upper layers register. Codes at or above [`NUM_CODES`] are rejected.
pub mod code {
    /// Response to an earlier request; payload carries the return value.
    pub const RESP: u16 = 0;
    /// Resolve a resource identifier to the URI of its owner.
    pub const FINDURI: u16 = 1;
    /// Announce the URI owning a resource identifier.
    pub const TELLURI: u16 = 2;
    /// A child process exited; payload carries its exit status.
    pub const CHILD_EXIT: u16 = 3;

    /// Size of the callback table; one slot per possible code.
    pub const NUM_CODES: usize = 8;
}

/// Parsed fixed header of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message code; indexes the callback table.
    pub code: u16,
    /// Total frame length, header included.
    pub size: u32,
    /// Peer id of the sender.
    pub src: u32,
    /// Peer id of the intended receiver.
    pub dst: u32,
    /// Correlation sequence number; zero for one-way messages.
    pub seq: u64,
}

impl Header {
    /// Parse a header from the front of `buf`.
    ///
    /// # Errors
    /// [`Error::Again`] if fewer than [`HEADER_LEN`] bytes are available;
    /// [`Error::InvalidArgument`] if the announced size is impossible.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Again);
        }
        let mut cursor = buf;
        let header = Self {
            code: cursor.get_u16_le(),
            size: cursor.get_u32_le(),
            src: cursor.get_u32_le(),
            dst: cursor.get_u32_le(),
            seq: cursor.get_u64_le(),
        };
        if header.size < HEADER_LEN as u32 || header.size > MAX_FRAME_SIZE {
            return Err(Error::InvalidArgument);
        }
        Ok(header)
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.code);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.src);
        buf.put_u32_le(self.dst);
        buf.put_u64_le(self.seq);
    }

    /// Payload length announced by this header.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.size as usize - HEADER_LEN
    }
}

/// A complete IPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message code; indexes the callback table.
    pub code: u16,
    /// Peer id of the sender.
    pub src: u32,
    /// Peer id of the intended receiver.
    pub dst: u32,
    /// Correlation sequence number; zero for one-way messages.
    pub seq: u64,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Message {
    /// A one-way message. Request senders overwrite `seq` at send time.
    #[must_use]
    pub fn new(code: u16, src: u32, dst: u32, payload: Bytes) -> Self {
        Self {
            code,
            src,
            dst,
            seq: 0,
            payload,
        }
    }

    /// A response frame answering the request that carried `seq`.
    #[must_use]
    pub fn response(src: u32, dst: u32, seq: u64, retval: i32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_i32_le(retval);
        Self {
            code: code::RESP,
            src,
            dst,
            seq,
            payload: payload.freeze(),
        }
    }

    /// The return value carried by a [`code::RESP`] payload.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if the payload is too short.
    pub fn retval(&self) -> Result<i32> {
        if self.payload.len() < 4 {
            return Err(Error::InvalidArgument);
        }
        let mut cursor = &self.payload[..];
        Ok(cursor.get_i32_le())
    }

    /// Total on-wire size of this message.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialize into a single contiguous frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let size = self.frame_len();
        let mut buf = BytesMut::with_capacity(size);
        Header {
            code: self.code,
            size: size as u32,
            src: self.src,
            dst: self.dst,
            seq: self.seq,
        }
        .put(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Reassemble a message from a parsed header and the full frame bytes.
    pub(crate) fn from_frame(header: &Header, mut frame: Bytes) -> Self {
        let payload = frame.split_off(HEADER_LEN);
        Self {
            code: header.code,
            src: header.src,
            dst: header.dst,
            seq: header.seq,
            payload,
        }
    }
}

impl TryFrom<Bytes> for Message {
    type Error = Error;

    fn try_from(frame: Bytes) -> Result<Self> {
        let header = Header::parse(&frame)?;
        if frame.len() != header.size as usize {
            return Err(Error::InvalidArgument);
        }
        Ok(Self::from_frame(&header, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let msg = Message {
            code: code::FINDURI,
            src: 7,
            dst: 9,
            seq: 0x1234,
            payload: Bytes::from_static(b"resource"),
        };
        let wire = msg.encode();
        assert_eq!(wire.len(), HEADER_LEN + 8);
        let back = Message::try_from(wire).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn short_header_wants_more() {
        assert!(matches!(Header::parse(&[0u8; 4]), Err(Error::Again)));
    }

    #[test]
    fn impossible_sizes_rejected() {
        let mut wire = BytesMut::new();
        Header {
            code: code::FINDURI,
            size: 3,
            src: 1,
            dst: 2,
            seq: 0,
        }
        .put(&mut wire);
        assert!(matches!(
            Header::parse(&wire),
            Err(Error::InvalidArgument)
        ));

        let mut wire = BytesMut::new();
        Header {
            code: code::FINDURI,
            size: MAX_FRAME_SIZE + 1,
            src: 1,
            dst: 2,
            seq: 0,
        }
        .put(&mut wire);
        assert!(matches!(
            Header::parse(&wire),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn response_retval() {
        let msg = Message::response(3, 5, 0xABCD, -2);
        assert_eq!(msg.code, code::RESP);
        assert_eq!(msg.seq, 0xABCD);
        assert_eq!(msg.retval().unwrap(), -2);

        let empty = Message::new(code::RESP, 3, 5, Bytes::new());
        assert!(matches!(empty.retval(), Err(Error::InvalidArgument)));
    }

    #[test]
    fn truncated_frame_rejected() {
        let wire = Message::response(3, 5, 1, 0).encode();
        let cut = wire.slice(..wire.len() - 1);
        assert!(Message::try_from(cut).is_err());
    }
}
