//! Split get/put cursor envelope buffer. Header accessors are gated on how
//! many bytes are currently buffered, mirroring the original `xmsgbuf`
//! streambuf's threshold-gated `eid()`/`len()`/`version()`/`type()`.

use crate::envelope::{HEADER_SIZE, Header};

const BUFINC: usize = 4 * 1024;

#[derive(Default)]
pub struct XmsgBuffer {
    buf: Vec<u8>,
    /// High-water mark: bytes written so far.
    put: usize,
    /// Bytes already forwarded/consumed by the caller.
    get: usize,
}

impl XmsgBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new(), put: 0, get: 0 }
    }

    pub fn put_pos(&self) -> usize {
        self.put
    }

    pub fn get_pos(&self) -> usize {
        self.get
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf[..self.put]
    }

    /// Header is only meaningful once `HEADER_SIZE` bytes are buffered.
    pub fn header(&self) -> Option<Header> {
        if self.put < HEADER_SIZE { None } else { Header::from_bytes(&self.buf[..self.put]) }
    }

    /// Whether a complete frame (header + declared payload) is buffered.
    pub fn frame_complete(&self) -> bool {
        match self.header() {
            Some(h) => self.put >= h.length as usize,
            None => false,
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        let needed = self.put + data.len();
        if needed > self.buf.len() {
            let grown = needed.div_ceil(BUFINC) * BUFINC;
            self.buf.resize(grown, 0);
        }
        self.buf[self.put..needed].copy_from_slice(data);
        self.put = needed;
    }

    /// Advance the get cursor, typically after forwarding bytes downstream.
    pub fn advance_get(&mut self, n: usize) {
        self.get = (self.get + n).min(self.put);
    }

    /// Payload slice from `max(get, HEADER_SIZE)` to the put cursor,
    /// unbounded by frame length: used while a frame is still arriving.
    pub fn unread_payload(&self) -> &[u8] {
        let start = self.get.max(HEADER_SIZE).min(self.put);
        &self.buf[start..self.put]
    }

    /// The current frame's payload, bounded by its declared `length` so
    /// trailing bytes belonging to the next frame are never included. `None`
    /// until the frame is fully buffered.
    pub fn frame_payload(&self) -> Option<&[u8]> {
        let header = self.header()?;
        let end = header.length as usize;
        if self.put < end {
            return None;
        }
        Some(&self.buf[HEADER_SIZE..end])
    }

    /// Drop the completed frame and shift any trailing bytes (the start of
    /// the next frame) down to offset 0.
    pub fn release_frame(&mut self) {
        let Some(header) = self.header() else { return };
        let frame_len = header.length as usize;
        if frame_len >= self.put {
            self.buf.clear();
            self.put = 0;
            self.get = 0;
            return;
        }
        self.buf.copy_within(frame_len..self.put, 0);
        self.put -= frame_len;
        self.get = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::MsgFlags,
        envelope::MsgOp,
        uuid::Uuid,
    };

    #[test]
    fn accessors_gated_on_buffered_len() {
        let mut x = XmsgBuffer::new();
        let h = Header::new(Uuid::new_v4(), 5, MsgOp::Data, MsgFlags::empty());
        let bytes = h.to_bytes();
        x.append(&bytes[..10]);
        assert!(x.header().is_none());
        x.append(&bytes[10..]);
        assert_eq!(x.header(), Some(h));
    }

    #[test]
    fn release_frame_keeps_trailing_bytes() {
        let mut x = XmsgBuffer::new();
        let h = Header::new(Uuid::new_v4(), 2, MsgOp::Data, MsgFlags::empty());
        x.append(&h.to_bytes());
        x.append(&[1, 2]);
        x.append(&[0xaa]); // first byte of the next frame
        assert!(x.frame_complete());
        x.release_frame();
        assert_eq!(x.put_pos(), 1);
        assert_eq!(x.buffered(), &[0xaa]);
    }
}
