//! The 24-byte wire envelope header. Field layout and sizes are fixed by
//! the protocol and must not change: `eid`(16) `seqno`(2) `length`(2)
//! `version.no`(1) `version.flags`(1) `type.op`(1) `type.flags`(1).

use bitflags::bitflags;

use crate::uuid::Uuid;

pub const HEADER_SIZE: usize = 24;
pub const MAX_ENVELOPE: usize = u16::MAX as usize;
pub const MAX_PAYLOAD: usize = MAX_ENVELOPE - HEADER_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgOp {
    Data = 0,
    Stop = 1,
    Control = 2,
}

impl MsgOp {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Data),
            1 => Some(Self::Stop),
            2 => Some(Self::Control),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct MsgFlags: u8 {
        const INIT  = 0b0000_0001;
        const ABORT = 0b0000_0010;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub eid: Uuid,
    pub seqno: u16,
    pub length: u16,
    pub version_no: u8,
    pub version_flags: u8,
    pub op: u8,
    pub flags: u8,
}

impl Header {
    pub fn new(eid: Uuid, payload_len: usize, op: MsgOp, flags: MsgFlags) -> Self {
        Self {
            eid,
            seqno: 1,
            length: (HEADER_SIZE + payload_len) as u16,
            version_no: 0,
            version_flags: 0,
            op: op as u8,
            flags: flags.bits(),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_SIZE
    }

    pub fn msg_flags(&self) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.flags)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..16].copy_from_slice(&self.eid.0);
        out[16..18].copy_from_slice(&self.seqno.to_le_bytes());
        out[18..20].copy_from_slice(&self.length.to_le_bytes());
        out[20] = self.version_no;
        out[21] = self.version_flags;
        out[22] = self.op;
        out[23] = self.flags;
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut eid = [0u8; 16];
        eid.copy_from_slice(&buf[0..16]);
        Some(Self {
            eid: Uuid(eid),
            seqno: u16::from_le_bytes(buf[16..18].try_into().unwrap()),
            length: u16::from_le_bytes(buf[18..20].try_into().unwrap()),
            version_no: buf[20],
            version_flags: buf[21],
            op: buf[22],
            flags: buf[23],
        })
    }

    /// Build an ABORT+STOP reply for `eid`: the forced fast-close envelope.
    pub fn abort(eid: Uuid) -> Self {
        Self::new(eid, 0, MsgOp::Stop, MsgFlags::ABORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let h = Header::new(Uuid::new_v4(), 100, MsgOp::Data, MsgFlags::INIT);
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let back = Header::from_bytes(&bytes).unwrap();
        assert_eq!(h, back);
        assert_eq!(back.payload_len(), 100);
    }

    #[test]
    fn abort_is_stop_with_abort_flag() {
        let h = Header::abort(Uuid::new_v4());
        assert_eq!(h.op, MsgOp::Stop as u8);
        assert!(h.msg_flags().contains(MsgFlags::ABORT));
        assert_eq!(h.payload_len(), 0);
    }

    #[test]
    fn max_payload_fits_in_u16_length() {
        let h = Header::new(Uuid::new_v4(), MAX_PAYLOAD, MsgOp::Data, MsgFlags::empty());
        assert_eq!(h.length, u16::MAX);
    }
}
