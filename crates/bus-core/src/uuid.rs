//! Session identifiers. v7 (time-ordered) is used for controller-originated
//! fan-out; v4 is kept for legacy compatibility. `clock_seq` is mutated
//! (not random per-session) so [`Uuid::same_node`] can match fan-out
//! siblings that share everything but their clock-seq.

use bus_timing::Nanos;
use rand::RngCore;

pub const CLOCK_SEQ_MAX: u16 = 0x3fff;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    pub fn new_v4() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0f) | 0x40; // version 4
        bytes[8] = (bytes[8] & 0x3f) | 0x80; // variant 10
        Self(bytes)
    }

    /// 48-bit ms timestamp | version=7 | 12-bit randA | variant=10 | 62-bit randB.
    pub fn new_v7() -> Self {
        Self::new_v7_at(Nanos::now())
    }

    pub fn new_v7_at(now: Nanos) -> Self {
        let millis = now.as_millis_u64();
        let mut rand_tail = [0u8; 10];
        rand::rng().fill_bytes(&mut rand_tail);

        let mut bytes = [0u8; 16];
        bytes[0..6].copy_from_slice(&millis.to_be_bytes()[2..8]);
        bytes[6] = 0x70 | (rand_tail[0] & 0x0f); // version 7, top nibble of randA
        bytes[7] = rand_tail[1];
        bytes[8] = 0x80 | (rand_tail[2] & 0x3f); // variant 10
        bytes[9..16].copy_from_slice(&rand_tail[3..10]);
        Self(bytes)
    }

    /// The 14 usable bits of the variant-10 clock-seq field (bytes 8..10).
    fn clock_seq(&self) -> u16 {
        (((self.0[8] & 0x3f) as u16) << 8) | self.0[9] as u16
    }

    fn set_clock_seq(&mut self, seq: u16) {
        let seq = seq & CLOCK_SEQ_MAX;
        self.0[8] = 0x80 | ((seq >> 8) as u8 & 0x3f);
        self.0[9] = (seq & 0xff) as u8;
    }

    /// Used for FULL_DUPLEX fan-out: each sibling gets a distinct id that
    /// still shares the same node bytes.
    pub fn bump_clock_seq(&self) -> Self {
        let mut next = *self;
        let seq = (self.clock_seq() + 1) & CLOCK_SEQ_MAX;
        next.set_clock_seq(seq);
        bus_utils::safe_assert!(next.same_node(self), "clock-seq bump mutated node bytes");
        next
    }

    /// Compares only the trailing 6 "node" bytes, ignoring the clock-seq
    /// mutation fan-out siblings carry.
    pub fn same_node(&self, other: &Self) -> bool {
        self.0[10..16] == other.0[10..16]
    }
}

impl std::fmt::Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v7_has_version_and_variant_bits() {
        let u = Uuid::new_v7();
        assert_eq!(u.0[6] & 0xf0, 0x70);
        assert_eq!(u.0[8] & 0xc0, 0x80);
    }

    #[test]
    fn clock_seq_bump_wraps_and_preserves_node() {
        let mut u = Uuid::new_v7();
        u.set_clock_seq(CLOCK_SEQ_MAX);
        let bumped = u.bump_clock_seq();
        assert_eq!(bumped.clock_seq(), 0);
        assert!(bumped.same_node(&u));
        assert_ne!(bumped, u);
    }

    #[test]
    fn same_node_ignores_clock_seq() {
        let u = Uuid::new_v7();
        let sibling = u.bump_clock_seq();
        assert!(u.same_node(&sibling));
        assert_ne!(u, sibling);
    }
}
