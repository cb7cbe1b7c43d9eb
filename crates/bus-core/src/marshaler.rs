//! Per-role framing direction. Replaces the C++ `basic_connector<Marshaler,
//! Handler>` template with a trait implemented by three zero-sized marker
//! types; `Connector<M: Marshaler>` dispatches on `M::NORTH_FRAMED` /
//! `M::SOUTH_FRAMED` instead of specializing a template per role.

/// Whether a node role frames envelopes on its north and south sides.
pub trait Marshaler {
    const NORTH_FRAMED: bool;
    const SOUTH_FRAMED: bool;
    const NAME: &'static str;
}

/// North side raw, south side framed: assigns sessions and frames outbound.
pub struct Controller;
impl Marshaler for Controller {
    const NORTH_FRAMED: bool = false;
    const SOUTH_FRAMED: bool = true;
    const NAME: &'static str = "controller";
}

/// North side framed, south side raw: de-frames and proxies to a bare backend.
pub struct Segment;
impl Marshaler for Segment {
    const NORTH_FRAMED: bool = true;
    const SOUTH_FRAMED: bool = false;
    const NAME: &'static str = "segment";
}

/// Both sides framed: forwards envelopes byte-exact between two framed peers.
pub struct Proxy;
impl Marshaler for Proxy {
    const NORTH_FRAMED: bool = true;
    const SOUTH_FRAMED: bool = true;
    const NAME: &'static str = "proxy";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_frame_exactly_one_inverted_side() {
        assert!(!Controller::NORTH_FRAMED && Controller::SOUTH_FRAMED);
        assert!(Segment::NORTH_FRAMED && !Segment::SOUTH_FRAMED);
        assert!(Proxy::NORTH_FRAMED && Proxy::SOUTH_FRAMED);
    }
}
