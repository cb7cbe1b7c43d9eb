//! One north or south endpoint of a node: a URI, the addresses it resolves
//! to, and the set of stream handles currently serving it.

use std::collections::VecDeque;

use crate::{arena::SlotId, resolver::AddressRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Unix,
}

/// A connect that couldn't complete synchronously: waiting on either a
/// resolved address or a nonblocking connect to finish.
#[derive(Clone, Copy, Debug)]
pub struct PendingConnect {
    pub handle: SlotId,
}

pub struct Interface {
    pub uri: String,
    pub transport: Transport,
    /// Index into the connector's listener table; `Some` only for a north
    /// interface that owns a listening socket.
    pub listener: Option<usize>,
    pub streams: Vec<SlotId>,
    pub addresses: Vec<AddressRecord>,
    pub pending: VecDeque<PendingConnect>,
    next_address: usize,
    resolve_in_flight: bool,
}

impl Interface {
    pub fn new(uri: impl Into<String>, transport: Transport) -> Self {
        Self {
            uri: uri.into(),
            transport,
            listener: None,
            streams: Vec::new(),
            addresses: Vec::new(),
            pending: VecDeque::new(),
            next_address: 0,
            resolve_in_flight: false,
        }
    }

    pub fn needs_resolve(&self) -> bool {
        self.addresses.is_empty() && !self.resolve_in_flight
    }

    pub fn mark_resolve_requested(&mut self) {
        self.resolve_in_flight = true;
    }

    pub fn apply_resolved(&mut self, records: Vec<AddressRecord>) {
        self.addresses = records;
        self.resolve_in_flight = false;
    }

    /// Next address to dial when scaling out, round-robin over the address
    /// list (used when more streams than addresses already exist).
    pub fn next_address(&mut self) -> Option<&AddressRecord> {
        if self.addresses.is_empty() {
            return None;
        }
        let idx = self.next_address % self.addresses.len();
        self.next_address = self.next_address.wrapping_add(1);
        self.addresses.get(idx)
    }

    /// Drops an address whose backend just refused a connection
    /// (`ECONNREFUSED`), preserving its weight for when the resolver
    /// re-populates it.
    pub fn expire_address(&mut self, dead: &std::net::SocketAddr) {
        self.addresses.retain(|rec| match &rec.addr {
            crate::resolver::Address::Tcp(addr) => addr != dead,
            crate::resolver::Address::Unix(_) => true,
        });
    }

    pub fn remove_stream(&mut self, handle: SlotId) {
        self.streams.retain(|h| *h != handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robins_over_addresses() {
        use bus_timing::Nanos;

        use crate::resolver::{Address, Weight};

        let mut iface = Interface::new("tcp://example", Transport::Tcp);
        iface.apply_resolved(vec![
            AddressRecord {
                addr: Address::Tcp("127.0.0.1:1".parse().unwrap()),
                resolved_at: Nanos(0),
                ttl: Nanos::from_secs(30),
                weight: Weight::default(),
            },
            AddressRecord {
                addr: Address::Tcp("127.0.0.1:2".parse().unwrap()),
                resolved_at: Nanos(0),
                ttl: Nanos::from_secs(30),
                weight: Weight::default(),
            },
        ]);
        let first = iface.next_address().unwrap().addr.clone();
        let second = iface.next_address().unwrap().addr.clone();
        let third = iface.next_address().unwrap().addr.clone();
        assert_eq!(first, third);
        assert_ne!(first, second);
    }
}
