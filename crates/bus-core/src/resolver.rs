//! Address resolution without an async runtime: a background OS thread
//! resolves addresses and reports back over a channel, polled
//! non-blockingly once per connector tick.

use std::{net::SocketAddr, net::ToSocketAddrs, path::PathBuf, thread};

use bus_timing::Nanos;
use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

#[derive(Clone, Copy, Debug)]
pub struct Weight {
    pub count: u32,
    pub cap_min: u32,
    pub cap_max: u32,
}

impl Default for Weight {
    fn default() -> Self {
        Self { count: 1, cap_min: 1, cap_max: 1 }
    }
}

#[derive(Clone, Debug)]
pub struct AddressRecord {
    pub addr: Address,
    pub resolved_at: Nanos,
    pub ttl: Nanos,
    pub weight: Weight,
}

impl AddressRecord {
    pub fn expired(&self, now: Nanos) -> bool {
        now.elapsed_since(self.resolved_at) > self.ttl
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InterfaceId(pub u32);

struct ResolveRequest {
    interface: InterfaceId,
    uri: String,
    ttl: Nanos,
}

struct ResolveResult {
    interface: InterfaceId,
    records: Vec<AddressRecord>,
}

pub trait AddressResolver: Send {
    /// Kick off (re-)resolution of `uri` for `interface`; asynchronous,
    /// never blocks the caller.
    fn resolve(&self, interface: InterfaceId, uri: &str, ttl: Nanos);

    /// Drains whatever resolutions have completed since the last call.
    fn poll(&self) -> Vec<(InterfaceId, Vec<AddressRecord>)>;
}

/// Resolves `unix://path` directly and `tcp://host:port` via
/// `ToSocketAddrs` (which may block on DNS) on a dedicated background
/// thread, so the connector thread never stalls on a lookup.
pub struct ThreadedResolver {
    tx: Sender<ResolveRequest>,
    rx: Receiver<ResolveResult>,
    _worker: thread::JoinHandle<()>,
}

impl ThreadedResolver {
    pub fn spawn() -> Self {
        let (req_tx, req_rx) = unbounded::<ResolveRequest>();
        let (res_tx, res_rx) = unbounded::<ResolveResult>();

        let worker = thread::Builder::new()
            .name("bus-resolver".into())
            .spawn(move || {
                while let Ok(req) = req_rx.recv() {
                    let records = resolve_uri(&req.uri, req.ttl);
                    if res_tx.send(ResolveResult { interface: req.interface, records }).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn resolver thread");

        Self { tx: req_tx, rx: res_rx, _worker: worker }
    }
}

fn resolve_uri(uri: &str, ttl: Nanos) -> Vec<AddressRecord> {
    let now = Nanos::now();
    if let Some(path) = uri.strip_prefix("unix://") {
        return vec![AddressRecord {
            addr: Address::Unix(PathBuf::from(path)),
            resolved_at: now,
            ttl,
            weight: Weight::default(),
        }];
    }
    if let Some(hostport) = uri.strip_prefix("tcp://") {
        return match hostport.to_socket_addrs() {
            Ok(addrs) => addrs
                .map(|addr| AddressRecord {
                    addr: Address::Tcp(addr),
                    resolved_at: now,
                    ttl,
                    weight: Weight::default(),
                })
                .collect(),
            Err(err) => {
                warn!(%hostport, %err, "resolver: lookup failed");
                Vec::new()
            }
        };
    }
    warn!(%uri, "resolver: unrecognized address scheme");
    Vec::new()
}

impl AddressResolver for ThreadedResolver {
    fn resolve(&self, interface: InterfaceId, uri: &str, ttl: Nanos) {
        if self.tx.send(ResolveRequest { interface, uri: uri.to_string(), ttl }).is_err() {
            warn!("resolver: worker thread gone");
        }
    }

    fn poll(&self) -> Vec<(InterfaceId, Vec<AddressRecord>)> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(result) => out.push((result.interface, result.records)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_unix_path_synchronously() {
        let records = resolve_uri("unix:///tmp/bus.sock", Nanos::from_secs(30));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr, Address::Unix(PathBuf::from("/tmp/bus.sock")));
    }

    #[test]
    fn resolves_tcp_loopback() {
        let records = resolve_uri("tcp://127.0.0.1:9", Nanos::from_secs(30));
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].addr, Address::Tcp(_)));
    }

    #[test]
    fn threaded_resolver_roundtrips() {
        let resolver = ThreadedResolver::spawn();
        resolver.resolve(InterfaceId(1), "unix:///tmp/a.sock", Nanos::from_secs(5));
        let mut got = Vec::new();
        for _ in 0..100 {
            got = resolver.poll();
            if !got.is_empty() {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, InterfaceId(1));
    }
}
