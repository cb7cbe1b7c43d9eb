//! The state machine: one node, one OS thread. Consumes poll events,
//! dispatches to per-direction handlers, drives the connection table, and
//! originates new south connections.

use std::{io, marker::PhantomData, net::SocketAddr, os::fd::AsRawFd, time::Duration};

use bus_timing::{Nanos, Repeater};
use mio::{Token, net::TcpStream as MioTcpStream, net::UnixStream as MioUnixStream};
use tracing::debug;

use crate::{
    arena::{Arena, SlotId},
    envelope::{Header, MAX_PAYLOAD, MsgFlags, MsgOp},
    error::HandlerOutcome,
    interface::{Interface, Transport},
    marshaler::Marshaler,
    metrics::MetricsRegistry,
    net::{ByteSink, ConnState, RawListener, RawSocket, StreamBuffer, set_socket_buf_size},
    resolver::{Address, AddressResolver, InterfaceId},
    table::{ConnectionTable, Session, SessionState},
    timer::TimerQueue,
    trigger::TriggerSet,
    uuid::Uuid,
    xmsg::XmsgBuffer,
};

/// How often the address sweep (`Connector::address_sweep`) retires expired
/// resolver records so a stale backend gets re-resolved instead of stuck.
const ADDRESS_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub const BUFSIZE_CEILING: usize = 256 * 1024 * 1024;

const NORTH_TAG: usize = 0;
const SOUTH_TAG: usize = 1;
const LISTENER_TAG: usize = 2;

fn encode_token(tag: usize, index: u32) -> Token {
    Token(((index as usize) << 2) | tag)
}

fn decode_token(token: Token) -> (usize, u32) {
    (token.0 & 0b11, (token.0 >> 2) as u32)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplexMode {
    Half,
    Full,
}

/// Inbound staging: raw bytes for an unframed side, an envelope buffer for a
/// framed side.
pub enum Ingress {
    Raw(Vec<u8>),
    Framed(XmsgBuffer),
}

impl ByteSink for Ingress {
    fn extend(&mut self, bytes: &[u8]) {
        match self {
            Self::Raw(v) => v.extend_from_slice(bytes),
            Self::Framed(x) => x.append(bytes),
        }
    }
}

pub struct Peer {
    pub stream: StreamBuffer,
    pub ingress: Ingress,
    pub iface: usize,
    /// Which ingress peer this one most recently suppressed via
    /// backpressure, so the pollout "read-restart" cross-link knows what to
    /// re-arm once this peer's egress drains.
    pub suppressed_ingress: Option<(usize, SlotId)>,
}

impl Peer {
    fn new(stream: StreamBuffer, framed: bool, iface: usize) -> Self {
        let ingress = if framed { Ingress::Framed(XmsgBuffer::new()) } else { Ingress::Raw(Vec::new()) };
        Self { stream, ingress, iface, suppressed_ingress: None }
    }
}

struct ListenerEntry {
    listener: RawListener,
    iface: usize,
}

pub struct Connector<M: Marshaler> {
    pub mode: DuplexMode,
    north_ifaces: Vec<Interface>,
    south_ifaces: Vec<Interface>,
    north: Arena<Peer>,
    south: Arena<Peer>,
    listeners: Vec<ListenerEntry>,
    table: ConnectionTable,
    triggers: TriggerSet,
    timers: TimerQueue,
    resolver: Box<dyn AddressResolver>,
    metrics: &'static MetricsRegistry,
    address_sweep: Repeater,
    draining: bool,
    _marshaler: PhantomData<M>,
}

impl<M: Marshaler> Connector<M> {
    pub fn new(
        mode: DuplexMode,
        north_ifaces: Vec<Interface>,
        south_ifaces: Vec<Interface>,
        resolver: Box<dyn AddressResolver>,
    ) -> io::Result<Self> {
        Ok(Self {
            mode,
            north_ifaces,
            south_ifaces,
            north: Arena::new(),
            south: Arena::new(),
            listeners: Vec::new(),
            table: ConnectionTable::new(),
            triggers: TriggerSet::new(1024)?,
            timers: TimerQueue::new(),
            resolver,
            metrics: MetricsRegistry::global(),
            address_sweep: Repeater::every(ADDRESS_SWEEP_INTERVAL.into()),
            draining: false,
            _marshaler: PhantomData,
        })
    }

    /// Binds and registers a listener for north interface `iface_id`.
    pub fn listen(&mut self, iface_id: usize, listener: RawListener) -> io::Result<()> {
        let idx = self.listeners.len();
        self.listeners.push(ListenerEntry { listener, iface: iface_id });
        self.listeners[idx].listener.register(self.triggers.registry(), encode_token(LISTENER_TAG, idx as u32))?;
        self.north_ifaces[iface_id].listener = Some(idx);
        Ok(())
    }

    pub fn drain(&mut self) {
        self.draining = true;
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn is_idle(&self) -> bool {
        self.table.is_empty()
    }

    /// One iteration: poll, dispatch ready events, fire expired timers.
    pub fn tick(&mut self) -> io::Result<()> {
        let timeout = self.timers.next_deadline().map(|deadline| {
            let now = Nanos::now();
            if deadline > now { Duration::from_nanos((deadline - now).0) } else { Duration::ZERO }
        });
        let ready: Vec<(Token, bool, bool, bool)> = {
            let events = self.triggers.wait(timeout)?;
            events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable(), e.is_error())).collect()
        };

        for (token, readable, writable, errored) in ready {
            let (tag, idx) = decode_token(token);
            match tag {
                LISTENER_TAG => self.accept_loop(idx as usize),
                _ if errored => self.handle_err(tag, idx),
                _ => {
                    if readable {
                        self.handle_readable(tag, idx);
                    }
                    if writable {
                        self.handle_writable(tag, idx);
                    }
                }
            }
        }

        self.poll_resolver();
        self.sweep_expired_addresses();

        let now = Nanos::now();
        let _ = self.timers.expired(now);
        self.table.maybe_compact();
        Ok(())
    }

    /// Periodically retires resolver records past their TTL so a dead
    /// backend is re-resolved instead of kept around forever; emptying an
    /// interface's address list makes `Interface::needs_resolve` true again.
    fn sweep_expired_addresses(&mut self) {
        if !self.address_sweep.fired() {
            return;
        }
        let now = Nanos::now();
        for iface in &mut self.south_ifaces {
            iface.addresses.retain(|record| !record.expired(now));
        }
    }

    /// Applies one state transition and, if it closed the session, removes
    /// it from the table and notifies the metrics registry — the single
    /// place every route/abort path must funnel through so a session can
    /// never linger past CLOSED.
    fn apply_transition(&mut self, idx: usize, op: MsgOp, flags: MsgFlags, now: Nanos) {
        let Some(session) = self.table.get_mut(idx) else { return };
        session.apply(op, flags, now);
        if session.is_closed() {
            let south = session.south;
            let arrival = session.timestamps[SessionState::HalfOpen as usize];
            self.table.tombstone(idx);
            if let Some(south) = south {
                self.metrics.record_completion(south, arrival, now);
            }
        }
    }

    fn poll_resolver(&mut self) {
        for iface_id in 0..self.south_ifaces.len() {
            if self.south_ifaces[iface_id].needs_resolve() {
                self.south_ifaces[iface_id].mark_resolve_requested();
                self.resolver.resolve(
                    InterfaceId(iface_id as u32),
                    &self.south_ifaces[iface_id].uri,
                    Nanos::from_secs(30),
                );
            }
        }
        for (iface_id, records) in self.resolver.poll() {
            if let Some(iface) = self.south_ifaces.get_mut(iface_id.0 as usize) {
                iface.apply_resolved(records);
            }
        }
    }

    fn accept_loop(&mut self, listener_idx: usize) {
        if self.draining {
            return;
        }
        let iface_id = self.listeners[listener_idx].iface;
        loop {
            let accepted = match self.listeners[listener_idx].listener.accept_one() {
                Ok(Some(sock)) => sock,
                Ok(None) => break,
                Err(err) => {
                    debug!(?err, "connector: accept");
                    break;
                }
            };
            let peer = Peer::new(StreamBuffer::new(accepted, Token(0)), M::NORTH_FRAMED, iface_id);
            let slot = self.north.insert(peer);
            let token = encode_token(NORTH_TAG, slot.index);
            if let Some(peer) = self.north.get_mut(slot) {
                peer.stream.set_token(token);
                if peer.stream.register(self.triggers.registry()).is_err() {
                    self.north.remove(slot);
                    continue;
                }
            }
            self.north_ifaces[iface_id].streams.push(slot);
        }
    }

    fn generation_for(&self, tag: usize, idx: u32) -> Option<u32> {
        if tag == NORTH_TAG { self.north.generation_of(idx) } else { self.south.generation_of(idx) }
    }

    fn handle_err(&mut self, tag: usize, idx: u32) {
        let Some(gen_value) = self.generation_for(tag, idx) else { return };
        let slot = SlotId { index: idx, generation: gen_value };
        debug!(tag, idx, "connector: err handler");
        self.write_abort_to_peers(tag, slot);
        self.remove_peer(tag, slot);
    }

    fn write_abort_to_peers(&mut self, tag: usize, slot: SlotId) {
        let sessions: Vec<usize> = self
            .table
            .indexed()
            .filter(|(_, s)| if tag == NORTH_TAG { s.north == Some(slot) } else { s.south == Some(slot) })
            .map(|(i, _)| i)
            .collect();
        for idx in sessions {
            let Some(session) = self.table.get(idx).cloned() else { continue };
            let other_tag = 1 - tag;
            let other_slot = if tag == NORTH_TAG { session.south } else { session.north };
            if let Some(other) = other_slot {
                self.send_abort(other_tag, other, session.uuid);
            }
            self.apply_transition(idx, MsgOp::Stop, MsgFlags::ABORT, Nanos::now());
        }
    }

    fn send_abort(&mut self, tag: usize, slot: SlotId, uuid: Uuid) {
        let header = Header::abort(uuid);
        let arena = if tag == NORTH_TAG { &mut self.north } else { &mut self.south };
        if let Some(peer) = arena.get_mut(slot) {
            peer.stream.write(self.triggers.registry(), &header.to_bytes());
        }
    }

    fn remove_peer(&mut self, tag: usize, slot: SlotId) {
        let arena = if tag == NORTH_TAG { &mut self.north } else { &mut self.south };
        if let Some(mut peer) = arena.remove(slot) {
            peer.stream.close(self.triggers.registry());
            let ifaces = if tag == NORTH_TAG { &mut self.north_ifaces } else { &mut self.south_ifaces };
            if let Some(iface) = ifaces.get_mut(peer.iface) {
                iface.remove_stream(slot);
            }
        }
    }

    fn handle_readable(&mut self, tag: usize, idx: u32) {
        let Some(gen_value) = self.generation_for(tag, idx) else { return };
        let slot = SlotId { index: idx, generation: gen_value };
        let state = {
            let arena = if tag == NORTH_TAG { &mut self.north } else { &mut self.south };
            let Some(peer) = arena.get_mut(slot) else { return };
            peer.stream.read_into(&mut peer.ingress)
        };
        if state == ConnState::Disconnected {
            self.handle_err(tag, idx);
            return;
        }
        let outcome = if tag == NORTH_TAG { self.route_north(slot) } else { self.route_south(slot) };
        if outcome == HandlerOutcome::Disconnected {
            self.handle_err(tag, idx);
        }
    }

    fn handle_writable(&mut self, tag: usize, idx: u32) {
        let Some(gen_value) = self.generation_for(tag, idx) else { return };
        let slot = SlotId { index: idx, generation: gen_value };
        let (state, drained, suppressed) = {
            let arena = if tag == NORTH_TAG { &mut self.north } else { &mut self.south };
            let Some(peer) = arena.get_mut(slot) else { return };
            let state = peer.stream.flush(self.triggers.registry());
            (state, peer.stream.out_len() == 0, peer.suppressed_ingress.take())
        };
        if state == ConnState::Disconnected {
            self.handle_err(tag, idx);
            return;
        }
        if drained {
            if let Some((ingress_tag, ingress_slot)) = suppressed {
                let arena = if ingress_tag == NORTH_TAG { &mut self.north } else { &mut self.south };
                if let Some(ingress_peer) = arena.get_mut(ingress_slot) {
                    let _ = ingress_peer.stream.resume_readable(self.triggers.registry());
                }
            }
        }
    }

    /// North→south. Dispatches on `M::NORTH_FRAMED`: the controller's raw
    /// north side is keyed by fd alone, segment/proxy's framed north side
    /// is keyed by fd+eid so unrelated sessions sharing one north
    /// connection never cross-talk.
    fn route_north(&mut self, nsp: SlotId) -> HandlerOutcome {
        if M::NORTH_FRAMED { self.route_north_framed(nsp) } else { self.route_north_raw(nsp) }
    }

    /// Controller only: raw bytes in, one envelope out per live session on
    /// this north fd (south is always framed in this role combination).
    fn route_north_raw(&mut self, nsp: SlotId) -> HandlerOutcome {
        let Some(peer) = self.north.get(nsp) else { return HandlerOutcome::Disconnected };
        let eof = peer.stream.eof();
        let Ingress::Raw(buf) = &peer.ingress else { return HandlerOutcome::Ok };
        let payload = buf.clone();
        if payload.is_empty() && !eof {
            return HandlerOutcome::Ok;
        }

        let sessions: Vec<usize> = self
            .table
            .indexed()
            .filter(|(_, s)| s.north == Some(nsp) && !s.is_closed())
            .map(|(i, _)| i)
            .collect();

        if sessions.is_empty() && !eof {
            self.north_connect(nsp, Uuid::new_v7(), &payload, MsgFlags::INIT);
            self.clear_north_raw(nsp);
            return HandlerOutcome::Ok;
        }

        let op = if eof { MsgOp::Stop } else { MsgOp::Data };
        for idx in sessions {
            let Some(session) = self.table.get(idx).cloned() else { continue };
            let Some(ssp) = session.south else { continue };
            let budget = BUFSIZE_CEILING.saturating_sub(payload.len() + 24);
            if let Some(south_peer) = self.south.get_mut(ssp) {
                if south_peer.stream.out_len() > budget {
                    south_peer.stream.flush(self.triggers.registry());
                }
            }
            let still_over = self.south.get(ssp).map(|p| p.stream.out_len() > budget).unwrap_or(true);
            if still_over {
                if let Some(north_peer) = self.north.get_mut(nsp) {
                    let _ = north_peer.stream.clear_readable(self.triggers.registry());
                }
                if let Some(south_peer) = self.south.get_mut(ssp) {
                    south_peer.suppressed_ingress = Some((NORTH_TAG, nsp));
                }
                return HandlerOutcome::Ok;
            }
            let header = Header::new(session.uuid, payload.len(), op, MsgFlags::empty());
            if let Some(south_peer) = self.south.get_mut(ssp) {
                south_peer.stream.write_framed(self.triggers.registry(), &header.to_bytes(), &payload);
            }
            self.apply_transition(idx, op, MsgFlags::empty(), Nanos::now());
        }

        self.clear_north_raw(nsp);
        HandlerOutcome::Ok
    }

    /// Segment/proxy: one envelope at a time from the framed north side,
    /// matched to a session by uuid+north (never by fd alone, since one
    /// north connection multiplexes many sessions).
    fn route_north_framed(&mut self, nsp: SlotId) -> HandlerOutcome {
        loop {
            let Some(peer) = self.north.get(nsp) else { return HandlerOutcome::Disconnected };
            let Ingress::Framed(xmsg) = &peer.ingress else { return HandlerOutcome::Ok };
            if xmsg.header().is_none() || !xmsg.frame_complete() {
                return HandlerOutcome::Ok;
            }
            let header = xmsg.header().unwrap();
            let op = MsgOp::from_u8(header.op).unwrap_or(MsgOp::Data);
            let flags = header.msg_flags();
            let payload = xmsg.frame_payload().unwrap_or(&[]).to_vec();

            let found = self
                .table
                .indexed()
                .find(|(_, s)| s.north == Some(nsp) && s.uuid.same_node(&header.eid))
                .map(|(i, _)| i);

            let idx = match found {
                Some(idx) => idx,
                None => {
                    if !flags.contains(MsgFlags::ABORT) && !(op == MsgOp::Stop && payload.is_empty()) {
                        self.north_connect(nsp, header.eid, &payload, flags);
                    }
                    self.release_north_frame(nsp);
                    continue;
                }
            };

            let session = self.table.get(idx).cloned().unwrap();
            if let Some(south) = session.south {
                let budget = BUFSIZE_CEILING.saturating_sub(payload.len() + 24);
                if let Some(south_peer) = self.south.get_mut(south) {
                    if south_peer.stream.out_len() > budget {
                        south_peer.stream.flush(self.triggers.registry());
                    }
                }
                let still_over = self.south.get(south).map(|p| p.stream.out_len() > budget).unwrap_or(true);
                if still_over {
                    if let Some(north_peer) = self.north.get_mut(nsp) {
                        let _ = north_peer.stream.clear_readable(self.triggers.registry());
                    }
                    if let Some(south_peer) = self.south.get_mut(south) {
                        south_peer.suppressed_ingress = Some((NORTH_TAG, nsp));
                    }
                    return HandlerOutcome::Ok;
                }
                if M::SOUTH_FRAMED {
                    let out_header = Header::new(session.uuid, payload.len(), op, flags);
                    if let Some(south_peer) = self.south.get_mut(south) {
                        south_peer.stream.write_framed(self.triggers.registry(), &out_header.to_bytes(), &payload);
                    }
                } else {
                    if let Some(south_peer) = self.south.get_mut(south) {
                        south_peer.stream.write(self.triggers.registry(), &payload);
                    }
                    if op == MsgOp::Stop {
                        if let Some(south_peer) = self.south.get_mut(south) {
                            south_peer.stream.shutdown_write();
                        }
                    }
                }
            }

            self.apply_transition(idx, op, flags, Nanos::now());
            self.release_north_frame(nsp);
        }
    }

    fn clear_north_raw(&mut self, nsp: SlotId) {
        if let Some(peer) = self.north.get_mut(nsp) {
            if let Ingress::Raw(v) = &mut peer.ingress {
                v.clear();
            }
        }
    }

    fn release_north_frame(&mut self, nsp: SlotId) {
        if let Some(peer) = self.north.get_mut(nsp) {
            if let Ingress::Framed(x) = &mut peer.ingress {
                x.release_frame();
            }
        }
    }

    /// South→north. Dispatches on `M::SOUTH_FRAMED`: controller/proxy read
    /// envelopes off a framed south stream, segment reads raw bytes off a
    /// bare backend and wraps them before forwarding north.
    fn route_south(&mut self, ssp: SlotId) -> HandlerOutcome {
        if M::SOUTH_FRAMED { self.route_south_framed(ssp) } else { self.route_south_raw(ssp) }
    }

    /// Controller/proxy: south→north, one envelope at a time.
    fn route_south_framed(&mut self, ssp: SlotId) -> HandlerOutcome {
        loop {
            let Some(peer) = self.south.get(ssp) else { return HandlerOutcome::Disconnected };
            let Ingress::Framed(xmsg) = &peer.ingress else { return HandlerOutcome::Ok };
            if xmsg.header().is_none() || !xmsg.frame_complete() {
                return HandlerOutcome::Ok;
            }
            let header = xmsg.header().unwrap();
            let op = MsgOp::from_u8(header.op).unwrap_or(MsgOp::Data);
            let flags = header.msg_flags();
            let payload = xmsg.frame_payload().unwrap_or(&[]).to_vec();

            let found =
                self.table.indexed().find(|(_, s)| s.south == Some(ssp) && s.uuid.same_node(&header.eid)).map(|(i, _)| i);
            let Some(idx) = found else {
                if !flags.contains(MsgFlags::ABORT) && !peer.stream.eof() {
                    self.send_abort(SOUTH_TAG, ssp, header.eid);
                }
                self.release_south_frame(ssp);
                continue;
            };

            let session = self.table.get(idx).cloned().unwrap();
            let was_half_open = session.state == SessionState::HalfOpen;
            if let Some(north) = session.north {
                let half_closed_blocks = session.state == SessionState::HalfClosed
                    && !self.north.get(north).map(|p| p.stream.eof()).unwrap_or(true)
                    && !flags.contains(MsgFlags::ABORT);
                if !half_closed_blocks {
                    if let Some(north_peer) = self.north.get_mut(north) {
                        north_peer.stream.write(self.triggers.registry(), &payload);
                    }
                }
            }

            self.apply_transition(idx, op, flags, Nanos::now());

            if self.mode == DuplexMode::Half && was_half_open && !payload.is_empty() {
                self.abort_losers(session.uuid, ssp);
            }

            self.release_south_frame(ssp);
        }
    }

    /// Segment only: raw bytes off the bare backend, wrapped into one or
    /// more envelopes (chunked to `MAX_PAYLOAD`) and sent north on the
    /// session bound to this south fd. A raw south connection is 1:1 with
    /// its session (no framing to multiplex on), so the lookup is by fd
    /// alone.
    fn route_south_raw(&mut self, ssp: SlotId) -> HandlerOutcome {
        let Some(peer) = self.south.get(ssp) else { return HandlerOutcome::Disconnected };
        let eof = peer.stream.eof();
        let Ingress::Raw(buf) = &peer.ingress else { return HandlerOutcome::Ok };
        let payload = buf.clone();
        if payload.is_empty() && !eof {
            return HandlerOutcome::Ok;
        }

        let found = self.table.indexed().find(|(_, s)| s.south == Some(ssp)).map(|(i, _)| i);
        let Some(idx) = found else {
            self.clear_south_raw(ssp);
            return HandlerOutcome::Ok;
        };

        let session = self.table.get(idx).cloned().unwrap();
        let op = if eof { MsgOp::Stop } else { MsgOp::Data };

        if let Some(north) = session.north {
            if payload.is_empty() {
                let header = Header::new(session.uuid, 0, op, MsgFlags::empty());
                if let Some(north_peer) = self.north.get_mut(north) {
                    north_peer.stream.write_framed(self.triggers.registry(), &header.to_bytes(), &[]);
                }
            } else {
                let chunks: Vec<&[u8]> = payload.chunks(MAX_PAYLOAD).collect();
                let last = chunks.len() - 1;
                for (i, chunk) in chunks.iter().enumerate() {
                    let chunk_op = if i == last { op } else { MsgOp::Data };
                    let header = Header::new(session.uuid, chunk.len(), chunk_op, MsgFlags::empty());
                    if let Some(north_peer) = self.north.get_mut(north) {
                        north_peer.stream.write_framed(self.triggers.registry(), &header.to_bytes(), chunk);
                    }
                }
            }
        }

        self.apply_transition(idx, op, MsgFlags::empty(), Nanos::now());
        self.clear_south_raw(ssp);
        HandlerOutcome::Ok
    }

    fn clear_south_raw(&mut self, ssp: SlotId) {
        if let Some(peer) = self.south.get_mut(ssp) {
            if let Ingress::Raw(v) = &mut peer.ingress {
                v.clear();
            }
        }
    }

    fn release_south_frame(&mut self, ssp: SlotId) {
        if let Some(peer) = self.south.get_mut(ssp) {
            if let Ingress::Framed(x) = &mut peer.ingress {
                x.release_frame();
            }
        }
    }

    /// Picks a winner among half-duplex fan-out siblings: every other
    /// session sharing the uuid gets aborted straight to CLOSED.
    fn abort_losers(&mut self, uuid: Uuid, winner_south: SlotId) {
        let losers: Vec<usize> = self
            .table
            .indexed()
            .filter(|(_, s)| s.uuid.same_node(&uuid) && s.south != Some(winner_south) && !s.is_closed())
            .map(|(i, _)| i)
            .collect();
        for idx in losers {
            let Some(session) = self.table.get(idx).cloned() else { continue };
            if let Some(south) = session.south {
                self.send_abort(SOUTH_TAG, south, session.uuid);
            }
            self.apply_transition(idx, MsgOp::Stop, MsgFlags::ABORT, Nanos::now());
        }
    }

    /// Originates sessions for a north arrival with no live session yet,
    /// fanning out across every configured south interface. `seed_uuid` is
    /// a fresh v7 id for a raw (unframed) north arrival, or the incoming
    /// envelope's own `eid` when the north side is framed, so the very
    /// first packet of a segment/proxy session keeps its real correlation
    /// id instead of being assigned an unrelated one.
    fn north_connect(&mut self, nsp: SlotId, seed_uuid: Uuid, payload: &[u8], init_flags: MsgFlags) -> bool {
        let mut uuid = seed_uuid;
        self.metrics.record_arrival(nsp, Nanos::now());
        let mut created = false;

        for iface_id in 0..self.south_ifaces.len() {
            let Some(ssp) = self.select_stream(iface_id) else { continue };
            if self.mode == DuplexMode::Full {
                uuid = uuid.bump_clock_seq();
            }
            let now = Nanos::now();
            self.table.insert(Session::new(uuid, Some(nsp), Some(ssp), now));
            created = true;

            if M::SOUTH_FRAMED {
                let header = Header::new(uuid, payload.len(), MsgOp::Data, init_flags);
                if let Some(south_peer) = self.south.get_mut(ssp) {
                    south_peer.stream.write_framed(self.triggers.registry(), &header.to_bytes(), payload);
                }
            } else if let Some(south_peer) = self.south.get_mut(ssp) {
                south_peer.stream.write(self.triggers.registry(), payload);
            }
        }
        self.table.maybe_compact();
        created
    }

    /// Load-aware south stream selection: warm-start streams win
    /// immediately; otherwise prefer the oldest arrival unless every stream
    /// is loaded and there's address headroom to scale out.
    fn select_stream(&mut self, iface_id: usize) -> Option<SlotId> {
        let streams = self.south_ifaces.get(iface_id)?.streams.clone();
        if streams.is_empty() {
            return self.scale_out(iface_id);
        }

        let mut all_loaded = true;
        let mut oldest: Option<(SlotId, Nanos)> = None;
        for slot in &streams {
            match self.metrics.record_for(*slot) {
                None => return Some(*slot),
                Some(load) => {
                    if !load.is_loaded() {
                        all_loaded = false;
                    }
                    if oldest.is_none_or(|(_, t)| load.last_arrival < t) {
                        oldest = Some((*slot, load.last_arrival));
                    }
                }
            }
        }

        let num_addresses = self.south_ifaces[iface_id].addresses.len();
        if all_loaded && streams.len() < num_addresses {
            if let Some(slot) = self.scale_out(iface_id) {
                return Some(slot);
            }
        }
        oldest.map(|(slot, _)| slot)
    }

    fn scale_out(&mut self, iface_id: usize) -> Option<SlotId> {
        let iface = self.south_ifaces.get_mut(iface_id)?;
        let record = iface.next_address()?.clone();
        let transport = iface.transport;
        let sock = match (&record.addr, transport) {
            (Address::Tcp(addr), Transport::Tcp) => connect_tcp(*addr).ok()?,
            (Address::Unix(path), Transport::Unix) => connect_unix(path).ok()?,
            _ => return None,
        };
        let slot = self.south.insert(Peer::new(sock, M::SOUTH_FRAMED, iface_id));
        let token = encode_token(SOUTH_TAG, slot.index);
        if let Some(peer) = self.south.get_mut(slot) {
            peer.stream.set_token(token);
            if peer.stream.register(self.triggers.registry()).is_err() {
                self.south.remove(slot);
                return None;
            }
        }
        self.south_ifaces[iface_id].streams.push(slot);
        Some(slot)
    }

    /// Drops an address that just refused a south connection, preserving
    /// its weight for when the resolver re-populates it.
    pub fn expire_south_address(&mut self, iface_id: usize, addr: &SocketAddr) {
        if let Some(iface) = self.south_ifaces.get_mut(iface_id) {
            iface.expire_address(addr);
        }
    }
}

fn connect_tcp(addr: SocketAddr) -> io::Result<StreamBuffer> {
    let sock = MioTcpStream::connect(addr)?;
    sock.set_nodelay(true)?;
    set_socket_buf_size(sock.as_raw_fd(), BUFSIZE_CEILING.min(1 << 20));
    Ok(StreamBuffer::new(RawSocket::Tcp(sock), Token(0)))
}

fn connect_unix(path: &std::path::Path) -> io::Result<StreamBuffer> {
    let sock = MioUnixStream::connect(path)?;
    Ok(StreamBuffer::new(RawSocket::Unix(sock), Token(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{marshaler::Controller, resolver::ThreadedResolver};

    #[test]
    fn token_roundtrips_tag_and_index() {
        for tag in [NORTH_TAG, SOUTH_TAG, LISTENER_TAG] {
            for index in [0u32, 1, 12345] {
                let (t, i) = decode_token(encode_token(tag, index));
                assert_eq!((t, i), (tag, index));
            }
        }
    }

    #[test]
    fn new_connector_starts_idle() {
        let connector = Connector::<Controller>::new(
            DuplexMode::Half,
            vec![Interface::new("unix:///tmp/a.sock", Transport::Unix)],
            vec![Interface::new("tcp://127.0.0.1:1", Transport::Tcp)],
            Box::new(ThreadedResolver::spawn()),
        )
        .unwrap();
        assert!(connector.is_idle());
        assert!(!connector.is_draining());
    }
}
