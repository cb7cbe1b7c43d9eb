//! Thin wrapper over one `mio::Poll`. Per-socket interest-mask mutation
//! (arming/disarming `WRITABLE`) is owned by `net::StreamBuffer` directly,
//! since it already holds the socket and must reregister it in lockstep
//! with its own backlog bookkeeping; this type only owns the `Poll`/
//! `Events` pair and the registry handle sockets register against.

use std::{io, time::Duration};

use mio::{Events, Poll};

pub struct TriggerSet {
    poll: Poll,
    events: Events,
}

impl TriggerSet {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self { poll: Poll::new()?, events: Events::with_capacity(capacity) })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Blocks for up to `timeout` (or forever if `None`) and returns the
    /// batch of ready events.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<&Events> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(&self.events)
    }
}
