//! Non-blocking signal polling, checked once per event loop tick rather than
//! handled asynchronously: SIGTERM/SIGHUP start a drain, SIGINT exits at once.

use std::io;

use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};

pub struct SignalWatcher {
    signals: Signals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// Immediate shutdown; carries the raw signal number to use as exit code.
    Terminate(i32),
    /// Graceful drain; carries the raw signal number to use as the eventual exit code.
    Drain(i32),
}

impl SignalWatcher {
    pub fn new() -> io::Result<Self> {
        Ok(Self { signals: Signals::new([SIGTERM, SIGHUP, SIGINT])? })
    }

    /// Drains all pending signals, returning the most urgent event seen.
    /// SIGINT always wins over a pending drain request.
    pub fn poll(&mut self) -> Option<SignalEvent> {
        let mut event = None;
        for signal in self.signals.pending() {
            let next = match signal {
                SIGINT => Some(SignalEvent::Terminate(SIGINT)),
                SIGTERM => Some(SignalEvent::Drain(SIGTERM)),
                SIGHUP => Some(SignalEvent::Drain(SIGHUP)),
                _ => None,
            };
            match (event, next) {
                (_, Some(SignalEvent::Terminate(s))) => event = Some(SignalEvent::Terminate(s)),
                (None, Some(e)) => event = Some(e),
                _ => {}
            }
        }
        event
    }
}
