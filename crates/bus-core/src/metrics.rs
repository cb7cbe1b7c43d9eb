//! Process-wide per-thread load metrics, consulted by `select_stream`.
//!
//! Grounded on the windowed-sample idiom of the teacher's tile metrics
//! (begin/end accounting, periodic reset) but reworked to track
//! interarrival/intercompletion gaps per south stream instead of busy/idle
//! tile ticks, and backed by a plain mutex instead of a shared-memory
//! queue: there is no cross-process consumer here, only an in-process
//! monitoring read from another thread.

use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
    thread::ThreadId,
};

use bus_timing::Nanos;

use crate::arena::SlotId;

#[derive(Clone, Copy, Debug, Default)]
pub struct StreamLoad {
    pub interarrival: Nanos,
    pub intercompletion: Nanos,
    pub last_arrival: Nanos,
    arrivals: u64,
    completions: u64,
}

impl StreamLoad {
    /// A stream is loaded if completions are taking longer than half the
    /// gap between arrivals: it can't keep up.
    pub fn is_loaded(&self) -> bool {
        self.intercompletion > self.interarrival / 2u32
    }
}

#[derive(Default)]
struct ThreadMetrics {
    streams: HashMap<SlotId, StreamLoad>,
}

pub struct MetricsRegistry {
    threads: Mutex<HashMap<ThreadId, ThreadMetrics>>,
}

static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

impl MetricsRegistry {
    pub fn global() -> &'static MetricsRegistry {
        REGISTRY.get_or_init(|| MetricsRegistry { threads: Mutex::new(HashMap::new()) })
    }

    pub fn record_arrival(&self, stream: SlotId, now: Nanos) {
        let mut threads = self.threads.lock().expect("metrics mutex poisoned");
        let entry = threads.entry(std::thread::current().id()).or_default();
        let load = entry.streams.entry(stream).or_default();
        if load.arrivals > 0 {
            load.interarrival = now.elapsed_since(load.last_arrival);
        }
        load.last_arrival = now;
        load.arrivals += 1;
    }

    pub fn record_completion(&self, stream: SlotId, arrival: Nanos, now: Nanos) {
        let mut threads = self.threads.lock().expect("metrics mutex poisoned");
        let entry = threads.entry(std::thread::current().id()).or_default();
        let load = entry.streams.entry(stream).or_default();
        load.intercompletion = now.elapsed_since(arrival);
        load.completions += 1;
    }

    /// `None` means no metric record yet (warm-start: caller should treat
    /// the stream as immediately eligible).
    pub fn record_for(&self, stream: SlotId) -> Option<StreamLoad> {
        let threads = self.threads.lock().expect("metrics mutex poisoned");
        let entry = threads.get(&std::thread::current().id())?;
        entry.streams.get(&stream).filter(|l| l.arrivals > 0).copied()
    }

    pub fn forget(&self, stream: SlotId) {
        let mut threads = self.threads.lock().expect("metrics mutex poisoned");
        if let Some(entry) = threads.get_mut(&std::thread::current().id()) {
            entry.streams.remove(&stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warm_start_has_no_record() {
        let reg = MetricsRegistry::global();
        let slot = SlotId { index: 9999, generation: 0 };
        assert!(reg.record_for(slot).is_none());
    }

    #[test]
    fn loaded_when_intercompletion_exceeds_half_interarrival() {
        let mut load = StreamLoad {
            interarrival: Nanos::from_millis(100),
            intercompletion: Nanos::from_millis(60),
            ..Default::default()
        };
        assert!(load.is_loaded());
        load.intercompletion = Nanos::from_millis(40);
        assert!(!load.is_loaded());
    }
}
