// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Observer handshake interlock.
//!
//! Handlers that pass a data set to the external observer layer gate each
//! cycle on this object: `wait` blocks until the observer acknowledged
//! the previous cycle, `ready` publishes the new data, and the observer
//! calls `report_done` when it has consumed it. A lost acknowledgement
//! must not wedge the producer, so `wait` gives up after a timeout with a
//! warning and carries on.
//!
//! The very first `wait` on any interlock additionally blocks on a
//! process-wide observer-ready broadcast, set exactly once when the
//! observer layer finishes its own initialisation.

use crate::sync::{BinarySemaphore, OnceSignal};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Defensive fallback against lost acknowledgements.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// A timestamp pair: system time plus the free-running machine clock.
#[derive(Debug, Clone, Copy)]
pub struct MachineTimestamp {
    pub system: SystemTime,
    pub machine: u64,
}

/// The observer-facing edge: raising it wakes the external reader.
pub trait TriggerSink: Send + Sync {
    fn raise(&self, timestamp: SystemTime);
}

/// One producer-observer handshake.
pub struct Interlock {
    name: String,
    observer_ready: Arc<OnceSignal>,
    // Starts ready: wait is called before the first ready.
    gate: BinarySemaphore,
    sink: Arc<dyn TriggerSink>,
    /// Machine clock of the last published set, split into two 31-bit
    /// halves (the observer's integers are signed).
    machine_clock: Mutex<(i32, i32)>,
    timeout: Duration,
}

impl Interlock {
    pub fn new(
        name: impl Into<String>,
        observer_ready: Arc<OnceSignal>,
        sink: Arc<dyn TriggerSink>,
    ) -> Self {
        Self::with_timeout(name, observer_ready, sink, HANDSHAKE_TIMEOUT)
    }

    pub fn with_timeout(
        name: impl Into<String>,
        observer_ready: Arc<OnceSignal>,
        sink: Arc<dyn TriggerSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            observer_ready,
            gate: BinarySemaphore::new(true),
            sink,
            machine_clock: Mutex::new((0, 0)),
            timeout,
        }
    }

    /// Block until the observer has acknowledged the previous cycle (and,
    /// the first time, until the observer layer is up at all).
    pub fn wait(&self) {
        self.observer_ready.wait();
        if !self.gate.wait_for(self.timeout) {
            log::warn!("{}: timed out waiting for observer handshake", self.name);
        }
    }

    /// Publish a new data set: record the machine time and raise the
    /// observer edge.
    pub fn ready(&self, timestamp: Option<MachineTimestamp>) {
        match timestamp {
            Some(ts) => {
                let mut mc = self.machine_clock.lock();
                *mc = (
                    (ts.machine & 0x7FFF_FFFF) as i32,
                    ((ts.machine >> 31) & 0x7FFF_FFFF) as i32,
                );
                self.sink.raise(ts.system);
            }
            None => self.sink.raise(SystemTime::now()),
        }
    }

    /// Invoked by the observer when it has finished with the data set.
    pub fn report_done(&self) {
        if self.gate.signal() {
            log::warn!("{}: unexpected extra observer signal", self.name);
        }
    }

    /// Machine clock of the last published set, as (low, high) 31-bit
    /// halves.
    pub fn machine_clock(&self) -> (i32, i32) {
        *self.machine_clock.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct CountingSink {
        raised: AtomicUsize,
    }

    impl TriggerSink for CountingSink {
        fn raise(&self, _timestamp: SystemTime) {
            self.raised.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ready_now() -> Arc<OnceSignal> {
        let signal = Arc::new(OnceSignal::new());
        signal.set();
        signal
    }

    #[test]
    fn first_wait_returns_immediately() {
        let sink = Arc::new(CountingSink::default());
        let interlock = Interlock::new("TEST", ready_now(), sink);
        let start = Instant::now();
        interlock.wait();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn wait_blocks_until_observer_layer_is_up() {
        let signal = Arc::new(OnceSignal::new());
        let sink = Arc::new(CountingSink::default());
        let interlock = Arc::new(Interlock::new("TEST", Arc::clone(&signal), sink));
        let i = Arc::clone(&interlock);
        let waiter = std::thread::spawn(move || i.wait());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        signal.set();
        waiter.join().unwrap();
    }

    #[test]
    fn normal_cycle_alternates() {
        let sink = Arc::new(CountingSink::default());
        let interlock = Interlock::with_timeout(
            "TEST",
            ready_now(),
            Arc::clone(&sink) as _,
            Duration::from_millis(50),
        );
        for cycle in 0..3 {
            interlock.wait();
            interlock.ready(Some(MachineTimestamp {
                system: SystemTime::now(),
                machine: 0x1_2345_6789,
            }));
            interlock.report_done();
            assert_eq!(sink.raised.load(Ordering::SeqCst), cycle + 1);
        }
        // 0x123456789 split into 31-bit halves.
        let (low, high) = interlock.machine_clock();
        assert_eq!(low, (0x1_2345_6789u64 & 0x7FFF_FFFF) as i32);
        assert_eq!(high, (0x1_2345_6789u64 >> 31) as i32);
    }

    #[test]
    fn missed_handshake_times_out_and_recovers() {
        let sink = Arc::new(CountingSink::default());
        let interlock = Interlock::with_timeout(
            "TEST",
            ready_now(),
            sink,
            Duration::from_millis(50),
        );
        interlock.wait();
        interlock.ready(None);
        // Observer forgets report_done: the next wait times out instead
        // of deadlocking.
        let start = Instant::now();
        interlock.wait();
        assert!(start.elapsed() >= Duration::from_millis(45));
        // The cycle afterwards proceeds normally again.
        interlock.ready(None);
        interlock.report_done();
        let start = Instant::now();
        interlock.wait();
        assert!(start.elapsed() < Duration::from_millis(40));
    }

    #[test]
    fn double_done_is_flagged_not_fatal() {
        let sink = Arc::new(CountingSink::default());
        let interlock = Interlock::with_timeout(
            "TEST",
            ready_now(),
            sink,
            Duration::from_millis(50),
        );
        interlock.wait();
        interlock.ready(None);
        interlock.report_done();
        // The second done is absorbed (and warned about).
        interlock.report_done();
        interlock.wait();
    }
}
