// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event consumers.
//!
//! Each consumer forwards its event to the observer layer through an
//! [`Interlock`]: wait for the previous cycle's acknowledgement, latch
//! the event data, raise the observer edge. The observer layer itself is
//! external; until it attaches, the loopback sink acknowledges each cycle
//! immediately so the dispatcher never stalls on a missing reader.

use bpmd::events::interlock::{Interlock, MachineTimestamp, TriggerSink};
use bpmd::events::EventHandler;
use bpmd::sync::OnceSignal;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Stand-in observer: logs the edge and acknowledges at once. The real
/// observer layer replaces this sink and calls `report_done` from its own
/// processing chain.
pub struct LoopbackSink {
    name: &'static str,
    interlock: Mutex<Option<Arc<Interlock>>>,
}

impl LoopbackSink {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            interlock: Mutex::new(None),
        })
    }

    pub fn attach(&self, interlock: &Arc<Interlock>) {
        *self.interlock.lock() = Some(Arc::clone(interlock));
    }
}

impl TriggerSink for LoopbackSink {
    fn raise(&self, _timestamp: SystemTime) {
        log::debug!("[{}] observer edge raised", self.name);
        if let Some(interlock) = self.interlock.lock().as_ref() {
            interlock.report_done();
        }
    }
}

fn loopback_interlock(name: &'static str, ready: &Arc<OnceSignal>) -> Arc<Interlock> {
    let sink = LoopbackSink::new(name);
    let interlock = Arc::new(Interlock::new(name, Arc::clone(ready), Arc::clone(&sink) as _));
    sink.attach(&interlock);
    interlock
}

/// Postmortem consumer: the highest-priority handler, so the postmortem
/// buffers are latched before anything else reacts to the event.
pub struct PostmortemConsumer {
    interlock: Arc<Interlock>,
    missed: AtomicI32,
}

impl PostmortemConsumer {
    pub fn new(ready: &Arc<OnceSignal>) -> Arc<Self> {
        Arc::new(Self {
            interlock: loopback_interlock("PM", ready),
            missed: AtomicI32::new(0),
        })
    }

    pub fn missed(&self) -> i32 {
        self.missed.load(Ordering::Relaxed)
    }
}

impl EventHandler for PostmortemConsumer {
    fn on_event(&self, missed: i32) {
        self.interlock.wait();
        if missed > 0 {
            log::warn!("[PM] {} postmortem trigger(s) merged", missed);
        }
        self.missed.store(missed, Ordering::Relaxed);
        self.interlock.ready(None);
    }
}

/// Interlock-drop consumer: records the first reason and passes it on.
pub struct InterlockConsumer {
    interlock: Arc<Interlock>,
    reason: AtomicI32,
}

impl InterlockConsumer {
    pub fn new(ready: &Arc<OnceSignal>) -> Arc<Self> {
        Arc::new(Self {
            interlock: loopback_interlock("IL", ready),
            reason: AtomicI32::new(0),
        })
    }

    pub fn reason(&self) -> i32 {
        self.reason.load(Ordering::Relaxed)
    }
}

impl EventHandler for InterlockConsumer {
    fn on_event(&self, reason: i32) {
        self.interlock.wait();
        log::info!("[IL] interlock dropped, reason mask {:#x}", reason);
        self.reason.store(reason, Ordering::Relaxed);
        self.interlock.ready(None);
    }
}

/// Trigger tick consumer: timestamps each machine trigger for the
/// observer layer. System time only goes out while the status monitor
/// reports the system clock synchronised; otherwise the observer is left
/// to default the timestamp.
pub struct TickConsumer {
    interlock: Arc<Interlock>,
    monitor: Arc<crate::monitor::ClockMonitor>,
    ticks: AtomicU64,
}

impl TickConsumer {
    pub fn new(ready: &Arc<OnceSignal>, monitor: Arc<crate::monitor::ClockMonitor>) -> Arc<Self> {
        Arc::new(Self {
            interlock: loopback_interlock("CK:TICK", ready),
            monitor,
            ticks: AtomicU64::new(0),
        })
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl EventHandler for TickConsumer {
    fn on_event(&self, _param: i32) {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        self.interlock.wait();
        if self.monitor.system_clock_synchronised() {
            self.interlock.ready(Some(MachineTimestamp {
                system: SystemTime::now(),
                machine: tick,
            }));
        } else {
            self.interlock.ready(None);
        }
    }
}

/// Mean-sums consumer: accumulates intensity sums for the booster ramp
/// observers.
pub struct MeanSumsConsumer {
    interlock: Arc<Interlock>,
    sum: Mutex<i64>,
    events: AtomicU64,
}

impl MeanSumsConsumer {
    pub fn new(ready: &Arc<OnceSignal>) -> Arc<Self> {
        Arc::new(Self {
            interlock: loopback_interlock("MS", ready),
            sum: Mutex::new(0),
            events: AtomicU64::new(0),
        })
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> i64 {
        *self.sum.lock()
    }
}

impl EventHandler for MeanSumsConsumer {
    fn on_event(&self, param: i32) {
        self.events.fetch_add(1, Ordering::Relaxed);
        self.interlock.wait();
        *self.sum.lock() += param as i64;
        self.interlock.ready(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> Arc<OnceSignal> {
        let signal = Arc::new(OnceSignal::new());
        signal.set();
        signal
    }

    #[test]
    fn loopback_keeps_the_cycle_flowing() {
        let ready = ready();
        let tick = TickConsumer::new(&ready, crate::monitor::ClockMonitor::new());
        // With the loopback acknowledging each cycle, many events pass
        // without ever hitting the handshake timeout.
        let start = std::time::Instant::now();
        for _ in 0..5 {
            tick.on_event(0);
        }
        assert_eq!(tick.ticks(), 5);
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn interlock_consumer_records_reason() {
        let ready = ready();
        let consumer = InterlockConsumer::new(&ready);
        consumer.on_event(0x40);
        assert_eq!(consumer.reason(), 0x40);
    }

    #[test]
    fn postmortem_consumer_reports_merged_triggers() {
        let ready = ready();
        let consumer = PostmortemConsumer::new(&ready);
        consumer.on_event(2);
        assert_eq!(consumer.missed(), 2);
    }
}
