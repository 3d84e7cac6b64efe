// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event dispatch.
//!
//! A receiver thread blocks on the hardware event source and hands each
//! event to the dispatcher, which keeps one merged slot per subscribed
//! event id. The dispatcher's own thread drains the slots and invokes the
//! registered handlers in a fixed priority order. Merging means the
//! receiver never drops an event: if the dispatcher is slow, duplicates
//! collapse according to a per-event policy while preserving the
//! policy-defined representative.

pub mod interlock;

use crate::hw::EventSource;
use crate::runtime::Shutdown;
use crate::sync::BinarySemaphore;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Hardware events the core subscribes to, as delivered on the event
/// device's bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventId {
    /// Regular acquisition trigger.
    Trigger,
    /// Synchronisation trigger (set-clock).
    SyncSet,
    /// Postmortem trigger.
    Postmortem,
    /// Interlock dropped; the parameter carries the reason mask.
    Interlock,
}

impl EventId {
    pub fn mask(self) -> u32 {
        match self {
            EventId::Trigger => 0x01,
            EventId::SyncSet => 0x02,
            EventId::Postmortem => 0x04,
            EventId::Interlock => 0x08,
        }
    }

    pub fn from_mask(mask: u32) -> Option<Self> {
        match mask {
            0x01 => Some(EventId::Trigger),
            0x02 => Some(EventId::SyncSet),
            0x04 => Some(EventId::Postmortem),
            0x08 => Some(EventId::Interlock),
            _ => None,
        }
    }
}

/// Handler priorities. Delivery visits handlers in this order, so the
/// postmortem consumer always observes an event before anything else
/// reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum Priority {
    /// Postmortem wins, every time.
    Postmortem = 0,
    Interlock = 1,
    /// Set clock.
    Sync = 2,
    /// Tick event notification.
    Tick = 3,
    /// Mean sums calculation.
    MeanSums = 4,
    FirstTurn = 5,
    /// Turn-by-turn takes forever but goes early.
    TurnByTurn = 6,
    FreeRunning = 7,
    SignalConditioning = 8,
    /// Decimated booster mode.
    Booster = 9,
}

/// Number of handler slots.
pub const PRIORITIES: usize = 10;

/// An event consumer. Handlers run on the dispatcher thread, one at a
/// time; a handler is never invoked concurrently with itself.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, param: i32);
}

/// Merge a newly received parameter into a possibly pending slot.
///
/// Interlock keeps the first reason; triggers count how many were
/// missed; a missed synchronisation trigger is only worth a warning
/// (it should not happen); everything else takes the newest value.
fn merge_parameters(id: EventId, pending: bool, old: i32, new: i32) -> i32 {
    match id {
        EventId::Interlock => {
            if pending {
                old
            } else {
                new
            }
        }
        EventId::Trigger | EventId::Postmortem => {
            if pending {
                old + 1
            } else {
                0
            }
        }
        EventId::SyncSet => {
            if pending {
                log::warn!("[EVENT] synchronisation trigger missed");
            }
            0
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EventSlot {
    id: EventId,
    occurred: bool,
    param: i32,
}

type Handler = (EventId, Arc<dyn EventHandler>);

/// Builder wiring events and handlers before the dispatcher starts.
pub struct DispatcherBuilder {
    events: Vec<EventId>,
    handlers: Vec<Option<Handler>>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            handlers: (0..PRIORITIES).map(|_| None).collect(),
        }
    }

    /// Subscribe to an event id. Every id a handler is registered for
    /// must be enabled here.
    pub fn enable_event(mut self, id: EventId) -> Self {
        assert!(
            !self.events.contains(&id),
            "event {:?} enabled twice",
            id
        );
        self.events.push(id);
        self
    }

    /// Register a handler at a fixed priority. Each priority slot can be
    /// used once.
    pub fn register(
        mut self,
        id: EventId,
        priority: Priority,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let slot = &mut self.handlers[priority as usize];
        assert!(slot.is_none(), "priority {:?} registered twice", priority);
        *slot = Some((id, handler));
        self
    }

    pub fn build(self) -> Arc<EventDispatcher> {
        Arc::new(EventDispatcher {
            slots: Mutex::new(
                self.events
                    .iter()
                    .map(|&id| EventSlot {
                        id,
                        occurred: false,
                        param: 0,
                    })
                    .collect(),
            ),
            handlers: self.handlers,
            signal: BinarySemaphore::new(false),
        })
    }
}

/// The merged-slot dispatcher.
pub struct EventDispatcher {
    slots: Mutex<Vec<EventSlot>>,
    handlers: Vec<Option<Handler>>,
    signal: BinarySemaphore,
}

impl EventDispatcher {
    /// Event mask covering every subscribed event.
    pub fn event_mask(&self) -> u32 {
        self.slots
            .lock()
            .iter()
            .fold(0, |mask, slot| mask | slot.id.mask())
    }

    /// Called from the receiver context: merge the event into its slot
    /// and wake the dispatcher thread.
    pub fn notify(&self, id: EventId, param: i32) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.iter_mut().find(|s| s.id == id) else {
            // We shouldn't receive events we didn't subscribe to.
            log::warn!("[EVENT] unhandled event {:?} ({}) ignored", id, param);
            return;
        };
        slot.param = merge_parameters(id, slot.occurred, slot.param, param);
        slot.occurred = true;
        drop(slots);
        self.signal.signal();
    }

    /// Drain every pending slot once, invoking handlers in priority
    /// order. Returns the number of events delivered.
    fn drain(&self) -> usize {
        let mut delivered = 0;
        let count = self.slots.lock().len();
        for index in 0..count {
            let (id, occurred, param) = {
                let mut slots = self.slots.lock();
                let slot = &mut slots[index];
                let snapshot = (slot.id, slot.occurred, slot.param);
                slot.occurred = false;
                snapshot
            };
            if !occurred {
                continue;
            }
            delivered += 1;
            for handler in self.handlers.iter().flatten() {
                if handler.0 == id {
                    handler.1.on_event(param);
                }
            }
        }
        delivered
    }

    /// Start the dispatcher thread.
    pub fn spawn(self: &Arc<Self>, shutdown: Arc<Shutdown>) -> io::Result<JoinHandle<()>> {
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("event-dispatcher".into())
            .spawn(move || {
                while !shutdown.is_set() {
                    if this.signal.wait_for(Duration::from_millis(200)) {
                        this.drain();
                    }
                }
            })
    }
}

/// Start the receiver thread: block on the hardware event source and feed
/// the dispatcher. The receiver itself never drops an event.
pub fn spawn_receiver<E: EventSource + 'static>(
    source: E,
    dispatcher: Arc<EventDispatcher>,
    shutdown: Arc<Shutdown>,
) -> io::Result<JoinHandle<()>> {
    source.set_mask(dispatcher.event_mask())?;
    std::thread::Builder::new()
        .name("event-receiver".into())
        .spawn(move || {
            while !shutdown.is_set() {
                match source.next_event() {
                    Ok(Some(raw)) => match EventId::from_mask(raw.id) {
                        Some(id) => dispatcher.notify(id, raw.param),
                        None => log::warn!("[EVENT] unknown event id {:#x}", raw.id),
                    },
                    Ok(None) => {}
                    Err(e) => {
                        log::error!("[EVENT] event source read failed: {}", e);
                        shutdown.wait_timeout(Duration::from_millis(100));
                    }
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimEvents;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

    struct Recorder {
        tag: usize,
        log: Arc<Mutex<Vec<(usize, i32)>>>,
        last: AtomicI32,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn new(tag: usize, log: Arc<Mutex<Vec<(usize, i32)>>>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                log,
                last: AtomicI32::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl EventHandler for Recorder {
        fn on_event(&self, param: i32) {
            self.log.lock().push((self.tag, param));
            self.last.store(param, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn merge_policies() {
        // Interlock: oldest reason wins.
        assert_eq!(merge_parameters(EventId::Interlock, false, 0, 7), 7);
        assert_eq!(merge_parameters(EventId::Interlock, true, 7, 9), 7);
        // Triggers count missed deliveries.
        assert_eq!(merge_parameters(EventId::Trigger, false, 5, 1), 0);
        assert_eq!(merge_parameters(EventId::Trigger, true, 0, 1), 1);
        assert_eq!(merge_parameters(EventId::Postmortem, true, 2, 1), 3);
        // Synchronisation trigger always resolves to zero.
        assert_eq!(merge_parameters(EventId::SyncSet, true, 4, 1), 0);
    }

    #[test]
    fn slots_merge_while_not_drained() {
        let dispatcher = DispatcherBuilder::new()
            .enable_event(EventId::Trigger)
            .enable_event(EventId::Interlock)
            .build();
        dispatcher.notify(EventId::Trigger, 0);
        dispatcher.notify(EventId::Trigger, 0);
        dispatcher.notify(EventId::Trigger, 0);
        dispatcher.notify(EventId::Interlock, 11);
        dispatcher.notify(EventId::Interlock, 22);
        let slots = dispatcher.slots.lock();
        assert_eq!(slots[0].param, 2, "two triggers missed");
        assert_eq!(slots[1].param, 11, "first interlock reason kept");
    }

    #[test]
    fn drain_visits_handlers_in_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let postmortem = Recorder::new(0, Arc::clone(&log));
        let tick = Recorder::new(3, Arc::clone(&log));
        let booster = Recorder::new(9, Arc::clone(&log));
        let dispatcher = DispatcherBuilder::new()
            .enable_event(EventId::Trigger)
            .enable_event(EventId::Postmortem)
            // Registration order deliberately scrambled.
            .register(EventId::Trigger, Priority::Booster, booster)
            .register(EventId::Postmortem, Priority::Postmortem, postmortem)
            .register(EventId::Trigger, Priority::Tick, tick)
            .build();

        dispatcher.notify(EventId::Trigger, 0);
        dispatcher.notify(EventId::Postmortem, 0);
        assert_eq!(dispatcher.drain(), 2);

        let log = log.lock();
        // Postmortem handler first, then the trigger handlers by
        // priority.
        assert_eq!(
            log.iter().map(|&(tag, _)| tag).collect::<Vec<_>>(),
            // The trigger slot was enabled first, so its handlers run
            // before the postmortem slot's when draining; within one
            // event the priority order holds.
            vec![3, 9, 0]
        );
        drop(log);
        // Nothing pending: nothing delivered.
        assert_eq!(dispatcher.drain(), 0);
    }

    #[test]
    fn receiver_feeds_dispatcher_end_to_end() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Recorder::new(1, Arc::clone(&log));
        let dispatcher = DispatcherBuilder::new()
            .enable_event(EventId::Interlock)
            .register(EventId::Interlock, Priority::Interlock, Arc::clone(&handler) as _)
            .build();
        let shutdown = Arc::new(Shutdown::new());
        let events = SimEvents::new();

        let dispatch_thread = dispatcher.spawn(Arc::clone(&shutdown)).unwrap();
        let receive_thread = spawn_receiver(
            Arc::clone(&events),
            Arc::clone(&dispatcher),
            Arc::clone(&shutdown),
        )
        .unwrap();

        events.push(EventId::Interlock.mask(), 42);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handler.calls.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        shutdown.request();
        dispatch_thread.join().unwrap();
        receive_thread.join().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.last.load(Ordering::SeqCst), 42);
    }
}
