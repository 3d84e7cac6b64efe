// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Small synchronisation building blocks shared by the servo, event and
//! handshake layers.
//!
//! Two primitives live here:
//!
//! - [`BinarySemaphore`] -- a single-resource semaphore with a timed wait,
//!   used for the dispatcher wakeup and the observer handshake.
//! - [`OnceSignal`] -- a one-shot broadcast condition that, once set, never
//!   clears. Waits after the set are no-ops, so late waiters cannot lose
//!   the wakeup.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Single-resource binary semaphore.
///
/// `signal` deposits the resource, `wait`/`wait_for` consume it. Signalling
/// an already-signalled semaphore is reported to the caller so double
/// handshakes can be diagnosed.
#[derive(Debug)]
pub struct BinarySemaphore {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl BinarySemaphore {
    pub fn new(initially_ready: bool) -> Self {
        Self {
            ready: Mutex::new(initially_ready),
            cond: Condvar::new(),
        }
    }

    /// Block until the resource is available, then consume it.
    pub fn wait(&self) {
        let mut ready = self.ready.lock();
        while !*ready {
            self.cond.wait(&mut ready);
        }
        *ready = false;
    }

    /// Block for at most `timeout`. Returns `true` if the resource was
    /// consumed, `false` on timeout.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.lock();
        if !*ready {
            let deadline = std::time::Instant::now() + timeout;
            while !*ready {
                if self.cond.wait_until(&mut ready, deadline).timed_out() {
                    break;
                }
            }
        }
        let taken = *ready;
        *ready = false;
        taken
    }

    /// Deposit the resource and wake one waiter. Returns `true` if the
    /// semaphore was already signalled (the deposit was redundant).
    pub fn signal(&self) -> bool {
        let mut ready = self.ready.lock();
        let was_ready = *ready;
        *ready = true;
        self.cond.notify_one();
        was_ready
    }
}

/// One-shot broadcast condition.
///
/// The set transition happens exactly once; every current and future
/// waiter proceeds. This avoids the lost-wakeup hazard a bare semaphore
/// would have when a waiter arrives after the producer has signalled.
#[derive(Debug, Default)]
pub struct OnceSignal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl OnceSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the condition as set and wake every waiter. Idempotent.
    pub fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_all();
    }

    /// Block until the condition has been set. Returns immediately if it
    /// already has.
    pub fn wait(&self) {
        // Lock-free fast path once set: the flag never clears again.
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }
}
