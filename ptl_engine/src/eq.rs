// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Event queues: bounded rings with a monotonic sequence number.
//! Overrun is detected, not fatal: the producer drops the newest
//! event and the next read reports the loss once.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::*;

use crate::event::Event;
use crate::pool::{ObjTag, PoolObject};
use crate::{PtlError, Result};

struct EqInner {
    ring: VecDeque<Event>,
    capacity: usize,

    /// Sequence number of the next event posted; reads observe a
    /// strictly increasing sequence.
    prod_seq: u64,

    /// Set when a post found the ring full; cleared by the read that
    /// reports it.
    dropped: bool,

    /// Teardown flag; unblocks waiters with `Interrupted`.
    interrupted: bool,
}

/// An event queue. Pool-resident; sized by `init` at alloc time.
pub struct Eq {
    inner: Mutex<EqInner>,
    cond: Condvar,
}

impl Default for Eq {
    fn default() -> Self {
        Self {
            inner: Mutex::new(EqInner {
                ring: VecDeque::new(),
                capacity: 0,
                prod_seq: 0,
                dropped: false,
                interrupted: false,
            }),
            cond: Condvar::new(),
        }
    }
}

impl PoolObject for Eq {
    const TAG: ObjTag = ObjTag::Eq;

    fn on_alloc(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.ring.clear();
        inner.capacity = 0;
        inner.prod_seq = 0;
        inner.dropped = false;
        inner.interrupted = false;
    }
}

impl Eq {
    pub fn init(&self, count: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.capacity = count.max(1);
        let capacity = inner.capacity;
        inner.ring.reserve(capacity);
    }

    /// Post one event. Called by the engine, never by users.
    pub fn post(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();

        if inner.ring.len() == inner.capacity {
            warn!("event queue overrun at seq {}", inner.prod_seq);
            inner.dropped = true;
        } else {
            inner.ring.push_back(event);
        }
        inner.prod_seq += 1;

        drop(inner);
        self.cond.notify_all();
    }

    /// Non-blocking read. The `bool` is true when events were lost
    /// since the previous read; the loss is reported exactly once.
    pub fn get(&self) -> Result<(Event, bool)> {
        let mut inner = self.inner.lock().unwrap();
        self.take(&mut inner)
    }

    /// Block until an event arrives or teardown interrupts the wait.
    pub fn wait(&self) -> Result<(Event, bool)> {
        let mut inner = self.inner.lock().unwrap();

        loop {
            if inner.interrupted {
                return Err(PtlError::Interrupted);
            }
            if !inner.ring.is_empty() {
                return self.take(&mut inner);
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Block up to `timeout`; `EqEmpty` on expiry.
    pub fn poll(&self, timeout: Duration) -> Result<(Event, bool)> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();

        loop {
            if inner.interrupted {
                return Err(PtlError::Interrupted);
            }
            if !inner.ring.is_empty() {
                return self.take(&mut inner);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PtlError::EqEmpty);
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    fn take(&self, inner: &mut EqInner) -> Result<(Event, bool)> {
        let Some(event) = inner.ring.pop_front() else {
            return Err(PtlError::EqEmpty);
        };

        let dropped = inner.dropped;
        inner.dropped = false;
        Ok((event, dropped))
    }

    /// Wake every waiter with `Interrupted`; used by NI teardown.
    pub fn interrupt(&self) {
        self.inner.lock().unwrap().interrupted = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn eq(capacity: usize) -> Eq {
        let eq = Eq::default();
        eq.on_alloc();
        eq.init(capacity);
        eq
    }

    fn event(kind: EventKind) -> Event {
        Event {
            kind,
            ..Default::default()
        }
    }

    #[test]
    fn fifo_and_empty() {
        let eq = eq(4);
        assert_eq!(eq.get().unwrap_err(), PtlError::EqEmpty);

        eq.post(event(EventKind::Send));
        eq.post(event(EventKind::Ack));

        assert_eq!(eq.get().unwrap().0.kind, EventKind::Send);
        assert_eq!(eq.get().unwrap().0.kind, EventKind::Ack);
        assert_eq!(eq.get().unwrap_err(), PtlError::EqEmpty);
    }

    #[test]
    fn overrun_reported_once() {
        let eq = eq(2);

        eq.post(event(EventKind::Put));
        eq.post(event(EventKind::Put));
        eq.post(event(EventKind::Put)); // lost

        let (_, dropped) = eq.get().unwrap();
        assert!(dropped);
        let (_, dropped) = eq.get().unwrap();
        assert!(!dropped);
    }

    #[test]
    fn wait_unblocks_on_post() {
        let eq = std::sync::Arc::new(eq(2));

        let waiter = {
            let eq = eq.clone();
            std::thread::spawn(move || eq.wait().unwrap().0.kind)
        };

        std::thread::sleep(Duration::from_millis(10));
        eq.post(event(EventKind::Reply));
        assert_eq!(waiter.join().unwrap(), EventKind::Reply);
    }

    #[test]
    fn interrupt_unblocks_waiters() {
        let eq = std::sync::Arc::new(eq(2));

        let waiter = {
            let eq = eq.clone();
            std::thread::spawn(move || eq.wait())
        };

        std::thread::sleep(Duration::from_millis(10));
        eq.interrupt();
        assert_eq!(waiter.join().unwrap().unwrap_err(), PtlError::Interrupted);
    }

    #[test]
    fn poll_times_out() {
        let eq = eq(2);
        assert_eq!(
            eq.poll(Duration::from_millis(5)).unwrap_err(),
            PtlError::EqEmpty
        );
    }
}
