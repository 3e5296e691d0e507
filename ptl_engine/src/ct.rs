// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Counting events and the triggered operations armed on them.
//!
//! Both counters are monotonic for the life of the CT. Each bump
//! wakes waiters and detaches, in threshold order, every armed
//! operation whose threshold the combined count has reached. The
//! detached list is handed back to the caller and dispatched only
//! after the CT lock is released; nothing user-visible ever runs
//! under it.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::api::OpArgs;
use crate::pool::{Handle, ObjTag, PoolObject};
use crate::{PtlError, Result};

/// The counter pair reported to users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtEvent {
    pub success: u64,
    pub failure: u64,
}

impl CtEvent {
    fn sum(&self) -> u64 {
        self.success + self.failure
    }
}

/// A deferred operation, fired when its CT reaches `threshold`.
#[derive(Debug, Clone)]
pub enum TriggeredOp {
    Put(OpArgs),
    Get(OpArgs),
    Atomic(OpArgs),
    FetchAtomic(OpArgs),
    Swap(OpArgs),
    CtInc { ct: Handle, increment: CtEvent },
    CtSet { ct: Handle, value: CtEvent },
}

#[derive(Debug, Clone)]
pub struct Triggered {
    pub threshold: u64,
    pub op: TriggeredOp,
}

struct CtInner {
    count: CtEvent,

    /// Armed operations, kept sorted by threshold so firing walks a
    /// prefix.
    triggered: Vec<Triggered>,

    interrupted: bool,
}

/// A counting event. Pool-resident.
pub struct Ct {
    inner: Mutex<CtInner>,
    cond: Condvar,
}

impl Default for Ct {
    fn default() -> Self {
        Self {
            inner: Mutex::new(CtInner {
                count: CtEvent::default(),
                triggered: Vec::new(),
                interrupted: false,
            }),
            cond: Condvar::new(),
        }
    }
}

impl PoolObject for Ct {
    const TAG: ObjTag = ObjTag::Ct;

    fn on_alloc(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.count = CtEvent::default();
        inner.triggered.clear();
        inner.interrupted = false;
    }

    fn on_free(&self) {
        // Armed operations do not survive their CT.
        let mut inner = self.inner.lock().unwrap();
        inner.triggered.clear();
    }
}

impl Ct {
    pub fn get(&self) -> CtEvent {
        self.inner.lock().unwrap().count
    }

    /// Add to the counters. Returns the operations this bump fired;
    /// the caller dispatches them with no CT lock held.
    #[must_use]
    pub fn inc(&self, increment: CtEvent) -> Vec<Triggered> {
        let mut inner = self.inner.lock().unwrap();
        inner.count.success += increment.success;
        inner.count.failure += increment.failure;
        self.after_bump(&mut inner)
    }

    /// Overwrite the counters. Portals allows set to move counters
    /// backwards; triggered thresholds are judged against the new
    /// value.
    #[must_use]
    pub fn set(&self, value: CtEvent) -> Vec<Triggered> {
        let mut inner = self.inner.lock().unwrap();
        inner.count = value;
        self.after_bump(&mut inner)
    }

    fn after_bump(&self, inner: &mut CtInner) -> Vec<Triggered> {
        self.cond.notify_all();

        let sum = inner.count.sum();
        let ready = inner.triggered.partition_point(|t| t.threshold <= sum);
        inner.triggered.drain(..ready).collect()
    }

    /// Arm `op` at `threshold`. If the threshold has already been
    /// reached the operation is handed back for immediate dispatch
    /// instead of being armed; either way it runs exactly once.
    pub fn arm(
        &self,
        threshold: u64,
        op: &TriggeredOp,
        max_armed: usize,
    ) -> Result<Option<TriggeredOp>> {
        let mut inner = self.inner.lock().unwrap();

        if inner.count.sum() >= threshold {
            return Ok(Some(op.clone()));
        }

        if inner.triggered.len() >= max_armed {
            return Err(PtlError::NoSpace);
        }

        let pos = inner.triggered.partition_point(|t| t.threshold <= threshold);
        inner.triggered.insert(
            pos,
            Triggered {
                threshold,
                op: op.clone(),
            },
        );
        Ok(None)
    }

    /// Detach every armed operation (CT free / NI teardown).
    #[must_use]
    pub fn cancel_all(&self) -> Vec<Triggered> {
        self.inner.lock().unwrap().triggered.drain(..).collect()
    }

    /// Block until `success + failure >= threshold`.
    pub fn wait(&self, threshold: u64) -> Result<CtEvent> {
        let mut inner = self.inner.lock().unwrap();

        loop {
            if inner.count.sum() >= threshold {
                return Ok(inner.count);
            }
            if inner.interrupted {
                return Err(PtlError::Interrupted);
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Bounded wait; `CtNoneReached` on expiry.
    pub fn poll(&self, threshold: u64, timeout: Duration) -> Result<CtEvent> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();

        loop {
            if inner.count.sum() >= threshold {
                return Ok(inner.count);
            }
            if inner.interrupted {
                return Err(PtlError::Interrupted);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PtlError::CtNoneReached);
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    /// Number of operations still armed (teardown diagnostics).
    pub fn armed(&self) -> usize {
        self.inner.lock().unwrap().triggered.len()
    }

    pub fn interrupt(&self) {
        self.inner.lock().unwrap().interrupted = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ct() -> Ct {
        let ct = Ct::default();
        ct.on_alloc();
        ct
    }

    fn dummy_op() -> TriggeredOp {
        TriggeredOp::CtInc {
            ct: Handle::NONE,
            increment: CtEvent {
                success: 1,
                failure: 0,
            },
        }
    }

    #[test]
    fn counters_accumulate() {
        let ct = ct();
        assert!(ct.inc(CtEvent { success: 3, failure: 0 }).is_empty());
        assert!(ct.inc(CtEvent { success: 0, failure: 2 }).is_empty());
        assert_eq!(ct.get(), CtEvent { success: 3, failure: 2 });
    }

    #[test]
    fn fires_exactly_once_at_threshold() {
        let ct = ct();
        assert!(ct.arm(3, &dummy_op(), 16).unwrap().is_none());

        assert!(ct.inc(CtEvent { success: 1, failure: 0 }).is_empty());
        assert!(ct.inc(CtEvent { success: 1, failure: 0 }).is_empty());

        // Third increment crosses the threshold:
        let fired = ct.inc(CtEvent { success: 1, failure: 0 });
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].threshold, 3);

        // Never again:
        assert!(ct.inc(CtEvent { success: 5, failure: 0 }).is_empty());
        assert_eq!(ct.armed(), 0);
    }

    #[test]
    fn failures_count_toward_thresholds() {
        let ct = ct();
        assert!(ct.arm(2, &dummy_op(), 16).unwrap().is_none());

        assert!(ct.inc(CtEvent { success: 1, failure: 0 }).is_empty());
        let fired = ct.inc(CtEvent { success: 0, failure: 1 });
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn arming_at_reached_threshold_fires_immediately() {
        let ct = ct();
        let _ = ct.inc(CtEvent { success: 5, failure: 0 });

        let fired = ct.arm(3, &dummy_op(), 16).unwrap();
        assert!(fired.is_some());
        assert_eq!(ct.armed(), 0);
    }

    #[test]
    fn fires_in_threshold_order() {
        let ct = ct();
        assert!(ct.arm(5, &dummy_op(), 16).unwrap().is_none());
        assert!(ct.arm(2, &dummy_op(), 16).unwrap().is_none());
        assert!(ct.arm(4, &dummy_op(), 16).unwrap().is_none());

        let fired = ct.inc(CtEvent { success: 4, failure: 0 });
        let thresholds: Vec<u64> = fired.iter().map(|t| t.threshold).collect();
        assert_eq!(thresholds, vec![2, 4]);
        assert_eq!(ct.armed(), 1);
    }

    #[test]
    fn wait_and_poll() {
        let ct = std::sync::Arc::new(ct());

        let waiter = {
            let ct = ct.clone();
            std::thread::spawn(move || ct.wait(2).unwrap())
        };

        std::thread::sleep(Duration::from_millis(10));
        let _ = ct.inc(CtEvent { success: 2, failure: 0 });
        assert_eq!(waiter.join().unwrap().success, 2);

        assert_eq!(
            ct.poll(10, Duration::from_millis(5)).unwrap_err(),
            PtlError::CtNoneReached
        );
    }
}
