// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The lock-free fragment queues that move buffers between ranks
//! through the shared segment.
//!
//! Multi-producer, single-consumer, Nemesis protocol: producers
//! atomically exchange the tail and link their predecessor, the one
//! consumer keeps a shadow head so the common dequeue path touches
//! no producer cache line. All links are segment offsets, never
//! pointers, so every attached process reads the same queue no
//! matter where its mapping landed. `NIL` terminates everything.
//!
//! The ordered variant packs `(ticket, offset)` into the 64-bit
//! tail, which keeps enqueues totally ordered by ticket under a
//! plain 64-bit CAS and lets the consumer refuse to pop past a
//! sequence-number barrier.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Offset value meaning "no node".
pub const NIL: u32 = u32::MAX;

/// Empty polls before a blocking dequeue gives up spinning and goes
/// to sleep on the segment's condvar.
pub const POLL_LIMIT: u32 = 1000;

/// Replace blocking with a pause-instruction spin. Useful when every
/// rank has a core to itself.
pub const USE_HARD_POLLING: bool = false;

/// Header every queued fragment starts with. Buffers embed this as
/// their first field.
#[repr(C)]
pub struct QueueNode {
    next: AtomicU32,
    ticket: AtomicU32,
}

impl QueueNode {
    pub fn init(&self) {
        self.next.store(NIL, Ordering::Relaxed);
        self.ticket.store(0, Ordering::Relaxed);
    }

    /// The link field doubles as the free-list link while a buffer
    /// is not queued.
    pub(crate) fn next(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, v: u32) {
        self.next.store(v, Ordering::Release);
    }
}

/// Resolve an offset to its node header.
///
/// SAFETY: `base` must be the segment base and `off` a valid,
/// node-aligned offset within it.
unsafe fn node<'a>(base: *mut u8, off: u32) -> &'a QueueNode {
    &*(base.add(off as usize) as *const QueueNode)
}

/// The plain MPSC queue. Lives in the shared segment.
#[repr(C)]
pub struct NemesisQueue {
    head: AtomicU32,
    tail: AtomicU32,

    /// Consumer-private; in the struct only so it travels with the
    /// queue. Producers never touch it.
    shadow_head: AtomicU32,

    /// Number of consumers currently asleep (0 or 1 in practice).
    /// Producers skip the condvar entirely while this is zero.
    frustration: AtomicU32,
}

impl NemesisQueue {
    pub fn init(&self) {
        self.head.store(NIL, Ordering::Relaxed);
        self.tail.store(NIL, Ordering::Relaxed);
        self.shadow_head.store(NIL, Ordering::Relaxed);
        self.frustration.store(0, Ordering::Release);
    }

    /// Append the node at `off`. Safe to call from any rank, any
    /// thread.
    ///
    /// SAFETY: as for [`node`]; additionally the node must not be on
    /// any queue.
    pub unsafe fn enqueue(&self, base: *mut u8, off: u32) {
        let n = node(base, off);
        n.next.store(NIL, Ordering::Relaxed);

        // SeqCst pairs with the frustration check in the blocking
        // dequeue: either the producer sees the sleeper or the
        // sleeper's recheck sees this node.
        let prev = self.tail.swap(off, Ordering::SeqCst);

        if prev == NIL {
            self.head.store(off, Ordering::Release);
        } else {
            node(base, prev).next.store(off, Ordering::Release);
        }
    }

    /// True when a producer should signal the segment condvar after
    /// an enqueue.
    pub fn has_sleeper(&self) -> bool {
        !USE_HARD_POLLING && self.frustration.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn sleeper_arrived(&self) {
        self.frustration.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn sleeper_left(&self) {
        self.frustration.fetch_sub(1, Ordering::SeqCst);
    }

    /// Pop the oldest node, or `None` when empty. Single consumer
    /// only.
    ///
    /// SAFETY: as for [`node`]; the caller must be the queue's one
    /// consumer.
    pub unsafe fn dequeue(&self, base: *mut u8) -> Option<u32> {
        let mut cur = self.shadow_head.load(Ordering::Relaxed);

        if cur == NIL {
            cur = self.head.load(Ordering::Acquire);
            if cur == NIL {
                // Either truly empty, or a producer is between its
                // tail exchange and its head store; the caller polls
                // again either way.
                return None;
            }
            self.head.store(NIL, Ordering::Relaxed);
        }

        let n = node(base, cur);
        let next = n.next.load(Ordering::Acquire);

        if next != NIL {
            self.shadow_head.store(next, Ordering::Relaxed);
            return Some(cur);
        }

        self.shadow_head.store(NIL, Ordering::Relaxed);

        if self
            .tail
            .compare_exchange(cur, NIL, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // A producer already exchanged the tail and is about to
            // link us; its store is momentarily outstanding.
            let next = loop {
                let next = n.next.load(Ordering::Acquire);
                if next != NIL {
                    break next;
                }
                std::hint::spin_loop();
            };
            self.head.store(next, Ordering::Relaxed);
        }

        Some(cur)
    }
}

fn pack(ticket: u32, off: u32) -> u64 {
    (u64::from(ticket) << 32) | u64::from(off)
}

fn unpack(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

/// The ordered variant used where the target must observe fragments
/// in sequence-number order regardless of producer interleaving.
/// Tickets start at 1; ticket `t` can only be enqueued after ticket
/// `t - 1`, so the queue itself is the ordering barrier.
#[repr(C)]
pub struct OrderedQueue {
    head: AtomicU32,
    shadow_head: AtomicU32,

    /// `ticket:32 | offset:32` of the most recent enqueue.
    tail: AtomicU64,
}

impl OrderedQueue {
    pub fn init(&self) {
        self.head.store(NIL, Ordering::Relaxed);
        self.shadow_head.store(NIL, Ordering::Relaxed);
        self.tail.store(pack(0, NIL), Ordering::Release);
    }

    /// Append the node at `off` as ticket `ticket`. Spins until its
    /// predecessor ticket has been enqueued.
    ///
    /// SAFETY: as for [`NemesisQueue::enqueue`]; tickets must be
    /// issued densely from 1.
    pub unsafe fn enqueue(&self, base: *mut u8, off: u32, ticket: u32) {
        let n = node(base, off);
        n.next.store(NIL, Ordering::Relaxed);
        n.ticket.store(ticket, Ordering::Relaxed);

        loop {
            let cur = self.tail.load(Ordering::SeqCst);
            let (cur_ticket, cur_off) = unpack(cur);

            if cur_ticket != ticket.wrapping_sub(1) {
                // Our predecessor has not landed yet.
                std::hint::spin_loop();
                continue;
            }

            if self
                .tail
                .compare_exchange(cur, pack(ticket, off), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if cur_off == NIL {
                    self.head.store(off, Ordering::Release);
                } else {
                    node(base, cur_off).next.store(off, Ordering::Release);
                }
                return;
            }
        }
    }

    /// Pop the oldest node, unless its ticket exceeds `upper_bound`.
    /// Single consumer only.
    ///
    /// SAFETY: as for [`NemesisQueue::dequeue`].
    pub unsafe fn dequeue(&self, base: *mut u8, upper_bound: u32) -> Option<u32> {
        let mut cur = self.shadow_head.load(Ordering::Relaxed);

        if cur == NIL {
            cur = self.head.load(Ordering::Acquire);
            if cur == NIL {
                return None;
            }
            self.head.store(NIL, Ordering::Relaxed);
        }

        let n = node(base, cur);

        if n.ticket.load(Ordering::Acquire) > upper_bound {
            // Barrier: leave the node where the next call finds it.
            self.shadow_head.store(cur, Ordering::Relaxed);
            return None;
        }

        let next = n.next.load(Ordering::Acquire);

        if next != NIL {
            self.shadow_head.store(next, Ordering::Relaxed);
            return Some(cur);
        }

        self.shadow_head.store(NIL, Ordering::Relaxed);

        let ticket = n.ticket.load(Ordering::Relaxed);
        if self
            .tail
            .compare_exchange(
                pack(ticket, cur),
                pack(ticket, NIL),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            let next = loop {
                let next = n.next.load(Ordering::Acquire);
                if next != NIL {
                    break next;
                }
                std::hint::spin_loop();
            };
            self.head.store(next, Ordering::Relaxed);
        }

        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE: usize = 16;

    /// A fake segment: contiguous node headers at offsets 0, 16, 32…
    fn segment(nodes: usize) -> Vec<u64> {
        vec![0u64; nodes * NODE / 8]
    }

    fn off(i: usize) -> u32 {
        (i * NODE) as u32
    }

    #[test]
    fn fifo_single_thread() {
        let mut seg = segment(8);
        let base = seg.as_mut_ptr() as *mut u8;

        let q = NemesisQueue {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            shadow_head: AtomicU32::new(0),
            frustration: AtomicU32::new(0),
        };
        q.init();

        unsafe {
            assert_eq!(q.dequeue(base), None);

            for i in 0..8 {
                q.enqueue(base, off(i));
            }
            for i in 0..8 {
                assert_eq!(q.dequeue(base), Some(off(i)));
            }
            assert_eq!(q.dequeue(base), None);
        }
    }

    #[test]
    fn drain_and_refill() {
        let mut seg = segment(4);
        let base = seg.as_mut_ptr() as *mut u8;

        let q = NemesisQueue {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            shadow_head: AtomicU32::new(0),
            frustration: AtomicU32::new(0),
        };
        q.init();

        unsafe {
            q.enqueue(base, off(0));
            assert_eq!(q.dequeue(base), Some(off(0)));
            assert_eq!(q.dequeue(base), None);

            // Nodes are reusable once dequeued:
            q.enqueue(base, off(0));
            q.enqueue(base, off(1));
            assert_eq!(q.dequeue(base), Some(off(0)));
            assert_eq!(q.dequeue(base), Some(off(1)));
        }
    }

    #[test]
    fn mpsc_under_contention() {
        const PER_PRODUCER: usize = 64;
        const PRODUCERS: usize = 4;

        let mut seg = segment(PER_PRODUCER * PRODUCERS);
        let base = seg.as_mut_ptr() as usize;

        let q = std::sync::Arc::new(NemesisQueue {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            shadow_head: AtomicU32::new(0),
            frustration: AtomicU32::new(0),
        });
        q.init();

        let mut threads = Vec::new();
        for p in 0..PRODUCERS {
            let q = q.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    // Each producer owns a disjoint set of nodes.
                    unsafe { q.enqueue(base as *mut u8, off(p * PER_PRODUCER + i)) };
                }
            }));
        }

        let mut seen = Vec::new();
        while seen.len() < PER_PRODUCER * PRODUCERS {
            if let Some(o) = unsafe { q.dequeue(base as *mut u8) } {
                seen.push(o);
            } else {
                std::hint::spin_loop();
            }
        }

        for t in threads {
            t.join().unwrap();
        }

        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), PER_PRODUCER * PRODUCERS);
    }

    #[test]
    fn ordered_respects_tickets_and_bound() {
        let mut seg = segment(8);
        let base = seg.as_mut_ptr() as *mut u8;

        let q = OrderedQueue {
            head: AtomicU32::new(0),
            shadow_head: AtomicU32::new(0),
            tail: AtomicU64::new(0),
        };
        q.init();

        unsafe {
            for i in 0..6 {
                q.enqueue(base, off(i), i as u32 + 1);
            }

            // Barrier at ticket 3: tickets 4..6 stay put.
            assert_eq!(q.dequeue(base, 3), Some(off(0)));
            assert_eq!(q.dequeue(base, 3), Some(off(1)));
            assert_eq!(q.dequeue(base, 3), Some(off(2)));
            assert_eq!(q.dequeue(base, 3), None);
            assert_eq!(q.dequeue(base, 3), None);

            // Raise the bound and the rest drain in ticket order:
            assert_eq!(q.dequeue(base, u32::MAX), Some(off(3)));
            assert_eq!(q.dequeue(base, u32::MAX), Some(off(4)));
            assert_eq!(q.dequeue(base, u32::MAX), Some(off(5)));
            assert_eq!(q.dequeue(base, u32::MAX), None);
        }
    }

    #[test]
    fn ordered_concurrent_producers_stay_ordered() {
        const COUNT: usize = 64;

        let mut seg = segment(COUNT);
        let base = seg.as_mut_ptr() as usize;

        let q = std::sync::Arc::new(OrderedQueue {
            head: AtomicU32::new(0),
            shadow_head: AtomicU32::new(0),
            tail: AtomicU64::new(0),
        });
        q.init();

        // Two producers race, but each node's ticket fixes its place.
        let ticket = std::sync::Arc::new(AtomicU32::new(1));
        let mut threads = Vec::new();
        for _ in 0..2 {
            let q = q.clone();
            let ticket = ticket.clone();
            threads.push(std::thread::spawn(move || loop {
                let t = ticket.fetch_add(1, Ordering::SeqCst);
                if t > COUNT as u32 {
                    break;
                }
                unsafe { q.enqueue(base as *mut u8, off(t as usize - 1), t) };
            }));
        }

        let mut expect = 1u32;
        while expect <= COUNT as u32 {
            if let Some(o) = unsafe { q.dequeue(base as *mut u8, u32::MAX) } {
                // Dequeues observe strictly increasing tickets.
                assert_eq!(o, off(expect as usize - 1));
                expect += 1;
            } else {
                std::hint::spin_loop();
            }
        }

        for t in threads {
            t.join().unwrap();
        }
    }
}
