// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Idempotent, thread-unsafe sequential reference implementations.
//!
//! The checker replays candidate permutations of the recorded history
//! against these; a replay step succeeds iff the recorded return value
//! matches what the reference produces. Removals from empty structures
//! return −1 throughout.

use exec::conf::ProgramKind;
use std::collections::{BTreeSet, VecDeque};

/// Which end of the deque an operation works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Front,
    Back,
}

/// A work-stealing queue reference. The variants differ only in which end
/// `take` and `steal` remove from; `put` always appends at the back.
#[derive(Debug, Clone)]
pub struct WsqRef {
    q: VecDeque<i64>,
    take: End,
    steal: End,
}

impl WsqRef {
    fn with(take: End, steal: End) -> WsqRef {
        WsqRef {
            q: VecDeque::new(),
            take,
            steal,
        }
    }

    /// Chase-Lev: owner takes from the back, thieves steal from the front.
    /// THE and anchor queues share these semantics.
    pub fn chase() -> WsqRef {
        WsqRef::with(End::Back, End::Front)
    }

    /// LIFO: both ends of the protocol pop the most recent task.
    pub fn lifo() -> WsqRef {
        WsqRef::with(End::Back, End::Back)
    }

    /// FIFO: both pop the oldest task.
    pub fn fifo() -> WsqRef {
        WsqRef::with(End::Front, End::Front)
    }

    /// Append a task; always succeeds.
    pub fn put(&mut self, task: i64) -> i64 {
        self.q.push_back(task);
        1
    }

    fn remove(&mut self, end: End) -> i64 {
        let v = match end {
            End::Back => self.q.pop_back(),
            End::Front => self.q.pop_front(),
        };
        v.unwrap_or(-1)
    }

    /// The owner's removal.
    pub fn take(&mut self) -> i64 {
        self.remove(self.take)
    }

    /// A thief's removal.
    pub fn steal(&mut self) -> i64 {
        self.remove(self.steal)
    }
}

/// The Michael-Scott queue reference (MS2 and MSN share it).
#[derive(Debug, Clone, Default)]
pub struct QueueRef {
    q: VecDeque<i64>,
}

impl QueueRef {
    /// Enqueue; always succeeds.
    pub fn enqueue(&mut self, task: i64) -> i64 {
        self.q.push_front(task);
        1
    }

    /// Dequeue the oldest element, −1 when empty.
    pub fn dequeue(&mut self) -> i64 {
        self.q.pop_back().unwrap_or(-1)
    }
}

/// The Snark double-ended queue reference.
#[derive(Debug, Clone, Default)]
pub struct DequeRef {
    q: VecDeque<i64>,
}

impl DequeRef {
    /// Push on the left end; always succeeds.
    pub fn add_left(&mut self, task: i64) -> i64 {
        self.q.push_front(task);
        1
    }

    /// Push on the right end; always succeeds.
    pub fn add_right(&mut self, task: i64) -> i64 {
        self.q.push_back(task);
        1
    }

    /// Pop the left end, −1 when empty.
    pub fn remove_left(&mut self) -> i64 {
        self.q.pop_front().unwrap_or(-1)
    }

    /// Pop the right end, −1 when empty.
    pub fn remove_right(&mut self) -> i64 {
        self.q.pop_back().unwrap_or(-1)
    }
}

/// The linked-set reference (lazy list and Harris share it).
#[derive(Debug, Clone, Default)]
pub struct LinkSetRef {
    s: BTreeSet<i64>,
}

impl LinkSetRef {
    /// Insert; reports 1 whether or not the key was present.
    pub fn add(&mut self, key: i64) -> i64 {
        self.s.insert(key);
        1
    }

    /// Membership test.
    pub fn contains(&self, key: i64) -> i64 {
        self.s.contains(&key) as i64
    }

    /// Remove; reports whether the key was present.
    pub fn remove(&mut self, key: i64) -> i64 {
        self.s.remove(&key) as i64
    }
}

/// The lock-free malloc reference: live allocations must not overlap and
/// frees must target a known base.
#[derive(Debug, Clone, Default)]
pub struct MallocRef {
    allocs: Vec<(u64, u64)>,
}

impl MallocRef {
    /// Validate and record an allocation of `size` bytes at `start`.
    /// False when either endpoint lands inside a live allocation.
    pub fn malloc(&mut self, start: u64, size: u64) -> bool {
        let finish = start.wrapping_add(size);
        for &(base, len) in &self.allocs {
            if start >= base && start <= base + len {
                return false;
            }
            if finish >= base && finish <= base + len {
                return false;
            }
        }
        self.allocs.push((start, size));
        true
    }

    /// Validate and drop an allocation; false for an unknown base.
    pub fn free(&mut self, addr: u64) -> bool {
        match self.allocs.iter().position(|&(base, _)| base == addr) {
            Some(i) => {
                self.allocs.remove(i);
                true
            }
            None => false,
        }
    }
}

/// One reference instance, selected by the configured program.
#[derive(Debug, Clone)]
pub enum Reference {
    /// A work-stealing queue variant.
    Wsq(WsqRef),
    /// The Michael-Scott queue.
    Queue(QueueRef),
    /// The Snark deque.
    Deque(DequeRef),
    /// The linked set.
    LinkSet(LinkSetRef),
    /// Lock-free malloc.
    Malloc(MallocRef),
}

impl Reference {
    /// The reference for a configured program; `None` when the program has
    /// no sequential specification (the skip list).
    pub fn for_program(program: ProgramKind) -> Option<Reference> {
        Some(match program {
            ProgramKind::WsqChase | ProgramKind::WsqThe | ProgramKind::WsqAnchor => {
                Reference::Wsq(WsqRef::chase())
            }
            ProgramKind::WsqLifo => Reference::Wsq(WsqRef::lifo()),
            ProgramKind::WsqFifo => Reference::Wsq(WsqRef::fifo()),
            ProgramKind::Queue => Reference::Queue(QueueRef::default()),
            ProgramKind::Deque => Reference::Deque(DequeRef::default()),
            ProgramKind::LinkSet => Reference::LinkSet(LinkSetRef::default()),
            ProgramKind::LfMalloc => Reference::Malloc(MallocRef::default()),
            ProgramKind::SkipList => return None,
        })
    }

    /// Apply one recorded operation and report whether the recorded return
    /// value is the one the reference produces. Unrecognized method names
    /// are ignored.
    pub fn apply(&mut self, func: &str, args: &[i64], ret: i64) -> bool {
        let arg = || args.last().copied().unwrap_or(0);
        match self {
            Reference::Wsq(wsq) => match func {
                "wsq_put" => wsq.put(arg()) == ret,
                "wsq_take" => wsq.take() == ret,
                "wsq_steal" => wsq.steal() == ret,
                _ => true,
            },
            Reference::Queue(q) => match func {
                "queue_enqueue" => q.enqueue(arg()) == ret,
                "queue_dequeue" => q.dequeue() == ret,
                _ => true,
            },
            Reference::Deque(d) => match func {
                "deque_add_left" => d.add_left(arg()) == ret,
                "deque_add_right" => d.add_right(arg()) == ret,
                "deque_remove_left" => d.remove_left() == ret,
                "deque_remove_right" => d.remove_right() == ret,
                _ => true,
            },
            Reference::LinkSet(s) => match func {
                "linkset_add" => s.add(arg()) == ret,
                "linkset_contains" => s.contains(arg()) == ret,
                "linkset_remove" => s.remove(arg()) == ret,
                _ => true,
            },
            Reference::Malloc(m) => match func {
                "mmalloc" => {
                    let size = args.first().copied().unwrap_or(0) as u64;
                    m.malloc(ret as u64, size)
                }
                "mfree" => m.free(args.first().copied().unwrap_or(0) as u64),
                _ => true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chase_ends() {
        let mut w = WsqRef::chase();
        w.put(1);
        w.put(2);
        w.put(3);
        assert_eq!(w.steal(), 1);
        assert_eq!(w.take(), 3);
        assert_eq!(w.take(), 2);
        assert_eq!(w.take(), -1);
        assert_eq!(w.steal(), -1);
    }

    #[test]
    fn test_lifo_and_fifo() {
        let mut l = WsqRef::lifo();
        l.put(1);
        l.put(2);
        assert_eq!(l.steal(), 2);
        assert_eq!(l.take(), 1);

        let mut f = WsqRef::fifo();
        f.put(1);
        f.put(2);
        assert_eq!(f.take(), 1);
        assert_eq!(f.steal(), 2);
    }

    #[test]
    fn test_queue_order() {
        let mut q = QueueRef::default();
        q.enqueue(1);
        q.enqueue(2);
        assert_eq!(q.dequeue(), 1);
        assert_eq!(q.dequeue(), 2);
        assert_eq!(q.dequeue(), -1);
    }

    #[test]
    fn test_deque_ends() {
        let mut d = DequeRef::default();
        d.add_left(1);
        d.add_right(2);
        d.add_left(3);
        assert_eq!(d.remove_right(), 2);
        assert_eq!(d.remove_left(), 3);
        assert_eq!(d.remove_left(), 1);
        assert_eq!(d.remove_left(), -1);
    }

    #[test]
    fn test_linkset() {
        let mut s = LinkSetRef::default();
        assert_eq!(s.contains(3), 0);
        assert_eq!(s.add(3), 1);
        assert_eq!(s.contains(3), 1);
        assert_eq!(s.remove(3), 1);
        assert_eq!(s.remove(3), 0);
    }

    #[test]
    fn test_malloc_overlap() {
        let mut m = MallocRef::default();
        assert!(m.malloc(1000, 100));
        // a second allocation inside the first is invalid
        assert!(!m.malloc(1050, 10));
        // ending inside the first is invalid too
        assert!(!m.malloc(950, 60));
        assert!(m.malloc(2000, 100));
        assert!(m.free(1000));
        assert!(!m.free(1234));
        // freed space can be reused
        assert!(m.malloc(1050, 10));
    }
}
