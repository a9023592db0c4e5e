// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Deriving fence constraints from a bad trace.
//!
//! The filtered shared trace is partitioned by thread and cut into
//! segments at label-0 entries (fences, spawn/join, the end-of-run drain):
//! a fence already orders everything across it, so constraint generation
//! runs per segment. Replaying a segment against a local store buffer
//! yields the store→load (TSO) and store→store (PSO) pairs whose fences
//! would have forbidden the observed interleaving; each distinct pair gets
//! one SAT literal, and a bad run contributes the disjunction of the
//! literals it exhibits as one clause.

use exec::conf::Wmm;
use exec::rwlog::{RwEvent, RwKind};
use exec::thread::ThreadId;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use thiserror::Error;

/// `(store label, load-or-store label)`.
pub type Pair = (u32, u32);

/// A constraint-generation failure.
#[derive(Debug, PartialEq, Error)]
pub enum ConstraintError {
    /// There is no fence that repairs an algorithm already broken under SC.
    #[error("cannot derive fence constraints without a weak memory model")]
    NoWeakModel,
}

/// The literal assignment: a global counter plus one map per pair kind.
/// store→load pairs select `membar_sl` sites, store→store pairs select
/// `membar_ss` sites.
#[derive(Debug, Clone)]
pub struct LitMaps {
    next_lit: i32,
    sl: HashMap<Pair, i32>,
    ss: HashMap<Pair, i32>,
}

impl Default for LitMaps {
    fn default() -> LitMaps {
        LitMaps {
            next_lit: 1,
            sl: HashMap::new(),
            ss: HashMap::new(),
        }
    }
}

impl LitMaps {
    /// The literal for a store→load pair, assigning a fresh one on first
    /// sight.
    pub fn lit_sl(&mut self, pair: Pair) -> i32 {
        let next = &mut self.next_lit;
        *self.sl.entry(pair).or_insert_with(|| {
            let lit = *next;
            *next += 1;
            lit
        })
    }

    /// The literal for a store→store pair.
    pub fn lit_ss(&mut self, pair: Pair) -> i32 {
        let next = &mut self.next_lit;
        *self.ss.entry(pair).or_insert_with(|| {
            let lit = *next;
            *next += 1;
            lit
        })
    }

    /// Reverse lookup among store→load pairs.
    pub fn sl_pair_of(&self, lit: i32) -> Option<Pair> {
        self.sl.iter().find(|(_, l)| **l == lit).map(|(p, _)| *p)
    }

    /// Reverse lookup among store→store pairs.
    pub fn ss_pair_of(&self, lit: i32) -> Option<Pair> {
        self.ss.iter().find(|(_, l)| **l == lit).map(|(p, _)| *p)
    }

    /// Number of distinct literals assigned so far.
    pub fn total(&self) -> i32 {
        self.next_lit - 1
    }

    /// Drop all assignments and restart the counter (between rounds).
    pub fn reset(&mut self) {
        *self = LitMaps::default();
    }
}

/// Derive the clause for one bad trace: the set of literals for every pair
/// any of its segments exhibits.
pub fn clause_for_trace(
    trace: &[RwEvent],
    wmm: Wmm,
    maps: &mut LitMaps,
) -> Result<BTreeSet<i32>, ConstraintError> {
    if wmm == Wmm::None {
        return Err(ConstraintError::NoWeakModel);
    }

    // total order → one partial order per thread
    let mut per_thread: BTreeMap<ThreadId, Vec<RwEvent>> = BTreeMap::new();
    for e in trace {
        per_thread.entry(e.thread).or_default().push(*e);
    }

    let mut clause = BTreeSet::new();
    for events in per_thread.values() {
        let mut front = 0;
        loop {
            while front < events.len() && events[front].label == 0 {
                front += 1;
            }
            if front == events.len() {
                break;
            }
            let mut back = front;
            while back < events.len() && events[back].label != 0 {
                back += 1;
            }
            segment_clauses(&events[front..back], wmm, maps, &mut clause);
            front = back;
        }
    }
    Ok(clause)
}

fn segment_clauses(
    segment: &[RwEvent],
    wmm: Wmm,
    maps: &mut LitMaps,
    clause: &mut BTreeSet<i32>,
) {
    match wmm {
        Wmm::Tso => {
            let mut sb: VecDeque<RwEvent> = VecDeque::new();
            for e in segment {
                match e.kind {
                    RwKind::Write => sb.push_back(*e),
                    RwKind::Read => {
                        for w in &sb {
                            if w.addr != e.addr {
                                clause.insert(maps.lit_sl((w.label as u32, e.label as u32)));
                            }
                        }
                    }
                    RwKind::FlushRandomTso => {
                        sb.pop_front();
                    }
                    _ => println!("UNRECOGNIZED record type!"),
                }
            }
        }
        Wmm::Pso => {
            let mut vsb: BTreeMap<u64, VecDeque<RwEvent>> = BTreeMap::new();
            for e in segment {
                match e.kind {
                    RwKind::Read => {
                        for (addr, q) in &vsb {
                            if *addr == e.addr {
                                continue;
                            }
                            for w in q {
                                clause.insert(maps.lit_sl((w.label as u32, e.label as u32)));
                            }
                        }
                    }
                    RwKind::Write => {
                        for (addr, q) in &vsb {
                            if *addr == e.addr {
                                continue;
                            }
                            for w in q {
                                clause.insert(maps.lit_ss((w.label as u32, e.label as u32)));
                            }
                        }
                        vsb.entry(e.addr).or_default().push_back(*e);
                    }
                    RwKind::FlushRandomPso => {
                        if let Some(q) = vsb.get_mut(&e.addr) {
                            q.pop_front();
                        }
                    }
                    RwKind::FlushCasPso => {
                        if let Some(q) = vsb.get_mut(&e.addr) {
                            q.clear();
                        }
                    }
                    _ => println!("UNRECOGNIZED record type!"),
                }
            }
        }
        Wmm::None => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(t: u32, addr: u64, label: i32) -> RwEvent {
        RwEvent {
            thread: ThreadId(t),
            kind: RwKind::Write,
            addr,
            value: 0,
            label,
        }
    }

    fn read(t: u32, addr: u64, label: i32) -> RwEvent {
        RwEvent {
            thread: ThreadId(t),
            kind: RwKind::Read,
            addr,
            value: 0,
            label,
        }
    }

    fn flush_tso(t: u32) -> RwEvent {
        RwEvent {
            thread: ThreadId(t),
            kind: RwKind::FlushRandomTso,
            addr: 0,
            value: 0,
            label: -1,
        }
    }

    fn fence(t: u32) -> RwEvent {
        RwEvent {
            thread: ThreadId(t),
            kind: RwKind::FlushFence,
            addr: 0,
            value: 0,
            label: 0,
        }
    }

    #[test]
    fn test_tso_store_load_pair() {
        // store x then load y with the store still buffered: one pair
        let trace = [write(1, 100, 5), read(1, 200, 8)];
        let mut maps = LitMaps::default();
        let clause = clause_for_trace(&trace, Wmm::Tso, &mut maps).unwrap();
        assert_eq!(clause.len(), 1);
        assert_eq!(maps.sl_pair_of(1), Some((5, 8)));
    }

    #[test]
    fn test_tso_same_location_is_not_a_pair() {
        let trace = [write(1, 100, 5), read(1, 100, 8)];
        let mut maps = LitMaps::default();
        let clause = clause_for_trace(&trace, Wmm::Tso, &mut maps).unwrap();
        assert!(clause.is_empty());
    }

    #[test]
    fn test_tso_flush_retires_oldest_store() {
        // the random flush drains the store before the load sees it
        let trace = [write(1, 100, 5), flush_tso(1), read(1, 200, 8)];
        let mut maps = LitMaps::default();
        let clause = clause_for_trace(&trace, Wmm::Tso, &mut maps).unwrap();
        assert!(clause.is_empty());
    }

    #[test]
    fn test_fence_splits_segments() {
        // a fence between store and load means no constraint
        let trace = [write(1, 100, 5), fence(1), read(1, 200, 8)];
        let mut maps = LitMaps::default();
        let clause = clause_for_trace(&trace, Wmm::Tso, &mut maps).unwrap();
        assert!(clause.is_empty());
    }

    #[test]
    fn test_threads_are_independent() {
        // thread 2's load does not pair with thread 1's store
        let trace = [write(1, 100, 5), read(2, 200, 8), read(1, 200, 9)];
        let mut maps = LitMaps::default();
        let clause = clause_for_trace(&trace, Wmm::Tso, &mut maps).unwrap();
        assert_eq!(clause.len(), 1);
        assert_eq!(maps.sl_pair_of(1), Some((5, 9)));
    }

    #[test]
    fn test_duplicate_pairs_share_a_literal() {
        let trace = [
            write(1, 100, 5),
            read(1, 200, 8),
            read(1, 200, 8),
            write(1, 300, 6),
            read(1, 200, 8),
        ];
        let mut maps = LitMaps::default();
        let clause = clause_for_trace(&trace, Wmm::Tso, &mut maps).unwrap();
        // (5,8) once plus (6,8)
        assert_eq!(clause.len(), 2);
        assert_eq!(maps.total(), 2);
    }

    #[test]
    fn test_pso_store_store_and_store_load() {
        let trace = [
            write(1, 100, 5),
            write(1, 200, 6), // store→store (5,6)
            read(1, 300, 9),  // store→load (5,9) and (6,9)
        ];
        let mut maps = LitMaps::default();
        let clause = clause_for_trace(&trace, Wmm::Pso, &mut maps).unwrap();
        assert_eq!(clause.len(), 3);
        assert!(maps.ss_pair_of(1) == Some((5, 6)));
        assert_eq!(maps.sl_pair_of(2), Some((5, 9)));
        assert_eq!(maps.sl_pair_of(3), Some((6, 9)));
    }

    #[test]
    fn test_pso_cas_flush_drains_one_queue() {
        let cas_flush = RwEvent {
            thread: ThreadId(1),
            kind: RwKind::FlushCasPso,
            addr: 100,
            value: 0,
            label: -1,
        };
        let trace = [write(1, 100, 5), cas_flush, read(1, 300, 9)];
        let mut maps = LitMaps::default();
        let clause = clause_for_trace(&trace, Wmm::Pso, &mut maps).unwrap();
        assert!(clause.is_empty());
    }

    #[test]
    fn test_sc_traces_cannot_be_repaired() {
        let trace = [write(1, 100, 5)];
        let mut maps = LitMaps::default();
        assert_eq!(
            clause_for_trace(&trace, Wmm::None, &mut maps),
            Err(ConstraintError::NoWeakModel)
        );
    }
}
