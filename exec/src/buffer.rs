// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Per-thread store buffers.
//!
//! TSO keeps one FIFO of pending stores per thread. PSO keeps one FIFO per
//! (thread, address), plus a shared address → type oracle: all pending
//! values at one address share the type of the last store there.

use crate::thread::ThreadId;
use ir::types::Ty;
use ir::value::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// A pending TSO store.
#[derive(Debug, Clone)]
pub struct TsoEntry {
    /// The stored-to virtual address.
    pub addr: u64,
    /// The pending value.
    pub value: Value,
    /// The store's IR type.
    pub ty: Ty,
}

/// All threads' store buffers, for both memory models.
#[derive(Debug, Clone, Default)]
pub struct StoreBuffers {
    tso: BTreeMap<ThreadId, VecDeque<TsoEntry>>,
    pso: BTreeMap<ThreadId, BTreeMap<u64, VecDeque<Value>>>,
    pso_types: HashMap<u64, Ty>,
}

impl StoreBuffers {
    /// Append a store to a thread's TSO FIFO.
    pub fn tso_push(&mut self, t: ThreadId, entry: TsoEntry) {
        self.tso.entry(t).or_default().push_back(entry);
    }

    /// The newest pending value for `addr` in `t`'s TSO FIFO.
    pub fn tso_lookup(&self, t: ThreadId, addr: u64) -> Option<&Value> {
        self.tso
            .get(&t)?
            .iter()
            .rev()
            .find(|e| e.addr == addr)
            .map(|e| &e.value)
    }

    /// The newest pending entry for `addr`, with its type (for memcpy32).
    pub fn tso_lookup_entry(&self, t: ThreadId, addr: u64) -> Option<&TsoEntry> {
        self.tso.get(&t)?.iter().rev().find(|e| e.addr == addr)
    }

    /// Pop the oldest pending TSO store of `t`.
    pub fn tso_pop(&mut self, t: ThreadId) -> Option<TsoEntry> {
        self.tso.get_mut(&t)?.pop_front()
    }

    /// Whether `t` has pending TSO stores.
    pub fn tso_has_pending(&self, t: ThreadId) -> bool {
        self.tso.get(&t).is_some_and(|q| !q.is_empty())
    }

    /// Append a store to a thread's PSO queue for `addr`, updating the type
    /// oracle.
    pub fn pso_push(&mut self, t: ThreadId, addr: u64, value: Value, ty: Ty) {
        self.pso_types.insert(addr, ty);
        self.pso
            .entry(t)
            .or_default()
            .entry(addr)
            .or_default()
            .push_back(value);
    }

    /// The newest pending value for `addr` in `t`'s PSO queue.
    pub fn pso_newest(&self, t: ThreadId, addr: u64) -> Option<&Value> {
        self.pso.get(&t)?.get(&addr)?.back()
    }

    /// Pop the oldest pending value for `(t, addr)` with its type.
    pub fn pso_pop(&mut self, t: ThreadId, addr: u64) -> Option<(Value, Ty)> {
        let v = self.pso.get_mut(&t)?.get_mut(&addr)?.pop_front()?;
        let ty = self.pso_types.get(&addr).cloned()?;
        Some((v, ty))
    }

    /// The type oracle entry for `addr`.
    pub fn pso_ty(&self, addr: u64) -> Option<&Ty> {
        self.pso_types.get(&addr)
    }

    /// Whether `(t, addr)` has pending stores.
    pub fn pso_queue_nonempty(&self, t: ThreadId, addr: u64) -> bool {
        self.pso
            .get(&t)
            .and_then(|m| m.get(&addr))
            .is_some_and(|q| !q.is_empty())
    }

    /// Addresses with pending stores in `t`'s PSO buffers, in address order.
    pub fn pso_nonempty_addrs(&self, t: ThreadId) -> Vec<u64> {
        match self.pso.get(&t) {
            Some(m) => m
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(a, _)| *a)
                .collect(),
            None => vec![],
        }
    }

    /// Whether `t` has pending PSO stores at any address.
    pub fn pso_has_pending(&self, t: ThreadId) -> bool {
        self.pso
            .get(&t)
            .is_some_and(|m| m.values().any(|q| !q.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::value::IntValue;

    fn iv(n: i128) -> Value {
        Value::Int(IntValue::from_i128(32, n))
    }

    #[test]
    fn test_tso_fifo_and_lookup() {
        let mut b = StoreBuffers::default();
        let t = ThreadId(1);
        b.tso_push(
            t,
            TsoEntry {
                addr: 100,
                value: iv(1),
                ty: Ty::i32(),
            },
        );
        b.tso_push(
            t,
            TsoEntry {
                addr: 200,
                value: iv(2),
                ty: Ty::i32(),
            },
        );
        b.tso_push(
            t,
            TsoEntry {
                addr: 100,
                value: iv(3),
                ty: Ty::i32(),
            },
        );
        // lookup sees the newest matching entry
        assert_eq!(b.tso_lookup(t, 100), Some(&iv(3)));
        assert_eq!(b.tso_lookup(t, 200), Some(&iv(2)));
        assert_eq!(b.tso_lookup(ThreadId(2), 100), None);
        // pops come oldest-first
        assert_eq!(b.tso_pop(t).unwrap().value, iv(1));
        assert_eq!(b.tso_pop(t).unwrap().value, iv(2));
        assert_eq!(b.tso_lookup(t, 100), Some(&iv(3)));
        assert!(b.tso_has_pending(t));
        b.tso_pop(t);
        assert!(!b.tso_has_pending(t));
    }

    #[test]
    fn test_pso_per_address_fifos() {
        let mut b = StoreBuffers::default();
        let t = ThreadId(1);
        b.pso_push(t, 100, iv(1), Ty::i32());
        b.pso_push(t, 100, iv(2), Ty::i32());
        b.pso_push(t, 200, iv(9), Ty::i32());
        // loads see the newest per address
        assert_eq!(b.pso_newest(t, 100), Some(&iv(2)));
        assert_eq!(b.pso_newest(t, 200), Some(&iv(9)));
        // flushes pop oldest per address
        assert_eq!(b.pso_pop(t, 100).unwrap().0, iv(1));
        assert_eq!(b.pso_pop(t, 100).unwrap().0, iv(2));
        assert!(b.pso_pop(t, 100).is_none());
        assert_eq!(b.pso_nonempty_addrs(t), vec![200]);
        assert!(b.pso_has_pending(t));
        b.pso_pop(t, 200);
        assert!(!b.pso_has_pending(t));
    }
}
