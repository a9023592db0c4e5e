// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! The shared read/write log: a total order over every non-stack access,
//! every flush, and the spawn/join markers.
//!
//! Labels carry the constraint generator's segmentation convention: READ
//! and WRITE entries carry the originating instruction's label, fences and
//! spawn/join carry 0 (segment terminators), and the random/CAS flushes
//! that stay inside a segment carry −1.

use crate::thread::ThreadId;
use std::collections::HashMap;

/// The kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwKind {
    /// A shared load.
    Read,
    /// A shared store (into the buffer under TSO/PSO).
    Write,
    /// A membar_sl/membar_ss drain.
    FlushFence,
    /// The end-of-run drain, one per thread.
    FlushInstr,
    /// The full-buffer drain a TSO CAS performs.
    FlushCasTso,
    /// The per-address drain a PSO CAS performs.
    FlushCasPso,
    /// A scheduler-chosen single flush under TSO.
    FlushRandomTso,
    /// A scheduler-chosen single flush under PSO.
    FlushRandomPso,
    /// Thread creation.
    Spawn,
    /// The completed join.
    Join,
}

/// One log entry. `addr` and `value` are meaningful for reads, writes and
/// the per-address flushes; elsewhere they are zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RwEvent {
    /// The acting thread (for random flushes, the thread whose buffer was
    /// flushed).
    pub thread: ThreadId,
    /// Entry kind.
    pub kind: RwKind,
    /// The touched location.
    pub addr: u64,
    /// The integer image of the value read or written.
    pub value: u64,
    /// Segmentation label; see the module docs.
    pub label: i32,
}

/// The ordered shared-access log.
#[derive(Debug, Clone)]
pub struct RwLog {
    events: Vec<RwEvent>,
    enabled: bool,
}

impl RwLog {
    /// A log; disabled logs record nothing and the constraint generator
    /// sees nothing.
    pub fn new(enabled: bool) -> RwLog {
        RwLog {
            events: vec![],
            enabled,
        }
    }

    /// Record a read or write at `addr`.
    pub fn record_access(
        &mut self,
        kind: RwKind,
        thread: ThreadId,
        addr: u64,
        value: u64,
        label: i32,
    ) {
        assert!(matches!(kind, RwKind::Read | RwKind::Write));
        if self.enabled {
            self.events.push(RwEvent {
                thread,
                kind,
                addr,
                value,
                label,
            });
        }
    }

    /// Record a fence, end-of-run flush, TSO CAS flush, spawn or join.
    pub fn record_sync(&mut self, kind: RwKind, thread: ThreadId) {
        assert!(matches!(
            kind,
            RwKind::FlushFence
                | RwKind::FlushInstr
                | RwKind::FlushCasTso
                | RwKind::Spawn
                | RwKind::Join
        ));
        if self.enabled {
            self.events.push(RwEvent {
                thread,
                kind,
                addr: 0,
                value: 0,
                label: 0,
            });
        }
    }

    /// Record a random TSO flush of `thread`'s buffer.
    pub fn record_flush_tso(&mut self, thread: ThreadId) {
        if self.enabled {
            self.events.push(RwEvent {
                thread,
                kind: RwKind::FlushRandomTso,
                addr: 0,
                value: 0,
                label: -1,
            });
        }
    }

    /// Record a per-address PSO flush (random or CAS) of `thread`'s queue.
    pub fn record_flush_pso(&mut self, kind: RwKind, thread: ThreadId, addr: u64) {
        assert!(matches!(
            kind,
            RwKind::FlushRandomPso | RwKind::FlushCasPso
        ));
        if self.enabled {
            self.events.push(RwEvent {
                thread,
                kind,
                addr,
                value: 0,
                label: -1,
            });
        }
    }

    /// All recorded events.
    pub fn events(&self) -> &[RwEvent] {
        &self.events
    }

    /// The filtered shared trace: entries between SPAWN and the completed
    /// JOIN. Every read and write in that region counts as shared (sharing
    /// is over-approximated so that accesses made inside intrinsics still
    /// contribute constraints); flushes and fences in the region are kept,
    /// the spawn/join markers themselves are not.
    pub fn shared(&self) -> Vec<RwEvent> {
        let mut threads_at: HashMap<u64, std::collections::HashSet<ThreadId>> = HashMap::new();
        for e in &self.events {
            if matches!(e.kind, RwKind::Read | RwKind::Write) {
                threads_at.entry(e.addr).or_default().insert(e.thread);
            }
        }

        let mut in_region = false;
        let mut out = vec![];
        for e in &self.events {
            match e.kind {
                RwKind::Spawn => {
                    in_region = true;
                    continue;
                }
                RwKind::Join => {
                    in_region = false;
                    continue;
                }
                _ => {}
            }
            if !in_region {
                continue;
            }
            match e.kind {
                RwKind::Read | RwKind::Write => {
                    if !threads_at[&e.addr].is_empty() {
                        out.push(*e);
                    }
                }
                _ => out.push(*e),
            }
        }
        out
    }

    /// Print the filtered shared trace in the tool's diagnostic format.
    pub fn print_shared(&self) {
        println!("RECORDED SHARED READs AND WRITEs");
        for e in self.shared() {
            match e.kind {
                RwKind::Read => println!(
                    "READ at {:#x} of value {} by thread {} with label {}",
                    e.addr, e.value, e.thread, e.label
                ),
                RwKind::Write => println!(
                    "WRITE at {:#x} of value {} by thread {} with label {}",
                    e.addr, e.value, e.thread, e.label
                ),
                _ => println!(
                    "Flush {:?} by thread {} with label {}",
                    e.kind, e.thread, e.label
                ),
            }
        }
        println!("END OF RECORDED SHARED READs AND WRITEs");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_log_records_nothing() {
        let mut log = RwLog::new(false);
        log.record_access(RwKind::Write, ThreadId(1), 100, 1, 5);
        log.record_sync(RwKind::Spawn, ThreadId(1));
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_shared_keeps_only_the_spawn_join_region() {
        let mut log = RwLog::new(true);
        let t1 = ThreadId(1);
        let t2 = ThreadId(2);
        // setup before spawn is not shared
        log.record_access(RwKind::Write, t1, 100, 0, 1);
        log.record_sync(RwKind::Spawn, t1);
        log.record_access(RwKind::Write, t1, 100, 7, 2);
        log.record_access(RwKind::Read, t2, 100, 7, 9);
        log.record_flush_tso(t1);
        log.record_sync(RwKind::Join, t1);
        // teardown after join is not shared
        log.record_access(RwKind::Read, t1, 100, 7, 3);

        let shared = log.shared();
        assert_eq!(shared.len(), 3);
        assert_eq!(shared[0].label, 2);
        assert_eq!(shared[1].label, 9);
        assert_eq!(shared[2].kind, RwKind::FlushRandomTso);
    }

    #[test]
    fn test_single_thread_accesses_in_region_still_count() {
        // sharing is over-approximated: an address only one thread touches
        // is kept when the access happens inside the region
        let mut log = RwLog::new(true);
        log.record_sync(RwKind::Spawn, ThreadId(1));
        log.record_access(RwKind::Write, ThreadId(1), 500, 42, 4);
        log.record_sync(RwKind::Join, ThreadId(1));
        assert_eq!(log.shared().len(), 1);
    }
}
