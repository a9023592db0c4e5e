// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! The linearizability / SC checker.
//!
//! Matches every RETURN in the history to its call, then enumerates the
//! distinct permutations of the per-thread call sequence in lexicographic
//! order. Under SC a permutation only has to replay correctly against the
//! sequential reference; under linearizability it must additionally
//! respect real-time order. The first accepting permutation wins.

use crate::spec::Reference;
use exec::conf::{ProgramKind, Property};
use exec::history::{EventKind, History};
use exec::thread::ThreadId;
use std::collections::HashMap;
use thiserror::Error;

/// The permutation count is factorial in the history length; refuse to
/// enumerate past this many completed calls.
pub const MAX_CALLS: usize = 20;

/// A call matched with its return.
#[derive(Debug, Clone)]
pub struct Completed {
    /// Index of the CALL event in the history.
    pub call_idx: usize,
    /// Index of the matching RETURN event.
    pub ret_idx: usize,
    /// The method name.
    pub func: String,
    /// The invoking thread.
    pub thread: ThreadId,
    /// The recorded arguments.
    pub args: Vec<i64>,
    /// The recorded return value.
    pub ret: i64,
}

/// Why a history could not be checked at all (as opposed to failing the
/// check).
#[derive(Debug, PartialEq, Error)]
pub enum CheckError {
    /// The configured program has no sequential reference.
    #[error("no sequential reference for the configured program")]
    UndefinedProgram,
    /// A RETURN had no preceding CALL on its thread.
    #[error("history has a return without a call on thread {0}")]
    MalformedHistory(ThreadId),
    /// Enumerating this history would be infeasible.
    #[error("history has {0} completed calls; the checker enumerates at most {MAX_CALLS}")]
    HistoryTooLong(usize),
}

/// Pair every RETURN with its call, in recording order of the returns.
pub fn completed_calls(history: &History) -> Result<Vec<Completed>, CheckError> {
    let events = history.events();
    let mut open: HashMap<ThreadId, usize> = HashMap::new();
    let mut out = vec![];
    for (i, e) in events.iter().enumerate() {
        match e.kind {
            EventKind::Call => {
                open.insert(e.thread, i);
            }
            EventKind::Return => {
                let call_idx = open
                    .remove(&e.thread)
                    .ok_or(CheckError::MalformedHistory(e.thread))?;
                out.push(Completed {
                    call_idx,
                    ret_idx: i,
                    func: e.func.clone(),
                    thread: e.thread,
                    args: events[call_idx].args.clone(),
                    ret: e.ret,
                });
            }
        }
    }
    Ok(out)
}

/// The C++ std::next_permutation discipline: advance to the
/// lexicographically next arrangement, or report false from the last one.
fn next_permutation(v: &mut [u32]) -> bool {
    if v.len() < 2 {
        return false;
    }
    let mut i = v.len() - 1;
    while i > 0 && v[i - 1] >= v[i] {
        i -= 1;
    }
    if i == 0 {
        v.reverse();
        return false;
    }
    let mut j = v.len() - 1;
    while v[j] <= v[i - 1] {
        j -= 1;
    }
    v.swap(i - 1, j);
    v[i..].reverse();
    true
}

/// For each position of the thread permutation, pick the earliest
/// yet-unused call on that thread.
fn select(perm: &[u32], calls: &[Completed]) -> Vec<usize> {
    let mut cursor: HashMap<u32, usize> = HashMap::new();
    let mut out = vec![];
    for &tag in perm {
        let start = cursor.get(&tag).copied().unwrap_or(0);
        let j = (start..calls.len())
            .find(|&j| calls[j].thread.0 == tag)
            .expect("permutation is a rearrangement of the calls' thread tags");
        out.push(j);
        cursor.insert(tag, j + 1);
    }
    out
}

/// Real-time order: whenever one call returned before another began, the
/// earlier call must come first in the candidate order.
fn realtime_ok(selection: &[usize], calls: &[Completed]) -> bool {
    for i in 0..selection.len() {
        for j in i + 1..selection.len() {
            let a = &calls[selection[i]];
            let b = &calls[selection[j]];
            let overlap = (a.call_idx > b.call_idx && a.call_idx < b.ret_idx)
                || (b.call_idx > a.call_idx && b.call_idx < a.ret_idx);
            if !overlap && a.call_idx > b.call_idx {
                return false;
            }
        }
    }
    true
}

fn replay(selection: &[usize], calls: &[Completed], program: ProgramKind) -> bool {
    let mut reference = match Reference::for_program(program) {
        Some(r) => r,
        None => return false,
    };
    selection.iter().all(|&j| {
        let c = &calls[j];
        reference.apply(&c.func, &c.args, c.ret)
    })
}

/// Check a history: `Ok(true)` when some permutation satisfies the
/// property, `Ok(false)` when none does.
pub fn check_history(
    history: &History,
    program: ProgramKind,
    property: Property,
) -> Result<bool, CheckError> {
    if Reference::for_program(program).is_none() {
        return Err(CheckError::UndefinedProgram);
    }
    let calls = completed_calls(history)?;
    if calls.len() > MAX_CALLS {
        return Err(CheckError::HistoryTooLong(calls.len()));
    }
    if calls.is_empty() {
        return Ok(true);
    }

    let mut perm: Vec<u32> = calls.iter().map(|c| c.thread.0).collect();
    perm.sort();

    let mut candidates = 0u64;
    loop {
        candidates += 1;
        let selection = select(&perm, &calls);
        if (property != Property::Lin || realtime_ok(&selection, &calls))
            && replay(&selection, &calls, program)
        {
            log::debug!("accepted candidate linearization {candidates}");
            return Ok(true);
        }
        if !next_permutation(&mut perm) {
            log::debug!("rejected all {candidates} candidate linearizations");
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::value::{IntValue, Value};
    use std::collections::HashSet;

    fn iv(n: i64) -> Value {
        Value::Int(IntValue::from_i128(32, n as i128))
    }

    /// Build a history from (thread, func, args, ret) quadruples, where a
    /// negative position in `ops` marks a call and the matching return is
    /// driven explicitly.
    struct HistoryBuilder {
        h: History,
    }

    impl HistoryBuilder {
        fn new(names: &[&str]) -> HistoryBuilder {
            let set: HashSet<String> = names.iter().map(|s| s.to_string()).collect();
            HistoryBuilder {
                h: History::new(set, true),
            }
        }

        fn call(&mut self, t: u32, func: &str, args: &[i64]) -> &mut Self {
            let args: Vec<Value> = args.iter().map(|&a| iv(a)).collect();
            self.h.record_call(func, ThreadId(t), &args);
            self
        }

        fn ret(&mut self, t: u32, func: &str, ret: i64) -> &mut Self {
            self.h.record_return(func, ThreadId(t), Some(&iv(ret)));
            self
        }

        /// A complete, non-overlapping operation.
        fn op(&mut self, t: u32, func: &str, args: &[i64], ret: i64) -> &mut Self {
            self.call(t, func, args).ret(t, func, ret)
        }
    }

    #[test]
    fn test_next_permutation_visits_distinct_arrangements() {
        let mut v = vec![1, 1, 2];
        let mut seen = vec![v.clone()];
        while next_permutation(&mut v) {
            seen.push(v.clone());
        }
        assert_eq!(seen, vec![vec![1, 1, 2], vec![1, 2, 1], vec![2, 1, 1]]);
        // and it wrapped back to the smallest arrangement
        assert_eq!(v, vec![1, 1, 2]);
    }

    #[test]
    fn test_sequential_queue_history_passes() {
        let mut b = HistoryBuilder::new(&["queue_enqueue", "queue_dequeue"]);
        b.op(1, "queue_enqueue", &[5], 1)
            .op(1, "queue_enqueue", &[6], 1)
            .op(2, "queue_dequeue", &[], 5)
            .op(2, "queue_dequeue", &[], 6);
        assert_eq!(
            check_history(&b.h, ProgramKind::Queue, Property::Lin),
            Ok(true)
        );
    }

    #[test]
    fn test_wrong_dequeue_order_fails() {
        // 6 cannot come out before 5 under any interleaving: both
        // enqueues completed before either dequeue began
        let mut b = HistoryBuilder::new(&["queue_enqueue", "queue_dequeue"]);
        b.op(1, "queue_enqueue", &[5], 1)
            .op(1, "queue_enqueue", &[6], 1)
            .op(2, "queue_dequeue", &[], 6)
            .op(2, "queue_dequeue", &[], 5);
        assert_eq!(
            check_history(&b.h, ProgramKind::Queue, Property::Lin),
            Ok(false)
        );
        assert_eq!(
            check_history(&b.h, ProgramKind::Queue, Property::Sc),
            Ok(false)
        );
    }

    #[test]
    fn test_sc_accepts_what_lin_rejects() {
        // thread 2 dequeues -1 strictly after thread 1's enqueue completed:
        // linearizability forbids reordering them, SC does not
        let mut b = HistoryBuilder::new(&["queue_enqueue", "queue_dequeue"]);
        b.op(1, "queue_enqueue", &[5], 1)
            .op(2, "queue_dequeue", &[], -1)
            .op(1, "queue_dequeue", &[], 5);
        assert_eq!(
            check_history(&b.h, ProgramKind::Queue, Property::Lin),
            Ok(false)
        );
        assert_eq!(
            check_history(&b.h, ProgramKind::Queue, Property::Sc),
            Ok(true)
        );
    }

    #[test]
    fn test_lin_accepts_overlapping_operations_in_either_order() {
        // the dequeue overlaps the enqueue, so both outcomes are
        // linearizable; here it observes the empty queue
        let mut b = HistoryBuilder::new(&["queue_enqueue", "queue_dequeue"]);
        b.call(2, "queue_dequeue", &[])
            .call(1, "queue_enqueue", &[5])
            .ret(1, "queue_enqueue", 1)
            .ret(2, "queue_dequeue", -1);
        assert_eq!(
            check_history(&b.h, ProgramKind::Queue, Property::Lin),
            Ok(true)
        );
    }

    #[test]
    fn test_lin_implies_sc() {
        // any history the LIN checker accepts, the SC checker accepts too
        let histories: Vec<HistoryBuilder> = {
            let mut a = HistoryBuilder::new(&["wsq_put", "wsq_take", "wsq_steal"]);
            a.op(1, "wsq_put", &[7], 1)
                .op(1, "wsq_put", &[9], 1)
                .op(2, "wsq_steal", &[], 7)
                .op(1, "wsq_take", &[], 9);
            let mut b = HistoryBuilder::new(&["wsq_put", "wsq_take", "wsq_steal"]);
            b.op(1, "wsq_put", &[3], 1).op(2, "wsq_steal", &[], 3);
            vec![a, b]
        };
        for b in &histories {
            if check_history(&b.h, ProgramKind::WsqChase, Property::Lin) == Ok(true) {
                assert_eq!(
                    check_history(&b.h, ProgramKind::WsqChase, Property::Sc),
                    Ok(true)
                );
            }
        }
    }

    #[test]
    fn test_malloc_reference_rejects_overlap() {
        let mut b = HistoryBuilder::new(&["mmalloc", "mfree"]);
        b.op(1, "mmalloc", &[64], 1000).op(2, "mmalloc", &[64], 1032);
        assert_eq!(
            check_history(&b.h, ProgramKind::LfMalloc, Property::Lin),
            Ok(false)
        );

        let mut ok = HistoryBuilder::new(&["mmalloc", "mfree"]);
        ok.op(1, "mmalloc", &[16], 1000)
            .op(2, "mmalloc", &[16], 2000)
            .op(1, "mfree", &[1000], 0);
        assert_eq!(
            check_history(&ok.h, ProgramKind::LfMalloc, Property::Lin),
            Ok(true)
        );
    }

    #[test]
    fn test_skip_list_has_no_reference() {
        let b = HistoryBuilder::new(&[]);
        assert_eq!(
            check_history(&b.h, ProgramKind::SkipList, Property::Sc),
            Err(CheckError::UndefinedProgram)
        );
    }

    #[test]
    fn test_history_cap() {
        let mut b = HistoryBuilder::new(&["queue_enqueue"]);
        for i in 0..(MAX_CALLS as i64 + 1) {
            b.op(1, "queue_enqueue", &[i], 1);
        }
        assert_eq!(
            check_history(&b.h, ProgramKind::Queue, Property::Sc),
            Err(CheckError::HistoryTooLong(MAX_CALLS + 1))
        );
    }

    #[test]
    fn test_empty_history_is_vacuously_correct() {
        let b = HistoryBuilder::new(&["queue_enqueue"]);
        assert_eq!(
            check_history(&b.h, ProgramKind::Queue, Property::Lin),
            Ok(true)
        );
    }
}
