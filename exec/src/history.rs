// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! The invocation history: CALL/RETURN events for the configured methods.
//!
//! Only outermost invocations are recorded: a per-thread depth counter is
//! bumped on every entry to a recorded function, and events are written
//! only on the 0→1 and 1→0 transitions, so recursion contributes nothing.

use crate::thread::ThreadId;
use ir::value::Value;
use std::collections::{HashMap, HashSet};

/// Whether an event is a call or a return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Method entry.
    Call,
    /// Method exit.
    Return,
}

/// One history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Call or return.
    pub kind: EventKind,
    /// The recorded method's name.
    pub func: String,
    /// The invoking thread.
    pub thread: ThreadId,
    /// Integer images of the arguments (calls only).
    pub args: Vec<i64>,
    /// Integer image of the return value (returns only).
    pub ret: i64,
}

/// The ordered invocation log.
#[derive(Debug, Clone)]
pub struct History {
    events: Vec<Event>,
    depth: HashMap<ThreadId, u32>,
    recorded: HashSet<String>,
    enabled: bool,
}

impl History {
    /// A history recording the given method names; `enabled` is false when
    /// no property is being checked.
    pub fn new(recorded: HashSet<String>, enabled: bool) -> History {
        History {
            events: vec![],
            depth: HashMap::new(),
            recorded,
            enabled,
        }
    }

    fn is_recorded(&self, func: &str) -> bool {
        self.recorded.contains(func)
    }

    /// Record a method entry. Pointer and integer arguments are captured as
    /// integers; anything else records 0 with a warning.
    pub fn record_call(&mut self, func: &str, thread: ThreadId, args: &[Value]) {
        if !self.enabled || !self.is_recorded(func) {
            return;
        }
        let depth = self.depth.entry(thread).or_insert(0);
        if *depth == 0 {
            let args = args
                .iter()
                .map(|v| {
                    v.as_record_int().unwrap_or_else(|| {
                        println!(
                            "WARNING: Argument with non-int and non-pointer type given to function!"
                        );
                        0
                    })
                })
                .collect();
            self.events.push(Event {
                kind: EventKind::Call,
                func: func.to_string(),
                thread,
                args,
                ret: 0,
            });
        }
        *depth += 1;
    }

    /// Record a method exit.
    pub fn record_return(&mut self, func: &str, thread: ThreadId, ret: Option<&Value>) {
        if !self.enabled || !self.is_recorded(func) {
            return;
        }
        let depth = self.depth.entry(thread).or_insert(0);
        if *depth == 1 {
            let ret = match ret {
                Some(v) => v.as_record_int().unwrap_or_else(|| {
                    println!(
                        "WARNING: Result with non-int and non-pointer type returned by function!"
                    );
                    0
                }),
                None => 0,
            };
            self.events.push(Event {
                kind: EventKind::Return,
                func: func.to_string(),
                thread,
                args: vec![],
                ret,
            });
        }
        if *depth > 0 {
            *depth -= 1;
        }
    }

    /// The recorded events in order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Print the log in the tool's diagnostic format.
    pub fn print(&self) {
        if !self.enabled {
            return;
        }
        println!("RECORDED TRACE");
        for e in &self.events {
            match e.kind {
                EventKind::Call => {
                    let args = e
                        .args
                        .iter()
                        .map(|a| a.to_string())
                        .collect::<Vec<_>>()
                        .join(" ");
                    println!("call of {} on thread {}: {args}", e.func, e.thread);
                }
                EventKind::Return => {
                    println!("return of {} on thread {}: {}", e.func, e.thread, e.ret);
                }
            }
        }
        println!("END OF RECORDED TRACE");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::value::IntValue;

    fn history() -> History {
        History::new(HashSet::from(["wsq_put".to_string()]), true)
    }

    fn iv(n: i64) -> Value {
        Value::Int(IntValue::from_i128(32, n as i128))
    }

    #[test]
    fn test_outermost_only() {
        let mut h = history();
        let t = ThreadId(1);
        h.record_call("wsq_put", t, &[iv(7)]);
        // a recursive re-entry contributes nothing
        h.record_call("wsq_put", t, &[iv(8)]);
        h.record_return("wsq_put", t, Some(&iv(1)));
        h.record_return("wsq_put", t, Some(&iv(1)));
        assert_eq!(h.events().len(), 2);
        assert_eq!(h.events()[0].kind, EventKind::Call);
        assert_eq!(h.events()[0].args, vec![7]);
        assert_eq!(h.events()[1].kind, EventKind::Return);
        assert_eq!(h.events()[1].ret, 1);
    }

    #[test]
    fn test_unrecorded_functions_are_skipped() {
        let mut h = history();
        h.record_call("helper", ThreadId(1), &[]);
        h.record_return("helper", ThreadId(1), None);
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_depth_is_per_thread() {
        let mut h = history();
        h.record_call("wsq_put", ThreadId(1), &[iv(1)]);
        // thread 2's own outermost call still records
        h.record_call("wsq_put", ThreadId(2), &[iv(2)]);
        assert_eq!(h.events().len(), 2);
    }

    #[test]
    fn test_pointer_args_record_as_ints() {
        let mut h = history();
        h.record_call("wsq_put", ThreadId(1), &[Value::Ptr(4096)]);
        assert_eq!(h.events()[0].args, vec![4096]);
    }
}
