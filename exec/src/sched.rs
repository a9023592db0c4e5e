// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! The non-deterministic scheduler.
//!
//! One action is chosen before every interpreted instruction: run a thread,
//! make one buffered store visible, or do nothing. A thread that is neither
//! blocked nor touching shared memory keeps running; everything else goes
//! through the policy's coin flips.

use crate::conf::{SchedPolicy, Wmm};
use crate::thread::ThreadId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use thiserror::Error;

/// What the interpreter should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Execute one instruction of the given thread.
    Switch(ThreadId),
    /// Make the oldest buffered store of the given thread visible (TSO).
    FlushTso(ThreadId),
    /// Make the oldest buffered store of `(thread, addr)` visible (PSO).
    FlushPso(ThreadId, u64),
    /// Do nothing this tick.
    NoAction,
}

/// A scheduling failure; both are configuration-level and fatal.
#[derive(Debug, PartialEq, Error)]
pub enum SchedError {
    /// The deterministic round-robin policy only models TSO.
    #[error("the DBRR scheduler cannot handle the PSO model")]
    DbrrPso,
    /// The predictive policy is reserved but not implemented.
    #[error("the PREDICTIVE scheduler is not implemented")]
    Predictive,
}

/// Everything the policy looks at when choosing an action.
pub struct SchedInputs<'a> {
    /// Threads with a non-empty stack, in ascending tag order.
    pub enabled: &'a [ThreadId],
    /// The thread that executed last.
    pub current: ThreadId,
    /// Whether the last instruction blocked (a waiting join).
    pub blocked: bool,
    /// Whether the last instruction touched shared memory.
    pub shared: bool,
    /// The memory model.
    pub wmm: Wmm,
    /// Probability of flushing instead of switching.
    pub flush_prob: f64,
    /// Per-thread addresses with pending PSO stores (empty map under other
    /// models).
    pub pso_addrs: &'a BTreeMap<ThreadId, Vec<u64>>,
}

/// The scheduler: a policy plus its own RNG and round-robin cursor.
pub struct Scheduler {
    policy: SchedPolicy,
    rng: StdRng,
    rr_last: u32,
}

impl Scheduler {
    /// A scheduler for the given policy, seeded for reproducibility.
    pub fn new(policy: SchedPolicy, seed: u64) -> Scheduler {
        Scheduler {
            policy,
            rng: StdRng::seed_from_u64(seed),
            rr_last: 0,
        }
    }

    /// Choose the next action.
    pub fn select(&mut self, inp: &SchedInputs) -> Result<Action, SchedError> {
        if inp.enabled.is_empty() {
            return Ok(Action::NoAction);
        }
        if !inp.blocked && !inp.shared && inp.enabled.contains(&inp.current) {
            return Ok(Action::Switch(inp.current));
        }
        self.pick(inp)
    }

    fn pick(&mut self, inp: &SchedInputs) -> Result<Action, SchedError> {
        match self.policy {
            SchedPolicy::Random => Ok(self.pick_random(inp)),
            SchedPolicy::Dbrr => self.pick_dbrr(inp),
            SchedPolicy::Predictive => Err(SchedError::Predictive),
        }
    }

    fn random_enabled(&mut self, inp: &SchedInputs) -> ThreadId {
        inp.enabled[self.rng.gen_range(0..inp.enabled.len())]
    }

    fn pick_random(&mut self, inp: &SchedInputs) -> Action {
        if inp.wmm == Wmm::None || self.rng.gen::<f64>() > inp.flush_prob {
            return Action::Switch(self.random_enabled(inp));
        }
        match inp.wmm {
            Wmm::None => Action::NoAction,
            Wmm::Tso => Action::FlushTso(self.random_enabled(inp)),
            Wmm::Pso => {
                let t = self.random_enabled(inp);
                let addrs = inp.pso_addrs.get(&t).map(Vec::as_slice).unwrap_or(&[]);
                if addrs.is_empty() {
                    Action::NoAction
                } else {
                    Action::FlushPso(t, addrs[self.rng.gen_range(0..addrs.len())])
                }
            }
        }
    }

    fn pick_dbrr(&mut self, inp: &SchedInputs) -> Result<Action, SchedError> {
        // rotate to the next enabled tag, wrapping at the end
        let next = inp
            .enabled
            .iter()
            .find(|t| t.0 > self.rr_last)
            .copied()
            .unwrap_or(inp.enabled[0]);
        self.rr_last = next.0;

        if self.rng.gen::<f64>() > inp.flush_prob {
            return Ok(Action::Switch(next));
        }
        match inp.wmm {
            Wmm::None => Ok(Action::NoAction),
            Wmm::Tso => Ok(Action::FlushTso(next)),
            Wmm::Pso => Err(SchedError::DbrrPso),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(
        enabled: &'a [ThreadId],
        wmm: Wmm,
        flush_prob: f64,
        pso_addrs: &'a BTreeMap<ThreadId, Vec<u64>>,
    ) -> SchedInputs<'a> {
        SchedInputs {
            enabled,
            current: ThreadId(1),
            blocked: true,
            shared: true,
            wmm,
            flush_prob,
            pso_addrs,
        }
    }

    #[test]
    fn test_non_shared_instruction_keeps_running() {
        let enabled = [ThreadId(1), ThreadId(2)];
        let empty = BTreeMap::new();
        let mut s = Scheduler::new(SchedPolicy::Random, 7);
        let mut inp = inputs(&enabled, Wmm::Tso, 1.0, &empty);
        inp.blocked = false;
        inp.shared = false;
        for _ in 0..10 {
            assert_eq!(s.select(&inp).unwrap(), Action::Switch(ThreadId(1)));
        }
    }

    #[test]
    fn test_flush_prob_one_always_flushes_under_tso() {
        let enabled = [ThreadId(1), ThreadId(2)];
        let empty = BTreeMap::new();
        let mut s = Scheduler::new(SchedPolicy::Random, 7);
        let inp = inputs(&enabled, Wmm::Tso, 1.0, &empty);
        for _ in 0..10 {
            assert!(matches!(s.select(&inp).unwrap(), Action::FlushTso(_)));
        }
    }

    #[test]
    fn test_flush_prob_zero_always_switches() {
        let enabled = [ThreadId(1), ThreadId(2)];
        let empty = BTreeMap::new();
        let mut s = Scheduler::new(SchedPolicy::Random, 7);
        let inp = inputs(&enabled, Wmm::Tso, 0.0, &empty);
        for _ in 0..10 {
            assert!(matches!(s.select(&inp).unwrap(), Action::Switch(_)));
        }
    }

    #[test]
    fn test_pso_flush_needs_a_nonempty_queue() {
        let enabled = [ThreadId(1)];
        let empty = BTreeMap::new();
        let mut s = Scheduler::new(SchedPolicy::Random, 7);
        let inp = inputs(&enabled, Wmm::Pso, 1.0, &empty);
        assert_eq!(s.select(&inp).unwrap(), Action::NoAction);

        let full = BTreeMap::from([(ThreadId(1), vec![4096u64])]);
        let inp = inputs(&enabled, Wmm::Pso, 1.0, &full);
        assert_eq!(
            s.select(&inp).unwrap(),
            Action::FlushPso(ThreadId(1), 4096)
        );
    }

    #[test]
    fn test_dbrr_rotates_in_tag_order() {
        let enabled = [ThreadId(1), ThreadId(2), ThreadId(3)];
        let empty = BTreeMap::new();
        let mut s = Scheduler::new(SchedPolicy::Dbrr, 7);
        let inp = inputs(&enabled, Wmm::None, 0.0, &empty);
        let picks: Vec<_> = (0..4)
            .map(|_| match s.select(&inp).unwrap() {
                Action::Switch(t) => t.0,
                other => panic!("unexpected action {other:?}"),
            })
            .collect();
        assert_eq!(picks, vec![1, 2, 3, 1]);
    }

    #[test]
    fn test_dbrr_rejects_pso() {
        let enabled = [ThreadId(1)];
        let empty = BTreeMap::new();
        let mut s = Scheduler::new(SchedPolicy::Dbrr, 7);
        let inp = inputs(&enabled, Wmm::Pso, 1.0, &empty);
        assert_eq!(s.select(&inp), Err(SchedError::DbrrPso));
    }
}
