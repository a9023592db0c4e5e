// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! The SAT-driven fence selector, using the [CaDiCaL][cadical] solver.
//!
//! Each bad run contributes one clause over candidate-fence literals.
//! After a round, a satisfying model selects fence sites; the smallest
//! recorded solution is kept and reduced to at most one fence per
//! originating store. Stores already fenced in an earlier round are
//! remembered and never fenced twice.
//!
//! [cadical]: https://fmv.jku.at/cadical/

use crate::constraints::LitMaps;
use cadical::Solver;
use std::collections::{BTreeSet, HashSet};

/// Which fence intrinsic a selected literal stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    /// `membar_sl`, ordering a store before a later load.
    StoreLoad,
    /// `membar_ss`, ordering a store before a later store.
    StoreStore,
}

/// A selected fence site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fence {
    /// The label of the store the fence follows.
    pub store_label: u32,
    /// The label of the load or store the pair ordered it against.
    pub partner_label: u32,
    /// Which intrinsic to insert.
    pub kind: FenceKind,
}

/// The process-wide synthesis state: the solver, the literal maps, the
/// recorded solutions, and the cross-round memory of already-fenced
/// stores. Owned by the outer loop and reset wholesale between rounds
/// (except the fenced-store memory).
pub struct SynthContext {
    solver: Solver,
    /// The literal assignment shared with the constraint generator.
    pub maps: LitMaps,
    clauses: usize,
    solutions: Vec<BTreeSet<i32>>,
    solved_stores: HashSet<u32>,
}

impl SynthContext {
    /// A fresh context with an empty solver and no fenced-store memory.
    #[allow(clippy::new_without_default)]
    pub fn new() -> SynthContext {
        SynthContext {
            solver: Solver::default(),
            maps: LitMaps::default(),
            clauses: 0,
            solutions: vec![],
            solved_stores: HashSet::new(),
        }
    }

    /// Add one bad run's clause as a disjunction.
    pub fn add_clause(&mut self, clause: &BTreeSet<i32>) {
        self.solver.add_clause(clause.iter().copied());
        self.clauses += 1;
    }

    /// Number of clauses added this round.
    pub fn clause_count(&self) -> usize {
        self.clauses
    }

    /// Number of distinct literals assigned this round.
    pub fn lit_total(&self) -> i32 {
        self.maps.total()
    }

    /// Solve the accumulated clauses. On satisfiability the model's
    /// selected literals are recorded as a solution.
    pub fn solve(&mut self) -> bool {
        match self.solver.solve() {
            Some(true) => {
                let selected: BTreeSet<i32> = (1..=self.maps.total())
                    .filter(|&lit| self.solver.value(lit).unwrap_or(false))
                    .collect();
                self.solutions.push(selected);
                true
            }
            _ => false,
        }
    }

    /// Reduce the recorded solutions to concrete fence sites: keep the
    /// smallest solution, then keep only the first literal per originating
    /// store (one fence per store is enough to order everything after it).
    pub fn selected_fences(&mut self) -> Vec<Fence> {
        let merged = match self.solutions.iter().min_by_key(|s| s.len()) {
            Some(s) => s.clone(),
            None => return vec![],
        };
        let mut fences = vec![];
        for lit in merged {
            let (pair, kind) = match self.maps.sl_pair_of(lit) {
                Some(p) => (p, FenceKind::StoreLoad),
                None => match self.maps.ss_pair_of(lit) {
                    Some(p) => (p, FenceKind::StoreStore),
                    None => continue,
                },
            };
            if self.solved_stores.insert(pair.0) {
                fences.push(Fence {
                    store_label: pair.0,
                    partner_label: pair.1,
                    kind,
                });
            }
        }
        fences
    }

    /// Discard the round's solver, literal maps, clauses and solutions.
    /// The memory of already-fenced stores persists so later rounds do not
    /// fence the same store twice.
    pub fn reset(&mut self) {
        self.solver = Solver::default();
        self.maps.reset();
        self.clauses = 0;
        self.solutions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_clause_selects_a_fence() {
        let mut ctx = SynthContext::new();
        let lit = ctx.maps.lit_sl((5, 8));
        ctx.add_clause(&BTreeSet::from([lit]));
        assert!(ctx.solve());
        let fences = ctx.selected_fences();
        assert_eq!(
            fences,
            vec![Fence {
                store_label: 5,
                partner_label: 8,
                kind: FenceKind::StoreLoad,
            }]
        );
    }

    #[test]
    fn test_one_fence_per_store() {
        // two pairs share the store at label 5: only one fence comes out
        let mut ctx = SynthContext::new();
        let l1 = ctx.maps.lit_sl((5, 8));
        let l2 = ctx.maps.lit_sl((5, 9));
        ctx.add_clause(&BTreeSet::from([l1]));
        ctx.add_clause(&BTreeSet::from([l2]));
        assert!(ctx.solve());
        let fences = ctx.selected_fences();
        assert_eq!(fences.len(), 1);
        assert_eq!(fences[0].store_label, 5);
    }

    #[test]
    fn test_store_store_pairs_select_membar_ss() {
        let mut ctx = SynthContext::new();
        let lit = ctx.maps.lit_ss((5, 6));
        ctx.add_clause(&BTreeSet::from([lit]));
        assert!(ctx.solve());
        let fences = ctx.selected_fences();
        assert_eq!(fences[0].kind, FenceKind::StoreStore);
    }

    #[test]
    fn test_reset_keeps_fenced_store_memory() {
        let mut ctx = SynthContext::new();
        let lit = ctx.maps.lit_sl((5, 8));
        ctx.add_clause(&BTreeSet::from([lit]));
        assert!(ctx.solve());
        assert_eq!(ctx.selected_fences().len(), 1);

        ctx.reset();
        assert_eq!(ctx.clause_count(), 0);
        assert_eq!(ctx.lit_total(), 0);

        // the same store resurfacing in a later round is not fenced again
        let lit = ctx.maps.lit_sl((5, 11));
        ctx.add_clause(&BTreeSet::from([lit]));
        assert!(ctx.solve());
        assert!(ctx.selected_fences().is_empty());
    }

    #[test]
    fn test_unsat_reports_failure() {
        let mut ctx = SynthContext::new();
        let lit = ctx.maps.lit_sl((5, 8));
        // lit and its negation cannot both hold; feed the negation directly
        ctx.add_clause(&BTreeSet::from([lit]));
        ctx.solver.add_clause([-lit]);
        assert!(!ctx.solve());
    }
}
