// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! The outer synthesis loop.
//!
//! Each round executes N randomized runs of the current IR. Bad traces
//! contribute clauses; a round with no bad trace is convergence. Otherwise
//! the solver picks fence sites, the module is patched, the solver state
//! is reset (the label map and the memory of already-fenced stores
//! persist), and the loop restarts.

use crate::constraints::{clause_for_trace, ConstraintError};
use crate::patch::insert_fences;
use crate::solve::{Fence, FenceKind, SynthContext};
use exec::conf::Conf;
use exec::interp::{ExecError, Interp, RunTrace};
use ir::syntax::Module;
use ir::timing::{self, TimeType};
use thiserror::Error;
use verify::checker::{check_history, CheckError};

/// Default number of traces exercised per round.
pub const TRACES_PER_ROUND: u32 = 20;

/// Knobs for one synthesis session.
#[derive(Debug, Clone)]
pub struct DriverOpts {
    /// Runs per round.
    pub tries: u32,
    /// The guest entry function.
    pub entry: String,
    /// Guest program arguments.
    pub argv: Vec<String>,
    /// Base seed for the per-run schedules.
    pub seed: u64,
    /// When false, stop at the first bad trace instead of synthesizing.
    pub fix: bool,
}

impl Default for DriverOpts {
    fn default() -> DriverOpts {
        DriverOpts {
            tries: TRACES_PER_ROUND,
            entry: "main".to_string(),
            argv: vec![],
            seed: 0,
            fix: true,
        }
    }
}

/// How a synthesis session ended.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// A whole round ran with no bad trace; the module carries the fences.
    Converged {
        /// Rounds executed, including the converged one.
        rounds: u32,
        /// Every fence inserted, in insertion order.
        fences: Vec<Fence>,
        /// Consecutive good runs at convergence (the confidence metric:
        /// convergence is empirical, not sound).
        runs_since_bad: u32,
    },
    /// Verification-only mode observed a bad trace.
    BadTrace,
    /// A bad trace produced no constraint; no fence can repair this bug.
    EmptyConstraint,
    /// The accumulated clauses are unsatisfiable.
    Unsatisfiable,
}

/// A host-level failure of the loop itself.
#[derive(Debug, Error)]
pub enum SynthError {
    /// The interpreter failed.
    #[error("{0}")]
    Exec(#[from] ExecError),
    /// The checker could not check the history.
    #[error("{0}")]
    Check(#[from] CheckError),
    /// Constraint generation failed.
    #[error("{0}")]
    Constraint(#[from] ConstraintError),
}

enum RunClass {
    Good,
    Bad,
    BadEmptyClause,
}

/// Drive rounds of runs over `module` until convergence or failure,
/// patching fences in between rounds.
pub fn synthesize(
    module: &mut Module,
    conf: &Conf,
    opts: &DriverOpts,
) -> Result<Outcome, SynthError> {
    let mut ctx = SynthContext::new();
    let mut all_fences = vec![];
    let mut runs_since_bad = 0u32;
    let mut seed = opts.seed;
    let mut round = 0u32;

    loop {
        round += 1;
        println!("/-----/ Round {round} /------/");
        let round_start = timing::start();
        let mut buggy = 0u32;

        for _ in 0..opts.tries {
            seed = seed.wrapping_add(1);
            match run_once(module, conf, opts, seed, &mut ctx)? {
                RunClass::Good => runs_since_bad += 1,
                RunClass::Bad => {
                    if !opts.fix {
                        return Ok(Outcome::BadTrace);
                    }
                    buggy += 1;
                    runs_since_bad = 0;
                }
                RunClass::BadEmptyClause => return Ok(Outcome::EmptyConstraint),
            }
        }

        println!("Try {} times, find {buggy} buggy traces", opts.tries);
        println!(
            "Collect {} lits and {buggy} clauses for the SAT solver",
            ctx.lit_total()
        );

        if buggy == 0 {
            timing::elapsed(TimeType::Verify, round_start);
            println!("/-----/ Converged! /------/");
            println!("runs since last bad trace: {runs_since_bad}");
            report_fences(&all_fences);
            return Ok(Outcome::Converged {
                rounds: round,
                fences: all_fences,
                runs_since_bad,
            });
        }

        let solve_start = timing::start();
        let sat = ctx.solve();
        if !sat {
            timing::elapsed(TimeType::Solve, solve_start);
            println!("UNSATISFIABLE");
            return Ok(Outcome::Unsatisfiable);
        }
        let fences = ctx.selected_fences();
        timing::elapsed(TimeType::Solve, solve_start);
        log::info!(
            "round {round}: {} clauses solved, {} fence sites selected",
            ctx.clause_count(),
            fences.len()
        );

        println!("/-----/ Inserting fences to IR /------/");
        report_fences(&fences);
        insert_fences(module, &fences);
        all_fences.extend(fences);
        ctx.reset();
        println!("/-----/ Restart interpreter /------/");
    }
}

fn run_once(
    module: &Module,
    conf: &Conf,
    opts: &DriverOpts,
    seed: u64,
    ctx: &mut SynthContext,
) -> Result<RunClass, SynthError> {
    let start = timing::start();
    let trace = Interp::new(module, conf, seed).run_main(&opts.entry, &opts.argv)?;
    timing::elapsed(TimeType::Interpret, start);
    log::debug!(
        "run with seed {seed}: {} steps, {} recorded events, fault: {}",
        trace.steps,
        trace.history.events().len(),
        trace.seg_fault
    );

    if !classify(&trace, conf)? {
        return Ok(RunClass::Good);
    }
    trace.history.print();
    if !opts.fix {
        trace.rwlog.print_shared();
        return Ok(RunClass::Bad);
    }
    let clause = clause_for_trace(&trace.rwlog.shared(), conf.wmm, &mut ctx.maps)?;
    if clause.is_empty() {
        trace.rwlog.print_shared();
        return Ok(RunClass::BadEmptyClause);
    }
    log::debug!("bad trace contributed a clause over {} literals", clause.len());
    ctx.add_clause(&clause);
    Ok(RunClass::Bad)
}

/// True when the run's trace is bad. A run that used assert_exist is
/// classified by the fault flag alone; otherwise a fault is bad, and a
/// clean run is checked against the sequential reference when a property
/// is configured.
fn classify(trace: &RunTrace, conf: &Conf) -> Result<bool, SynthError> {
    if trace.assert_exist_used {
        return Ok(trace.seg_fault);
    }
    if trace.seg_fault {
        return Ok(true);
    }
    if !conf.rec_trace() {
        return Ok(false);
    }
    let program = conf.program.ok_or(CheckError::UndefinedProgram)?;
    let start = timing::start();
    let ok = check_history(&trace.history, program, conf.property)?;
    timing::elapsed(TimeType::Check, start);
    println!(
        "sc/lin check {}",
        if ok { "succeeded" } else { "failed" }
    );
    Ok(!ok)
}

fn report_fences(fences: &[Fence]) {
    println!("There are {} fences in total!", fences.len());
    for f in fences {
        let kind = match f.kind {
            FenceKind::StoreLoad => "store_load_fence",
            FenceKind::StoreStore => "store_store_fence",
        };
        println!("{} = {kind} = {}", f.store_label, f.partner_label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exec::conf::{ProgramKind, Property, SchedPolicy, Wmm};
    use std::collections::HashSet;

    /// A linked-set fragment whose add publishes through a plain store.
    /// With nothing forcing a flush, a reader that starts strictly after
    /// add's return still sees the old memory, which violates real-time
    /// order. A store→load fence after the publishing store repairs it.
    const LATE_PUBLISH: &str = "
        global @slot3 : i32 = 0
        global @size : i32 = 0

        func @noop() -> void {
        entry:
          ret void
        }

        func @linkset_add(i32 %k) -> i32 {
        entry:
          store i32 1, @slot3
          %n = load i32, @size
          %n1 = add i32 %n, 1
          store i32 %n1, @size
          ret i32 1
        }

        func @linkset_contains(i32 %k) -> i32 {
        entry:
          %v = load i32, @slot3
          ret i32 %v
        }

        func @reader() -> void {
        entry:
          %r = call i32 @linkset_contains(i32 3)
          ret void
        }

        func @main() -> i32 {
        entry:
          call void @spawn_thread(ptr @noop)
          %a = call i32 @linkset_add(i32 3)
          call void @spawn_thread(ptr @reader)
          call void @join_all()
          ret i32 0
        }
        ";

    /// The same shape with the element and its published flag at separate
    /// addresses, so PSO can also reorder the two stores.
    const SPLIT_PUBLISH: &str = "
        global @val : i32 = 0
        global @published : i32 = 0
        global @size : i32 = 0

        func @noop() -> void {
        entry:
          ret void
        }

        func @linkset_add(i32 %k) -> i32 {
        entry:
          store i32 1, @val
          store i32 1, @published
          %n = load i32, @size
          %n1 = add i32 %n, 1
          store i32 %n1, @size
          ret i32 1
        }

        func @linkset_contains(i32 %k) -> i32 {
        entry:
          %p = load i32, @published
          %ok = icmp eq i32 %p, 1
          br %ok, label %present, label %absent
        present:
          %v = load i32, @val
          ret i32 %v
        absent:
          ret i32 0
        }

        func @reader() -> void {
        entry:
          %r = call i32 @linkset_contains(i32 3)
          ret void
        }

        func @main() -> i32 {
        entry:
          call void @spawn_thread(ptr @noop)
          %a = call i32 @linkset_add(i32 3)
          call void @spawn_thread(ptr @reader)
          call void @join_all()
          ret i32 0
        }
        ";

    fn conf(wmm: Wmm) -> Conf {
        Conf {
            // never flush at random: staleness is then deterministic, and
            // so is the whole test
            flush_prob: 0.0,
            wmm,
            property: Property::Lin,
            program: Some(ProgramKind::LinkSet),
            logging: true,
            scheduler: SchedPolicy::Random,
            recorded: HashSet::from([
                "linkset_add".to_string(),
                "linkset_contains".to_string(),
            ]),
        }
    }

    fn load(src: &str) -> Module {
        let mut m = ir::parser::parse(src).expect("test module should parse");
        m.assign_labels();
        m
    }

    fn opts(tries: u32) -> DriverOpts {
        DriverOpts {
            tries,
            seed: 11,
            ..DriverOpts::default()
        }
    }

    #[test]
    fn test_tso_synthesis_inserts_a_store_load_fence() {
        let mut m = load(LATE_PUBLISH);
        let outcome = synthesize(&mut m, &conf(Wmm::Tso), &opts(5)).unwrap();
        match outcome {
            Outcome::Converged { rounds, fences, .. } => {
                assert_eq!(rounds, 2);
                assert_eq!(fences.len(), 1);
                assert_eq!(fences[0].kind, FenceKind::StoreLoad);
                // the fence follows the publishing store
                let printed = ir::printer::fmt(&m);
                let store = printed.find("store i32 1, @slot3").unwrap();
                let fence = printed.find("call void @membar_sl()").unwrap();
                assert!(fence > store);
            }
            other => panic!("expected convergence, got {other:?}"),
        }
    }

    #[test]
    fn test_sc_converges_without_fences() {
        let mut m = load(LATE_PUBLISH);
        let outcome = synthesize(&mut m, &conf(Wmm::None), &opts(5)).unwrap();
        match outcome {
            Outcome::Converged { rounds, fences, .. } => {
                assert_eq!(rounds, 1);
                assert!(fences.is_empty());
            }
            other => panic!("expected convergence, got {other:?}"),
        }
    }

    #[test]
    fn test_pso_synthesis_converges_and_fences_the_publish() {
        let mut m = load(SPLIT_PUBLISH);
        let outcome = synthesize(&mut m, &conf(Wmm::Pso), &opts(5)).unwrap();
        match outcome {
            Outcome::Converged { fences, .. } => {
                assert!(!fences.is_empty());
                let printed = ir::printer::fmt(&m);
                assert!(
                    printed.contains("@membar_ss()") || printed.contains("@membar_sl()")
                );
            }
            other => panic!("expected convergence, got {other:?}"),
        }
    }

    #[test]
    fn test_verification_only_reports_bad_trace() {
        let mut m = load(LATE_PUBLISH);
        let mut o = opts(5);
        o.fix = false;
        let outcome = synthesize(&mut m, &conf(Wmm::Tso), &o).unwrap();
        assert_eq!(outcome, Outcome::BadTrace);
    }

    #[test]
    fn test_patched_module_is_idempotent() {
        // running the tool on its own output converges in one round with
        // no further fences
        let mut m = load(LATE_PUBLISH);
        synthesize(&mut m, &conf(Wmm::Tso), &opts(5)).unwrap();
        let mut fixed = ir::parser::parse(&ir::printer::fmt(&m)).unwrap();
        fixed.assign_labels();
        let outcome = synthesize(&mut fixed, &conf(Wmm::Tso), &opts(5)).unwrap();
        match outcome {
            Outcome::Converged { rounds, fences, .. } => {
                assert_eq!(rounds, 1);
                assert!(fences.is_empty());
            }
            other => panic!("expected convergence, got {other:?}"),
        }
    }
}
