// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Wall-clock accounting for the synthesis loop, reported in four buckets.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use itertools::Itertools;
use lazy_static::lazy_static;

/// The bucket a measured duration belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimeType {
    /// Interpreting guest instructions.
    Interpret,
    /// Linearizability / SC checking.
    Check,
    /// SAT solving and fence selection.
    Solve,
    /// The final verification round after convergence.
    Verify,
}

impl TimeType {
    fn name(&self) -> &'static str {
        match self {
            TimeType::Interpret => "interpretation",
            TimeType::Check => "checking",
            TimeType::Solve => "sat solving",
            TimeType::Verify => "final verification",
        }
    }
}

/// A single timing event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct TimeInfo {
    typ: TimeType,
    dur: Duration,
}

/// A record of timing measurements.
pub struct Timings(Mutex<Vec<TimeInfo>>, Instant);

impl Timings {
    /// An empty record anchored at the current instant.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Timings(Mutex::new(vec![]), Instant::now())
    }

    /// Hack to make sure start time is initialized
    pub fn init(&self) {}

    /// Record a duration elapsed since `start`.
    pub fn elapsed(&self, typ: TimeType, start: Instant) {
        let mut times = self.0.lock().unwrap();
        times.push(TimeInfo {
            typ,
            dur: start.elapsed(),
        });
    }

    /// Print a full timing report to stdout.
    pub fn report(&self) {
        let total_time = self.1.elapsed().as_secs_f64();
        println!("{:<22}: {total_time:.1}s", "total");

        let times = self.0.lock().unwrap().clone();
        let totals = times
            .iter()
            .into_grouping_map_by(|info| info.typ)
            .fold(Duration::ZERO, |dur, _key, t| dur + t.dur);
        for typ in [
            TimeType::Interpret,
            TimeType::Check,
            TimeType::Solve,
            TimeType::Verify,
        ] {
            let time = totals.get(&typ).copied().unwrap_or(Duration::ZERO);
            println!("  {:<20}: {:.1}s", typ.name(), time.as_secs_f64());
        }
    }
}

lazy_static! {
    /// The process-wide timing registry.
    pub static ref TIMES: Timings = Timings::new();
}

/// Touch the registry so the session start time is the process start.
pub fn init() {
    TIMES.init()
}

/// Start a measurement.
pub fn start() -> Instant {
    Instant::now()
}

/// Finish a measurement into the given bucket.
pub fn elapsed(typ: TimeType, start: Instant) {
    TIMES.elapsed(typ, start)
}

/// Print the report.
pub fn report() {
    TIMES.report()
}
