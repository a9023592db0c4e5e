// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Run configuration, read from `$CONFDIR/conf.txt`.
//!
//! The file is line-oriented `KEY = VALUE`. When the checked property is SC
//! or LIN, the program selection also names a methods file next to conf.txt
//! (`wsq.txt`, `queue.txt`, ...) listing the recorded functions one per
//! line.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The environment variable naming the configuration directory.
pub const CONFDIR: &str = "CONFDIR";

/// The target weak memory model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wmm {
    /// Sequentially consistent: no buffering.
    None,
    /// Total store order: one FIFO store buffer per thread.
    Tso,
    /// Partial store order: one FIFO per thread and address.
    Pso,
}

/// The checked correctness criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    /// No checking; the guest just runs.
    None,
    /// Sequential consistency.
    Sc,
    /// Linearizability (SC plus real-time order).
    Lin,
}

/// Which benchmark's reference implementation and recorded methods to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    /// Chase-Lev work-stealing queue.
    WsqChase,
    /// LIFO work-stealing queue.
    WsqLifo,
    /// FIFO work-stealing queue.
    WsqFifo,
    /// THE work-stealing queue.
    WsqThe,
    /// Anchor work-stealing queue.
    WsqAnchor,
    /// Lock-free malloc.
    LfMalloc,
    /// Lock-free skip list.
    SkipList,
    /// Michael-Scott queue (MS2 and MSN share one reference).
    Queue,
    /// Snark double-ended queue.
    Deque,
    /// Linked set (lazy list and Harris share one reference).
    LinkSet,
}

/// The scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Uniformly random thread switches and buffer flushes.
    Random,
    /// Deterministic round robin (TSO only).
    Dbrr,
    /// Reserved; not implemented.
    Predictive,
}

/// The parsed configuration.
#[derive(Debug, Clone)]
pub struct Conf {
    /// Probability that the scheduler flushes instead of switching.
    pub flush_prob: f64,
    /// Memory model.
    pub wmm: Wmm,
    /// Checked property.
    pub property: Property,
    /// Benchmark selection, when a property is checked.
    pub program: Option<ProgramKind>,
    /// Whether shared read/write logging is enabled.
    pub logging: bool,
    /// Scheduling policy.
    pub scheduler: SchedPolicy,
    /// Function names recorded in the invocation history.
    pub recorded: HashSet<String>,
}

impl Default for Conf {
    fn default() -> Conf {
        Conf {
            flush_prob: 1.0,
            wmm: Wmm::None,
            property: Property::None,
            program: None,
            logging: false,
            scheduler: SchedPolicy::Random,
            recorded: HashSet::new(),
        }
    }
}

/// A configuration intake failure. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfError {
    /// `$CONFDIR` is not set.
    #[error("the {CONFDIR} environment variable is not defined")]
    MissingConfDir,
    /// The configuration or methods file could not be read.
    #[error("unable to open {0}")]
    Unreadable(PathBuf),
    /// A line was not `KEY = VALUE`.
    #[error("malformed configuration line: {0:?}")]
    MalformedLine(String),
    /// An unknown key.
    #[error("no such configuration option: {0}")]
    UnknownKey(String),
    /// A bad value for a known key.
    #[error("bad value {value:?} for {key}")]
    BadValue {
        /// The key.
        key: String,
        /// The offending value.
        value: String,
    },
}

impl ProgramKind {
    /// The methods file this program records, relative to the conf dir.
    pub fn methods_file(&self) -> &'static str {
        match self {
            ProgramKind::WsqChase
            | ProgramKind::WsqLifo
            | ProgramKind::WsqFifo
            | ProgramKind::WsqThe
            | ProgramKind::WsqAnchor => "wsq.txt",
            ProgramKind::LfMalloc => "malloc.txt",
            ProgramKind::SkipList => "skip.txt",
            ProgramKind::Queue => "queue.txt",
            ProgramKind::Deque => "deque.txt",
            ProgramKind::LinkSet => "linkset.txt",
        }
    }
}

impl Conf {
    /// Whether the trace recorder is active.
    pub fn rec_trace(&self) -> bool {
        matches!(self.property, Property::Sc | Property::Lin)
    }

    /// Read the configuration from `$CONFDIR/conf.txt`, echoing the
    /// recognized parameters the way the tool always has.
    pub fn from_env() -> Result<Conf, ConfError> {
        let dir = std::env::var(CONFDIR).map_err(|_| ConfError::MissingConfDir)?;
        Conf::load(Path::new(&dir))
    }

    /// Read the configuration from `dir/conf.txt`.
    pub fn load(dir: &Path) -> Result<Conf, ConfError> {
        let conf_path = dir.join("conf.txt");
        let text =
            fs::read_to_string(&conf_path).map_err(|_| ConfError::Unreadable(conf_path))?;

        println!("PARAMETERS OF THE EXECUTION");
        let mut conf = Conf::parse(&text)?;

        if conf.rec_trace() {
            let program = conf.program.ok_or_else(|| ConfError::BadValue {
                key: "PROGRAM".to_string(),
                value: "(unset)".to_string(),
            })?;
            let methods_path = dir.join(program.methods_file());
            let methods = fs::read_to_string(&methods_path)
                .map_err(|_| ConfError::Unreadable(methods_path))?;
            for name in methods.split_whitespace() {
                println!("Recording function {name}");
                conf.recorded.insert(name.to_string());
            }
        }
        println!("END OF PARAMETERS OF EXECUTION");
        Ok(conf)
    }

    /// Parse the `KEY = VALUE` body of conf.txt.
    pub fn parse(text: &str) -> Result<Conf, ConfError> {
        let mut conf = Conf::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => return Err(ConfError::MalformedLine(line.to_string())),
            };
            let bad = || ConfError::BadValue {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "FLUSHPROB" => {
                    conf.flush_prob = value.parse().map_err(|_| bad())?;
                    println!("Flush Probability: {}", conf.flush_prob);
                }
                "WMM" => {
                    conf.wmm = match value {
                        "NONE" => Wmm::None,
                        "TSO" => Wmm::Tso,
                        "PSO" => Wmm::Pso,
                        _ => return Err(bad()),
                    };
                    println!("Model: {value}");
                }
                "PROPERTY" => {
                    conf.property = match value {
                        "SC" => Property::Sc,
                        "LIN" => Property::Lin,
                        _ => return Err(bad()),
                    };
                    println!("Property: {value}");
                }
                "PROGRAM" => {
                    conf.program = Some(match value {
                        "WSQ_CHASE" => ProgramKind::WsqChase,
                        "WSQ_LIFO" => ProgramKind::WsqLifo,
                        "WSQ_FIFO" => ProgramKind::WsqFifo,
                        "WSQ_THE" => ProgramKind::WsqThe,
                        "WSQ_ANCHOR" => ProgramKind::WsqAnchor,
                        "LF_MALLOC" => ProgramKind::LfMalloc,
                        "SKIP_LIST" => ProgramKind::SkipList,
                        "MS2" | "MSN" => ProgramKind::Queue,
                        "SNARK" => ProgramKind::Deque,
                        "LAZYLIST" | "HARRIS" => ProgramKind::LinkSet,
                        _ => return Err(bad()),
                    });
                    println!("Program : {value}");
                }
                "LOG" => {
                    conf.logging = match value {
                        "true" => true,
                        "false" => false,
                        _ => return Err(bad()),
                    };
                    println!(
                        "Shared read-write logging: {}",
                        if conf.logging { "yes" } else { "no" }
                    );
                }
                "SCHEDULER" => {
                    conf.scheduler = match value {
                        "RANDOM" => SchedPolicy::Random,
                        "DBRR" => SchedPolicy::Dbrr,
                        "PREDICTIVE" => SchedPolicy::Predictive,
                        _ => return Err(bad()),
                    };
                    println!("Scheduler: {value}");
                }
                _ => return Err(ConfError::UnknownKey(key.to_string())),
            }
        }
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let conf = Conf::parse(
            "FLUSHPROB = 0.4\n\
             WMM = TSO\n\
             PROPERTY = LIN\n\
             PROGRAM = WSQ_CHASE\n\
             LOG = true\n\
             SCHEDULER = RANDOM\n",
        )
        .expect("conf should parse");
        assert_eq!(conf.flush_prob, 0.4);
        assert_eq!(conf.wmm, Wmm::Tso);
        assert_eq!(conf.property, Property::Lin);
        assert_eq!(conf.program, Some(ProgramKind::WsqChase));
        assert!(conf.logging);
        assert!(conf.rec_trace());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            Conf::parse("WMM = WEIRD"),
            Err(ConfError::BadValue { .. })
        ));
        assert!(matches!(
            Conf::parse("COLOR = blue"),
            Err(ConfError::UnknownKey(_))
        ));
        assert!(matches!(
            Conf::parse("just some words"),
            Err(ConfError::MalformedLine(_))
        ));
    }

    #[test]
    fn test_program_aliases() {
        let msn = Conf::parse("PROGRAM = MSN").unwrap();
        let ms2 = Conf::parse("PROGRAM = MS2").unwrap();
        assert_eq!(msn.program, Some(ProgramKind::Queue));
        assert_eq!(ms2.program, msn.program);
        let harris = Conf::parse("PROGRAM = HARRIS").unwrap();
        assert_eq!(harris.program, Some(ProgramKind::LinkSet));
    }
}
