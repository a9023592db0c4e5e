// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! The dfence binary's command-line interface.

use codespan_reporting::{
    files::SimpleFile,
    term::{
        self as terminal,
        termcolor::{ColorChoice, StandardStream},
    },
};
use exec::conf::Conf;
use ir::{parser, printer, timing};
use std::fs;
use std::path::Path;
use synth::driver::{self, DriverOpts, Outcome, TRACES_PER_ROUND};

/// Exit code for a bad trace found in verification-only mode.
pub const EXIT_BAD_TRACE: i32 = 253;
/// Exit code for a bad trace whose constraint is empty.
pub const EXIT_EMPTY_CONSTRAINT: i32 = 254;
/// Exit code for any other fatal error.
pub const EXIT_FATAL: i32 = 255;

#[derive(clap::Parser, Debug)]
#[command(about, long_about = None)]
/// Entrypoint for the dfence binary.
pub struct App {
    /// Path to the input IR file.
    file: String,

    /// Force interpretation: disable JIT. Required; the JIT path is unused
    /// for synthesis.
    #[arg(long)]
    force_interpreter: bool,

    /// How many traces should be exercised in each round.
    #[arg(long = "try", default_value_t = TRACES_PER_ROUND)]
    tries: u32,

    /// The entry function of the executable.
    #[arg(long, default_value = "main")]
    entry_function: String,

    /// Only check the property; report the first bad trace instead of
    /// synthesizing fences.
    #[arg(long)]
    verify_only: bool,

    /// Base seed for the randomized schedules (derived from the clock when
    /// absent).
    #[arg(long)]
    seed: Option<u64>,

    /// Optimization level (accepted for compatibility; the interpreter
    /// ignores it).
    #[arg(short = 'O', value_name = "LEVEL")]
    opt_level: Option<String>,

    /// Override target triple for module (compatibility; ignored).
    #[arg(long)]
    mtriple: Option<String>,

    /// Architecture to generate assembly for (compatibility; ignored).
    #[arg(long)]
    march: Option<String>,

    /// Target a specific cpu type (compatibility; ignored).
    #[arg(long)]
    mcpu: Option<String>,

    /// Target specific attributes (compatibility; ignored).
    #[arg(long)]
    mattr: Vec<String>,

    /// Override the 'argv[0]' value passed into the executing program.
    #[arg(long)]
    fake_argv0: Option<String>,

    /// Disable emission of core files if possible (compatibility; ignored).
    #[arg(long, hide = true)]
    disable_core_files: bool,

    /// Disable JIT lazy compilation (compatibility; ignored).
    #[arg(long)]
    disable_lazy_compilation: bool,

    /// Program arguments, passed to the guest after `--`.
    #[arg(last = true)]
    args: Vec<String>,
}

/// `<input>.ll` / `<input>.fixed.ll`, stripping a `.o` suffix like the
/// original tool.
fn artifact_path(input: &str, suffix: &str) -> String {
    match input.strip_suffix(".o") {
        Some(base) => format!("{base}{suffix}"),
        None => format!("{input}{suffix}"),
    }
}

impl App {
    /// Run the application; the return value is the process exit code.
    pub fn exec(self) -> i32 {
        let conf = match Conf::from_env() {
            Ok(conf) => conf,
            Err(err) => {
                eprintln!("{err}");
                return EXIT_FATAL;
            }
        };

        if !self.force_interpreter {
            eprintln!("the JIT path is unused for synthesis; pass --force-interpreter");
            return EXIT_FATAL;
        }

        let source = match fs::read_to_string(&self.file) {
            Ok(s) => s,
            Err(err) => {
                eprintln!("error loading program '{}': {err}", self.file);
                return EXIT_FATAL;
            }
        };

        let mut module = match parser::parse(&source) {
            Ok(m) => m,
            Err(err) => {
                let files = SimpleFile::new(self.file.clone(), &source);
                let writer = StandardStream::stderr(ColorChoice::Auto);
                let config = codespan_reporting::term::Config::default();
                let diagnostic = parser::parse_error_diagnostic((), &err);
                terminal::emit(&mut writer.lock(), &config, &files, &diagnostic).unwrap();
                return EXIT_FATAL;
            }
        };

        let labels = module.assign_labels();
        println!("There are {labels} instructions in total!");

        // persist the labeled input IR
        let labeled = artifact_path(&self.file, ".ll");
        if let Err(err) = fs::write(&labeled, printer::fmt(&module)) {
            eprintln!("could not write {labeled}: {err}");
            return EXIT_FATAL;
        }

        let mut argv = vec![self
            .fake_argv0
            .clone()
            .unwrap_or_else(|| self.file.clone())];
        argv.extend(self.args.iter().cloned());

        let seed = self.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos() as u64)
                .unwrap_or(0)
        });
        let opts = DriverOpts {
            tries: self.tries,
            entry: self.entry_function.clone(),
            argv,
            seed,
            fix: !self.verify_only,
        };

        let outcome = match driver::synthesize(&mut module, &conf, &opts) {
            Ok(outcome) => outcome,
            Err(err) => {
                eprintln!("{err}");
                return EXIT_FATAL;
            }
        };

        match outcome {
            Outcome::Converged { .. } => {
                let fixed = printer::fmt(&module);
                println!("/-----/ Printing out fixed IR /------/");
                print!("{fixed}");
                let path = artifact_path(&self.file, ".fixed.ll");
                if let Err(err) = fs::write(Path::new(&path), fixed) {
                    eprintln!("could not write {path}: {err}");
                    return EXIT_FATAL;
                }
                timing::report();
                0
            }
            Outcome::BadTrace => EXIT_BAD_TRACE,
            Outcome::EmptyConstraint => EXIT_EMPTY_CONSTRAINT,
            Outcome::Unsatisfiable => EXIT_FATAL,
        }
    }
}
