// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

use clap::Parser;
use dfence::App;
use ir::timing;
use std::process;

fn main() {
    pretty_env_logger::init();
    let app = App::parse();
    timing::init();
    process::exit(app.exec());
}
