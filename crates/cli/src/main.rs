// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use poppo::config::{Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Worker(args)) => {
            // Workers log to their redirected stdio capture.
            poppo::run::init_tracing("info", "text");
            std::process::exit(poppo::worker::run(&args.instruction).await);
        }
        None => match poppo::run::run(cli.args).await {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                eprintln!("fatal: {e:#}");
                error!("fatal: {e:#}");
                std::process::exit(1);
            }
        },
    }
}
