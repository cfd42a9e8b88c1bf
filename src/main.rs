//! dbt CLI entry point: argument parsing, logging setup, and exit-code
//! dispatch around the orchestrator.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use dbt::orchestrator::{self, Invocation, Outcome};
use dbt::version::Version;
use docopt::Docopt;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

const USAGE: &str = "
dbt: trusted-bootstrap launcher for single-file tools.

Usage:
  dbt [-v <semver>] [-o] [-V] [-s <name>] [--] <tool> [<args>...]
  dbt --version
  dbt --help

Options:
  -v <semver>   Pin the tool to this exact version (default: latest).
  -o            Force offline mode: no network requests.
  -V            Enable verbose (debug) logging.
  -s <name>     Select a configured server by name.
  --version     Print the launcher version and exit.
  -h --help     Print this help and exit.
";

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct Args {
    flag_v: Option<String>,
    flag_o: bool,
    flag_V: bool,
    flag_s: Option<String>,
    flag_version: bool,
    arg_tool: Option<String>,
    arg_args: Vec<String>,
}

fn init_logging(verbose: bool) {
    if verbose && env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn main() -> ExitCode {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    init_logging(args.flag_V);

    if args.flag_version {
        println!("dbt {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let version_pin = match args.flag_v.as_deref().map(str::parse::<Version>) {
        Some(Ok(v)) => Some(v),
        Some(Err(e)) => {
            eprintln!("error: invalid -v version: {e}");
            return ExitCode::from(2);
        }
        None => None,
    };

    let invocation = Invocation {
        home: home_dir(),
        server_name: args.flag_s,
        offline: args.flag_o,
        verbose: args.flag_V,
        version_pin,
        tool: args.arg_tool,
        tool_args: args.arg_args,
    };

    match orchestrator::run(invocation) {
        Ok(Outcome::HelpPrinted) => {
            println!("{USAGE}");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Exec { path, args }) => match orchestrator::replace_process(&path, &args) {
            Ok(err) => {
                log::error!("{err}");
                eprintln!("error: {err}");
                ExitCode::from(err.exit_code() as u8)
            }
            Err(e) => {
                log::error!("{e:#}");
                eprintln!("error: {e:#}");
                ExitCode::from(10)
            }
        },
        Err(err) => {
            log::error!("{err}");
            eprintln!("error: {err}");
            if err.suggest_offline() {
                eprintln!("hint: retry with -o to use the local cache");
            }
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
