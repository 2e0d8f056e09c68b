//! XVM program runner.
//!
//! Loads an object image, runs it against the process console and exits with the run's
//! status.
//!
//! # Usage
//! ```text
//! xvm <program.xvm> [OPTIONS]
//! ```
//!
//! # Exit status
//! - `0`: the program halted
//! - `1`: the program faulted
//! - `2`: the time budget or instruction cap ran out
//! - `3`: the image was rejected by the loader

use std::env;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use xvm::virtual_machine::sandbox::SandboxConfig;
use xvm::virtual_machine::vm::context::{Deadline, Host, RunLimits};
use xvm::virtual_machine::vm::{EXIT_LOAD_REJECTED, Outcome, run_image_until};
use xvm::{debug, error, info, warn};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let image_path = &args[1];
    let mut limits = RunLimits::from_env();
    let mut sandbox = SandboxConfig::from_env();
    let mut custom_paths: Option<Vec<PathBuf>> = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--timeout-ms" => {
                let ms = flag_value(&args, &mut i).parse::<u64>().unwrap_or_else(|_| {
                    error!("--timeout-ms expects a number of milliseconds");
                    process::exit(1);
                });
                limits.timeout = Duration::from_millis(ms);
            }
            "--max-steps" => {
                let steps = flag_value(&args, &mut i).parse::<u64>().unwrap_or_else(|_| {
                    error!("--max-steps expects an instruction count");
                    process::exit(1);
                });
                limits.max_steps = Some(steps);
            }
            "--allow-path" => {
                let path = PathBuf::from(flag_value(&args, &mut i));
                custom_paths.get_or_insert_with(Vec::new).push(path);
            }
            "--allow-network" => {
                sandbox.network.enabled = true;
                sandbox.network.allow_loopback = true;
                i += 1;
            }
            "--allow-host" => {
                let host = flag_value(&args, &mut i).parse::<Ipv4Addr>().unwrap_or_else(|_| {
                    error!("--allow-host expects an IPv4 address");
                    process::exit(1);
                });
                sandbox.network.enabled = true;
                sandbox.network.allowed_hosts.push(host);
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }
    if let Some(paths) = custom_paths {
        sandbox.allowed_paths = paths;
    }

    let bytes = fs::read(image_path).unwrap_or_else(|e| {
        error!("Failed to read {}: {}", image_path, e);
        process::exit(EXIT_LOAD_REJECTED);
    });

    let deadline = Deadline::after(limits.timeout);
    let host = Host::console(sandbox, deadline);
    let report = match run_image_until(&bytes, host, deadline, limits.max_steps) {
        Ok(report) => report,
        Err(e) => {
            error!("{}: image rejected: {}", image_path, e);
            process::exit(EXIT_LOAD_REJECTED);
        }
    };

    for failure in &report.syscall_errors {
        debug!("{failure}");
    }
    match &report.outcome {
        Outcome::Halted => info!("halted after {} steps in {:?}", report.steps, report.elapsed),
        Outcome::Faulted(fault) => warn!("faulted after {} steps: {}", report.steps, fault),
        Outcome::TimedOut => warn!("timed out after {} steps", report.steps),
    }
    process::exit(report.exit_code());
}

/// Returns the value following the flag at `args[*i]` and advances past both.
fn flag_value<'a>(args: &'a [String], i: &mut usize) -> &'a str {
    let flag = &args[*i];
    *i += 1;
    if *i >= args.len() {
        error!("{flag} requires an argument");
        process::exit(1);
    }
    let value = &args[*i];
    *i += 1;
    value
}

const USAGE: &str = "\
XVM Runner

USAGE:
    {program} <program.xvm> [OPTIONS]

ARGS:
    <program.xvm>    Object image produced by xasm

OPTIONS:
    --timeout-ms <ms>     Wall-clock budget (default 5000, or XVM_TIMEOUT_MS)
    --max-steps <n>       Stop after n instructions
    --allow-path <path>   Allow OPEN under path (repeatable; replaces the default list)
    --allow-network       Enable sockets, loopback included
    --allow-host <ip>     Enable sockets to this IPv4 host only (repeatable)
    -h, --help            Print this help message

EXIT STATUS:
    0 halted, 1 faulted, 2 timed out, 3 image rejected
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
