//! XVM compute service daemon.
//!
//! Serves the upload/execute/info menu over TCP. Uploaded images are kept in a
//! content-addressed store directory.
//!
//! # Usage
//! ```text
//! xvmd <listen_addr> [OPTIONS]
//! ```

use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use xvm::network::server::{Service, ServiceConfig};
use xvm::storage::program_store::FsProgramStore;
use xvm::{error, info};

const DEFAULT_STORE_DIR: &str = "/tmp/data";

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let listen_addr: SocketAddr = args[1].parse().unwrap_or_else(|_| {
        error!("Invalid listen address: {}", args[1]);
        process::exit(1);
    });

    let mut store_dir = PathBuf::from(DEFAULT_STORE_DIR);
    let mut config = ServiceConfig::from_env();
    let mut custom_paths: Option<Vec<PathBuf>> = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--store" => store_dir = PathBuf::from(flag_value(&args, &mut i)),
            "--timeout-ms" => {
                let ms = flag_value(&args, &mut i).parse::<u64>().unwrap_or_else(|_| {
                    error!("--timeout-ms expects a number of milliseconds");
                    process::exit(1);
                });
                config.limits.timeout = Duration::from_millis(ms);
            }
            "--allow-path" => {
                let path = PathBuf::from(flag_value(&args, &mut i));
                custom_paths.get_or_insert_with(Vec::new).push(path);
            }
            "--allow-network" => {
                config.sandbox.network.enabled = true;
                config.sandbox.network.allow_loopback = true;
                i += 1;
            }
            "--allow-host" => {
                let host = flag_value(&args, &mut i).parse::<Ipv4Addr>().unwrap_or_else(|_| {
                    error!("--allow-host expects an IPv4 address");
                    process::exit(1);
                });
                config.sandbox.network.enabled = true;
                config.sandbox.network.allowed_hosts.push(host);
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }
    if let Some(paths) = custom_paths {
        config.sandbox.allowed_paths = paths;
    }

    let store = FsProgramStore::open(&store_dir).unwrap_or_else(|e| {
        error!("Failed to open store {}: {}", store_dir.display(), e);
        process::exit(1);
    });

    let listener = TcpListener::bind(listen_addr).await.unwrap_or_else(|e| {
        error!("Failed to bind {}: {}", listen_addr, e);
        process::exit(1);
    });

    info!(
        "xvmd serving on {} (timeout {:?}, network {})",
        listen_addr,
        config.limits.timeout,
        if config.sandbox.network.enabled { "on" } else { "off" }
    );

    let service = Service::new(Arc::new(store), config);
    tokio::select! {
        result = service.serve(listener) => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
                process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
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
XVM Compute Service

USAGE:
    {program} <listen_addr> [OPTIONS]

ARGS:
    <listen_addr>    Address to listen on (e.g. 0.0.0.0:1337)

OPTIONS:
    --store <dir>         Program store directory (default /tmp/data)
    --timeout-ms <ms>     Wall-clock budget per execution (default 5000, or XVM_TIMEOUT_MS)
    --allow-path <path>   Allow OPEN under path (repeatable; replaces the default list)
    --allow-network       Enable guest sockets, loopback included
    --allow-host <ip>     Enable guest sockets to this IPv4 host only (repeatable)
    -h, --help            Print this help message
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
