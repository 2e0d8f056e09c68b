//! XVM image inspector.
//!
//! Prints the section table, entry point and symbol table of an object image without
//! running it.
//!
//! # Usage
//! ```text
//! xinfo <program.xvm> [--disassemble]
//! ```

use std::env;
use std::fs;
use std::process;
use xvm::virtual_machine::isa::disassemble;
use xvm::virtual_machine::program::ProgramImage;
use xvm::virtual_machine::vm::EXIT_LOAD_REJECTED;
use xvm::{error, info};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let image_path = &args[1];
    let mut show_code = false;
    for arg in &args[2..] {
        match arg.as_str() {
            "--disassemble" | "-D" => show_code = true,
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let bytes = fs::read(image_path).unwrap_or_else(|e| {
        error!("Failed to read {}: {}", image_path, e);
        process::exit(1);
    });

    let image = ProgramImage::from_bytes(&bytes).unwrap_or_else(|e| {
        error!("{}: image rejected: {}", image_path, e);
        process::exit(EXIT_LOAD_REJECTED);
    });

    print!("{}", image.describe());

    if show_code && let Some(text) = image.text() {
        println!("Disassembly of .text");
        for line in disassemble(&text.bytes, text.base) {
            println!("  {line}");
        }
    }
}

const USAGE: &str = "\
XVM Image Inspector

USAGE:
    {program} <program.xvm> [OPTIONS]

OPTIONS:
    -D, --disassemble    Also print the decoded .text section
    -h, --help           Print this help message
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
